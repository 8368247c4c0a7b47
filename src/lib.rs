//! # NetTable
//!
//! An eventually-consistent key-value table shared between a central
//! coordinator and its connected peers.
//!
//! ## Core Concepts
//!
//! - **Topics**: Named, typed slots; the type is fixed by the first publisher
//! - **Publishers/Subscribers**: Write and read bindings to topics or prefixes
//! - **Delivery policy**: Per-subscriber options decide which updates are
//!   queued, how they coalesce and how often they cross the network
//! - **Connections**: Peers with a negotiated protocol version and liveness
//!
//! ## Example
//!
//! ```ignore
//! use nettable::{EngineConfig, PubSubOption, SyncEngine, Timestamp};
//!
//! let engine = SyncEngine::new(EngineConfig::default(), transport);
//!
//! let speed = engine.create_publisher("/drive/speed", "double", json!({}))?;
//! let sub = engine.subscribe("/drive/", &[PubSubOption::PrefixMatch(true)]);
//!
//! engine.publish(speed, 1.5, Timestamp::NOW)?;
//! for update in engine.read_queue(sub)? {
//!     println!("{} = {:?}", update.name, update.value);
//! }
//! ```

pub mod config;
pub mod connections;
pub mod datalog;
pub mod engine;
pub mod error;
pub mod options;
pub mod protocol;
pub mod subscriptions;
pub mod topics;
pub mod types;

// Re-exports
pub use config::EngineConfig;
pub use connections::{
    CloseReason, ConnectionEvent, ConnectionInfo, ConnectionListenerHandle, ConnectionRegistry,
    ConnectionState,
};
pub use datalog::{DataLog, DataLogEntry, FileDataLog, LogEntryId, LogRecord, MemoryDataLog};
pub use engine::{
    DataLoggerId, EngineStats, FlushOutcome, FlushWorker, Handshake, PublishReport, SyncEngine,
};
pub use error::{Result, SyncError};
pub use options::{PubSubOption, PubSubOptions};
pub use protocol::{
    InboundMessage, MessageKind, OutboundMessage, ProtocolFeatures, ProtocolVersion, TopicFlags,
    Transport, TransportError,
};
pub use subscriptions::{
    evaluate, should_deliver, Admission, Delivery, QueueMode, RejectReason, SubscriberContext,
    SubscriptionQueue, TopicEvent, TopicListenerConfig, TopicListenerHandle, TopicListeners,
};
pub use topics::{CurrentValue, Owner, TopicInfo, TopicRegistry};
pub use types::*;
