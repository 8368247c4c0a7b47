//! Connection tracking.
//!
//! The registry records identity, address, negotiated protocol version and
//! last-activity time for each live peer, and evicts peers that stay silent
//! past the liveness timeout.

mod registry;
mod types;

pub use registry::ConnectionRegistry;
pub use types::{
    CloseReason, ConnectionEvent, ConnectionInfo, ConnectionListenerHandle, ConnectionState,
};
