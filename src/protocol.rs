//! Transport boundary and protocol-version feature table.
//!
//! Byte framing lives outside this crate. The transport hands the engine
//! already-parsed [`InboundMessage`]s and receives [`OutboundMessage`]s through
//! the [`Transport`] trait. Which message kinds a peer understands is looked up
//! in a static table keyed by the negotiated [`ProtocolVersion`].

use crate::options::PubSubOption;
use crate::types::{ConnectionId, Timestamp, TopicId, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version: high byte major, low byte minor (0x0300 = 3.0).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion(pub u16);

impl ProtocolVersion {
    pub const V2_0: ProtocolVersion = ProtocolVersion(0x0200);
    pub const V3_0: ProtocolVersion = ProtocolVersion(0x0300);
    pub const V4_0: ProtocolVersion = ProtocolVersion(0x0400);

    pub fn major(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn minor(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    /// Feature set for this version, if it is one we speak.
    pub fn features(self) -> Option<&'static ProtocolFeatures> {
        PROTOCOL_TABLE.iter().find(|f| f.version == self)
    }
}

impl fmt::Debug for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProtocolVersion({}.{})", self.major(), self.minor())
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}

/// Message kinds, shared by inbound and outbound directions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MessageKind {
    KeepAlive,
    Publish,
    Unpublish,
    ValueUpdate,
    Announce,
    Unannounce,
    FlagsUpdate,
    TopicDelete,
    ClearTopics,
    Subscribe,
    Unsubscribe,
    Properties,
}

/// What a protocol version supports.
#[derive(Debug)]
pub struct ProtocolFeatures {
    pub version: ProtocolVersion,
    kinds: &'static [MessageKind],
}

impl ProtocolFeatures {
    pub fn supports(&self, kind: MessageKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Peers without explicit subscribe messages receive every topic.
    pub fn implicit_subscribe_all(&self) -> bool {
        !self.supports(MessageKind::Subscribe)
    }
}

const V2_KINDS: &[MessageKind] = &[
    MessageKind::KeepAlive,
    MessageKind::Publish,
    MessageKind::Unpublish,
    MessageKind::ValueUpdate,
    MessageKind::Announce,
];

const V3_KINDS: &[MessageKind] = &[
    MessageKind::KeepAlive,
    MessageKind::Publish,
    MessageKind::Unpublish,
    MessageKind::ValueUpdate,
    MessageKind::Announce,
    MessageKind::Unannounce,
    MessageKind::FlagsUpdate,
    MessageKind::TopicDelete,
    MessageKind::ClearTopics,
];

const V4_KINDS: &[MessageKind] = &[
    MessageKind::KeepAlive,
    MessageKind::Publish,
    MessageKind::Unpublish,
    MessageKind::ValueUpdate,
    MessageKind::Announce,
    MessageKind::Unannounce,
    MessageKind::FlagsUpdate,
    MessageKind::TopicDelete,
    MessageKind::ClearTopics,
    MessageKind::Subscribe,
    MessageKind::Unsubscribe,
    MessageKind::Properties,
];

static PROTOCOL_TABLE: [ProtocolFeatures; 3] = [
    ProtocolFeatures {
        version: ProtocolVersion::V2_0,
        kinds: V2_KINDS,
    },
    ProtocolFeatures {
        version: ProtocolVersion::V3_0,
        kinds: V3_KINDS,
    },
    ProtocolFeatures {
        version: ProtocolVersion::V4_0,
        kinds: V4_KINDS,
    },
];

/// Topic flags carried by announcements and flag updates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicFlags {
    /// Survives having no publishers and is skipped by `clear_topics`.
    pub persistent: bool,
    /// Survives having no publishers.
    pub retained: bool,
}

/// A parsed message received from a peer.
///
/// Publisher and subscriber ids are the peer's own ids, scoped to the
/// connection.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundMessage {
    KeepAlive,
    Publish {
        pubuid: u32,
        name: String,
        type_str: String,
        properties: serde_json::Value,
    },
    Unpublish {
        pubuid: u32,
    },
    ValueUpdate {
        pubuid: u32,
        value: Value,
        timestamp: Timestamp,
    },
    Subscribe {
        subuid: u32,
        topics: Vec<String>,
        options: Vec<PubSubOption>,
    },
    Unsubscribe {
        subuid: u32,
    },
    SetProperties {
        name: String,
        update: serde_json::Value,
    },
    SetFlags {
        name: String,
        flags: TopicFlags,
    },
    DeleteTopic {
        name: String,
    },
    ClearTopics,
}

impl InboundMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            InboundMessage::KeepAlive => MessageKind::KeepAlive,
            InboundMessage::Publish { .. } => MessageKind::Publish,
            InboundMessage::Unpublish { .. } => MessageKind::Unpublish,
            InboundMessage::ValueUpdate { .. } => MessageKind::ValueUpdate,
            InboundMessage::Subscribe { .. } => MessageKind::Subscribe,
            InboundMessage::Unsubscribe { .. } => MessageKind::Unsubscribe,
            InboundMessage::SetProperties { .. } => MessageKind::Properties,
            InboundMessage::SetFlags { .. } => MessageKind::FlagsUpdate,
            InboundMessage::DeleteTopic { .. } => MessageKind::TopicDelete,
            InboundMessage::ClearTopics => MessageKind::ClearTopics,
        }
    }
}

/// A message the engine asks the transport to deliver.
#[derive(Clone, Debug, PartialEq)]
pub enum OutboundMessage {
    Announce {
        name: String,
        id: TopicId,
        type_str: String,
        properties: serde_json::Value,
        flags: TopicFlags,
    },
    Unannounce {
        name: String,
        id: TopicId,
    },
    Properties {
        name: String,
        properties: serde_json::Value,
    },
    FlagsUpdate {
        id: TopicId,
        flags: TopicFlags,
    },
    ValueUpdate {
        id: TopicId,
        value: Value,
        timestamp: Timestamp,
    },
    ClearTopics,
}

impl OutboundMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            OutboundMessage::Announce { .. } => MessageKind::Announce,
            OutboundMessage::Unannounce { .. } => MessageKind::Unannounce,
            OutboundMessage::Properties { .. } => MessageKind::Properties,
            OutboundMessage::FlagsUpdate { .. } => MessageKind::FlagsUpdate,
            OutboundMessage::ValueUpdate { .. } => MessageKind::ValueUpdate,
            OutboundMessage::ClearTopics => MessageKind::ClearTopics,
        }
    }
}

/// Error reported by a transport. Confined to the connection it occurred on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError(pub String);

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for TransportError {}

/// Outbound half of the network boundary.
///
/// `send` may block on I/O; the engine never holds its table lock while
/// calling it.
pub trait Transport: Send + Sync {
    fn send(&self, connection: ConnectionId, message: OutboundMessage)
        -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_bytes() {
        assert_eq!(ProtocolVersion::V3_0.major(), 3);
        assert_eq!(ProtocolVersion::V3_0.minor(), 0);
        assert_eq!(ProtocolVersion(0x0401).to_string(), "4.1");
    }

    #[test]
    fn test_feature_table() {
        let v2 = ProtocolVersion::V2_0.features().unwrap();
        assert!(v2.supports(MessageKind::ValueUpdate));
        assert!(!v2.supports(MessageKind::FlagsUpdate));
        assert!(v2.implicit_subscribe_all());

        let v3 = ProtocolVersion::V3_0.features().unwrap();
        assert!(v3.supports(MessageKind::ClearTopics));
        assert!(!v3.supports(MessageKind::Properties));

        let v4 = ProtocolVersion::V4_0.features().unwrap();
        assert!(v4.supports(MessageKind::Subscribe));
        assert!(!v4.implicit_subscribe_all());

        assert!(ProtocolVersion(0x0100).features().is_none());
    }
}
