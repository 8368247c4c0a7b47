//! Error types for the table.

use crate::connections::ConnectionState;
use crate::types::{ConnectionId, PublisherId, SubscriberId};
use thiserror::Error;

/// Main error type for table operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Type mismatch on topic {topic}: expected {expected}, got {got}")]
    TypeMismatch {
        topic: String,
        expected: String,
        got: String,
    },

    #[error("Topic not found: {0}")]
    UnknownTopic(String),

    #[error("Publisher not found: {0}")]
    PublisherNotFound(PublisherId),

    #[error("Subscriber not found: {0}")]
    SubscriberNotFound(SubscriberId),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(ConnectionId),

    #[error("Connection is closing: {0}")]
    ConnectionStale(ConnectionId),

    #[error("Unsupported protocol version: {0:#06x}")]
    UnsupportedProtocol(u16),

    #[error("Invalid connection transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("Invalid topic name: {0:?}")]
    InvalidName(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Log is locked by another process")]
    Locked,
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SyncError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SyncError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SyncError::Deserialization(e.to_string())
    }
}

/// Result type for table operations.
pub type Result<T> = std::result::Result<T, SyncError>;
