//! Connection types.

use crate::protocol::ProtocolVersion;
use crate::types::{ConnectionId, Timestamp};
use serde::{Deserialize, Serialize};

/// Information about a live connection to a remote peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Identity the remote node announced for itself.
    pub remote_id: String,
    pub remote_ip: String,
    pub remote_port: u16,
    /// Last time any message was received from the peer.
    pub last_update: Timestamp,
    /// Negotiated at handshake; fixed for the lifetime of the connection.
    pub protocol_version: ProtocolVersion,
}

/// Lifecycle of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Established,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        matches!(
            (self, next),
            (ConnectionState::Connecting, ConnectionState::Established)
                | (ConnectionState::Connecting, ConnectionState::Closed)
                | (ConnectionState::Established, ConnectionState::Closing)
                | (ConnectionState::Closing, ConnectionState::Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Closed
    }
}

/// Why a connection was closed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Local or remote explicit disconnect.
    Disconnected,
    /// No message within the liveness timeout.
    Stale,
    /// The transport failed while flushing.
    TransportError(String),
}

/// Events emitted to connection listeners.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionEvent {
    Connected {
        id: ConnectionId,
        info: ConnectionInfo,
    },
    Disconnected {
        id: ConnectionId,
        info: ConnectionInfo,
    },
}

/// Handle for receiving connection events.
pub struct ConnectionListenerHandle {
    pub id: u64,
    pub receiver: crossbeam_channel::Receiver<ConnectionEvent>,
}

impl ConnectionListenerHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<ConnectionEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<ConnectionEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<ConnectionEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use ConnectionState::*;
        assert!(Connecting.can_transition_to(Established));
        assert!(Established.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Established));
        assert!(!Established.can_transition_to(Connecting));
        assert!(!Closing.can_transition_to(Established));
        assert!(Closed.is_terminal());
    }
}
