//! Engine configuration.

use std::time::Duration;

/// Configuration for a [`SyncEngine`](crate::SyncEngine).
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Identity this instance reports to peers.
    pub identity: String,

    /// Connections silent for this long are evicted.
    pub liveness_timeout: Duration,

    /// Lower bound applied to every subscription's `periodic`, in seconds.
    pub min_period: f64,

    /// Buffer size for connection listeners.
    pub listener_buffer_size: usize,

    /// Whether this instance is the central coordinator. Servers relay
    /// remote updates to other connections; clients do not.
    pub server: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            identity: "nettable".to_string(),
            liveness_timeout: Duration::from_secs(5),
            min_period: 0.005,
            listener_buffer_size: 1024,
            server: true,
        }
    }
}
