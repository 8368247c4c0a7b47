//! Registry of live connections.

use crate::error::{Result, SyncError};
use crate::types::{ConnectionId, Timestamp};
use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use super::types::{ConnectionEvent, ConnectionInfo, ConnectionListenerHandle};

/// Default buffer size for connection listeners.
const DEFAULT_LISTENER_BUFFER: usize = 256;

/// Tracks live connections and their liveness.
pub struct ConnectionRegistry {
    /// Live connections by id.
    connections: RwLock<HashMap<ConnectionId, ConnectionInfo>>,
    /// Counter for generating connection ids.
    next_id: AtomicU32,
    /// Listener channels by listener id.
    listeners: RwLock<HashMap<u64, Sender<ConnectionEvent>>>,
    next_listener_id: AtomicU64,
    listener_buffer: usize,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::with_listener_buffer(DEFAULT_LISTENER_BUFFER)
    }

    /// Create an empty registry with a custom listener buffer size.
    pub fn with_listener_buffer(listener_buffer: usize) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            listeners: RwLock::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
            listener_buffer: listener_buffer.max(1),
        }
    }

    /// Register a connection whose handshake has completed.
    pub fn register(&self, info: ConnectionInfo) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.connections.write().insert(id, info.clone());
        tracing::debug!(
            connection = %id,
            remote_id = %info.remote_id,
            version = %info.protocol_version,
            "connection registered"
        );
        self.broadcast(ConnectionEvent::Connected { id, info });
        id
    }

    /// Refresh the liveness timestamp of a connection.
    ///
    /// Timestamps older than the recorded one are ignored.
    pub fn touch(&self, id: ConnectionId, timestamp: Timestamp) -> Result<()> {
        let mut connections = self.connections.write();
        let info = connections
            .get_mut(&id)
            .ok_or(SyncError::ConnectionNotFound(id))?;
        let timestamp = timestamp.or_now();
        if timestamp > info.last_update {
            info.last_update = timestamp;
        }
        Ok(())
    }

    /// Evict every connection silent for longer than `timeout`.
    ///
    /// Returns the evicted ids in ascending order.
    pub fn evict_stale(&self, now: Timestamp, timeout: Duration) -> Vec<ConnectionId> {
        let evicted: Vec<(ConnectionId, ConnectionInfo)> = {
            let mut connections = self.connections.write();
            let mut stale: Vec<ConnectionId> = connections
                .iter()
                .filter(|(_, info)| now.saturating_duration_since(info.last_update) > timeout)
                .map(|(id, _)| *id)
                .collect();
            stale.sort();
            stale
                .into_iter()
                .filter_map(|id| connections.remove(&id).map(|info| (id, info)))
                .collect()
        };

        for (id, info) in &evicted {
            tracing::debug!(connection = %id, remote_id = %info.remote_id, "evicted stale connection");
            self.broadcast(ConnectionEvent::Disconnected {
                id: *id,
                info: info.clone(),
            });
        }

        evicted.into_iter().map(|(id, _)| id).collect()
    }

    /// Remove a connection explicitly.
    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        let info = self.connections.write().remove(&id)?;
        self.broadcast(ConnectionEvent::Disconnected {
            id,
            info: info.clone(),
        });
        Some(info)
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.read().get(&id).cloned()
    }

    /// Snapshot of all live connections, ordered by id.
    pub fn list(&self) -> Vec<(ConnectionId, ConnectionInfo)> {
        let mut all: Vec<_> = self
            .connections
            .read()
            .iter()
            .map(|(id, info)| (*id, info.clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    // --- Listeners ---

    /// Subscribe to connection events.
    pub fn listen(&self) -> ConnectionListenerHandle {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = bounded(self.listener_buffer);
        self.listeners.write().insert(id, sender);
        ConnectionListenerHandle { id, receiver }
    }

    pub fn unlisten(&self, id: u64) {
        self.listeners.write().remove(&id);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Send an event to every listener. Drops listeners that fail to receive.
    fn broadcast(&self, event: ConnectionEvent) {
        let mut to_remove = Vec::new();

        {
            let listeners = self.listeners.read();
            for (id, sender) in listeners.iter() {
                if sender.try_send(event.clone()).is_err() {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut listeners = self.listeners.write();
            for id in to_remove {
                listeners.remove(&id);
            }
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
