//! Topic listeners: in-process notification of topic lifecycle changes.

use crate::protocol::TopicFlags;
use crate::topics::TopicInfo;
use crate::types::TopicId;
use crossbeam_channel::{bounded, Sender};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Configuration for a topic listener.
#[derive(Clone, Debug)]
pub struct TopicListenerConfig {
    /// Max buffered events before the listener is dropped.
    /// Default: 1000
    pub buffer_size: usize,

    /// Only topics whose name starts with this prefix.
    pub prefix: String,
}

impl Default for TopicListenerConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            prefix: String::new(),
        }
    }
}

/// Topic lifecycle events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TopicEvent {
    /// A topic gained a type (first publisher, or re-publish after removal).
    Announced { info: TopicInfo },

    /// A topic lost its type (deleted, or last publisher gone).
    Unannounced { name: String, id: TopicId },

    /// Properties changed.
    Properties {
        name: String,
        properties: serde_json::Value,
    },

    /// Flags changed.
    Flags { name: String, flags: TopicFlags },

    /// Listener was dropped for falling behind.
    Dropped,
}

impl TopicEvent {
    fn topic_name(&self) -> Option<&str> {
        match self {
            TopicEvent::Announced { info } => Some(&info.name),
            TopicEvent::Unannounced { name, .. }
            | TopicEvent::Properties { name, .. }
            | TopicEvent::Flags { name, .. } => Some(name),
            TopicEvent::Dropped => None,
        }
    }
}

/// Handle to a topic listener.
pub struct TopicListenerHandle {
    pub id: u64,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<TopicEvent>,
}

impl TopicListenerHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<TopicEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<TopicEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<TopicEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

struct Listener {
    prefix: String,
    sender: Sender<TopicEvent>,
}

impl Listener {
    fn matches(&self, event: &TopicEvent) -> bool {
        event
            .topic_name()
            .map(|name| name.starts_with(&self.prefix))
            .unwrap_or(false)
    }
}

/// Set of topic listeners with broadcast.
pub struct TopicListeners {
    listeners: RwLock<HashMap<u64, Listener>>,
    next_id: AtomicU64,
}

impl TopicListeners {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn listen(&self, config: TopicListenerConfig) -> TopicListenerHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = bounded(config.buffer_size.max(1));
        self.listeners.write().insert(
            id,
            Listener {
                prefix: config.prefix,
                sender,
            },
        );
        TopicListenerHandle { id, receiver }
    }

    pub fn unlisten(&self, id: u64) {
        self.listeners.write().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Send events to every matching listener. Drops listeners that fail to
    /// receive.
    pub fn broadcast(&self, events: &[TopicEvent]) {
        if events.is_empty() {
            return;
        }
        let mut to_remove = Vec::new();

        {
            let listeners = self.listeners.read();
            for (id, listener) in listeners.iter() {
                for event in events.iter().filter(|e| listener.matches(e)) {
                    if listener.sender.try_send(event.clone()).is_err() {
                        to_remove.push(*id);
                        break;
                    }
                }
            }
        }

        if !to_remove.is_empty() {
            let mut listeners = self.listeners.write();
            for id in to_remove {
                if let Some(listener) = listeners.remove(&id) {
                    tracing::debug!(listener = id, "dropping slow topic listener");
                    // Might fail if the buffer is still full, that's ok
                    let _ = listener.sender.try_send(TopicEvent::Dropped);
                }
            }
        }
    }
}

impl Default for TopicListeners {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unannounced(name: &str) -> TopicEvent {
        TopicEvent::Unannounced {
            name: name.to_string(),
            id: TopicId(1),
        }
    }

    #[test]
    fn test_listen_unlisten() {
        let listeners = TopicListeners::new();
        let handle = listeners.listen(TopicListenerConfig::default());
        assert_eq!(listeners.len(), 1);
        listeners.unlisten(handle.id);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_prefix_filter() {
        let listeners = TopicListeners::new();
        let handle = listeners.listen(TopicListenerConfig {
            prefix: "/drive/".to_string(),
            ..Default::default()
        });

        listeners.broadcast(&[unannounced("/arm/angle"), unannounced("/drive/speed")]);

        let event = handle.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(event, unannounced("/drive/speed"));
        assert!(handle.try_recv().is_err());
    }

    #[test]
    fn test_drop_slow_listener() {
        let listeners = TopicListeners::new();
        let _handle = listeners.listen(TopicListenerConfig {
            buffer_size: 2,
            ..Default::default()
        });

        for i in 0..10 {
            listeners.broadcast(&[unannounced(&format!("/t{}", i))]);
        }

        assert!(listeners.is_empty());
    }
}
