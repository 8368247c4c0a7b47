//! Bounded per-subscriber queue of pending updates.
//!
//! Two admission modes, fixed at construction:
//!
//! - **Coalescing** (`send_all = false`): one slot per topic. A newer update
//!   for a topic that is already pending overwrites it in place. An explicit
//!   `poll_storage` bounds the number of slots; the oldest slot is evicted
//!   to admit a new topic.
//! - **Bounded FIFO** (`send_all = true`): every update is kept in arrival
//!   order; when full, the oldest entry is evicted to admit the newest.
//!
//! Enqueue never blocks on the consumer. Both operations take a short
//! internal lock, so producers and the flush path may run concurrently.

use crate::options::PubSubOptions;
use crate::types::ValueUpdate;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// How the queue admits updates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueMode {
    Coalesce,
    SendAll,
}

/// What happened to an enqueued update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Appended to the queue.
    Queued,
    /// Replaced the pending update for the same topic.
    Coalesced,
    /// Appended after evicting the oldest entry.
    EvictedOldest,
}

/// Pending updates for a single subscriber.
pub struct SubscriptionQueue {
    mode: QueueMode,
    capacity: usize,
    /// Maximum pending topics in coalescing mode; `None` is one per topic.
    slot_limit: Option<usize>,
    pending: Mutex<VecDeque<ValueUpdate>>,
    /// Updates lost to coalescing or eviction.
    dropped: AtomicU64,
}

impl SubscriptionQueue {
    /// Create a queue with an explicit mode and capacity (minimum 1).
    pub fn new(mode: QueueMode, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            mode,
            capacity,
            slot_limit: None,
            pending: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            dropped: AtomicU64::new(0),
        }
    }

    /// Create a queue sized from subscriber options.
    pub fn from_options(options: &PubSubOptions) -> Self {
        let mode = if options.send_all {
            QueueMode::SendAll
        } else {
            QueueMode::Coalesce
        };
        match (mode, options.poll_storage) {
            (QueueMode::Coalesce, n) if n > 0 => Self::bounded_coalesce(n as usize),
            _ => Self::new(mode, options.resolved_poll_storage()),
        }
    }

    /// A coalescing queue holding at most `limit` topics (minimum 1).
    pub fn bounded_coalesce(limit: usize) -> Self {
        let mut queue = Self::new(QueueMode::Coalesce, limit);
        queue.slot_limit = Some(queue.capacity);
        queue
    }

    pub fn enqueue(&self, update: ValueUpdate) -> Admission {
        let mut pending = self.pending.lock();

        if self.mode == QueueMode::Coalesce {
            if let Some(slot) = pending.iter_mut().find(|p| p.topic == update.topic) {
                *slot = update;
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Admission::Coalesced;
            }
            if self.slot_limit.is_some_and(|limit| pending.len() >= limit) {
                pending.pop_front();
                pending.push_back(update);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(capacity = self.capacity, "slots full, evicted oldest topic");
                return Admission::EvictedOldest;
            }
            pending.push_back(update);
            return Admission::Queued;
        }

        if pending.len() >= self.capacity {
            pending.pop_front();
            pending.push_back(update);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(capacity = self.capacity, "queue full, evicted oldest update");
            return Admission::EvictedOldest;
        }
        pending.push_back(update);
        Admission::Queued
    }

    /// Remove and return everything pending, oldest first.
    pub fn drain(&self) -> Vec<ValueUpdate> {
        self.pending.lock().drain(..).collect()
    }

    /// Discard everything pending. Returns how many updates were dropped.
    pub fn clear(&self) -> usize {
        let mut pending = self.pending.lock();
        let n = pending.len();
        pending.clear();
        n
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Topic bound of a coalescing queue, if any.
    pub fn slot_limit(&self) -> Option<usize> {
        self.slot_limit
    }

    pub fn mode(&self) -> QueueMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Total updates lost to coalescing or eviction.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
