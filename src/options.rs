//! Publish/subscribe option directives.
//!
//! Options are supplied as an ordered list of directives. Later directives of
//! the same kind override earlier ones; unrecognized directives are ignored.

use crate::types::PublisherId;
use serde::{Deserialize, Serialize};

/// Default transmission period in seconds.
pub const DEFAULT_PERIODIC: f64 = 0.1;

/// Longest transmission period honored, in seconds.
pub const MAX_PERIODIC: f64 = 3600.0;

/// Queue capacity used when `poll_storage` is 0 and `send_all` is false.
pub const DEFAULT_POLL_STORAGE: usize = 1;

/// Queue capacity used when `poll_storage` is 0 and `send_all` is true.
pub const DEFAULT_POLL_STORAGE_SEND_ALL: usize = 20;

/// A single option directive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PubSubOption {
    Periodic(f64),
    SendAll(bool),
    TopicsOnly(bool),
    PollStorage(u32),
    KeepDuplicates(bool),
    ExcludePublisher(PublisherId),
    ExcludeSelf(bool),
    DisableRemote(bool),
    DisableLocal(bool),
    PrefixMatch(bool),
    /// A directive this version does not understand. Ignored.
    Unrecognized(String),
}

/// Resolved per-subscriber delivery options.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PubSubOptions {
    /// Minimum seconds between network transmissions.
    pub periodic: f64,
    /// Deliver every distinct update instead of coalescing.
    pub send_all: bool,
    /// Deliver only topic announcements, never values.
    pub topics_only: bool,
    /// Requested queue capacity; 0 means "resolve from `send_all`".
    pub poll_storage: u32,
    /// Keep consecutive duplicate values.
    pub keep_duplicates: bool,
    /// Never deliver updates from this publisher (NONE = disabled).
    pub exclude_publisher: PublisherId,
    /// Never deliver updates made by the entry's own publisher.
    pub exclude_self: bool,
    pub disable_remote: bool,
    pub disable_local: bool,
    pub prefix_match: bool,
}

impl Default for PubSubOptions {
    fn default() -> Self {
        Self {
            periodic: DEFAULT_PERIODIC,
            send_all: false,
            topics_only: false,
            poll_storage: 0,
            keep_duplicates: false,
            exclude_publisher: PublisherId::NONE,
            exclude_self: false,
            disable_remote: false,
            disable_local: false,
            prefix_match: false,
        }
    }
}

impl PubSubOptions {
    /// Reduce an ordered directive list into options, last write wins.
    pub fn from_directives(directives: &[PubSubOption]) -> Self {
        directives
            .iter()
            .fold(Self::default(), |options, directive| options.apply(directive))
    }

    fn apply(mut self, directive: &PubSubOption) -> Self {
        match directive {
            PubSubOption::Periodic(v) => self.periodic = *v,
            PubSubOption::SendAll(v) => self.send_all = *v,
            PubSubOption::TopicsOnly(v) => self.topics_only = *v,
            PubSubOption::PollStorage(v) => self.poll_storage = *v,
            PubSubOption::KeepDuplicates(v) => self.keep_duplicates = *v,
            PubSubOption::ExcludePublisher(v) => self.exclude_publisher = *v,
            PubSubOption::ExcludeSelf(v) => self.exclude_self = *v,
            PubSubOption::DisableRemote(v) => self.disable_remote = *v,
            PubSubOption::DisableLocal(v) => self.disable_local = *v,
            PubSubOption::PrefixMatch(v) => self.prefix_match = *v,
            PubSubOption::Unrecognized(kind) => {
                tracing::trace!(kind = %kind, "ignoring unrecognized option directive");
            }
        }
        self
    }

    /// Queue capacity after resolving the zero default.
    pub fn resolved_poll_storage(&self) -> usize {
        match self.poll_storage {
            0 if self.send_all => DEFAULT_POLL_STORAGE_SEND_ALL,
            0 => DEFAULT_POLL_STORAGE,
            n => n as usize,
        }
    }

    /// Transmission period clamped to `[min_period, MAX_PERIODIC]` seconds.
    pub fn effective_periodic(&self, min_period: f64) -> f64 {
        let periodic = if self.periodic.is_finite() {
            self.periodic.min(MAX_PERIODIC)
        } else {
            DEFAULT_PERIODIC
        };
        periodic.max(min_period)
    }
}
