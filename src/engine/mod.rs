//! The synchronization engine.
//!
//! [`SyncEngine`] ties the pieces together: it owns the topic registry and
//! per-connection state behind a single table lock, evaluates delivery for
//! every value change, and flushes each connection's queued output through a
//! [`Transport`] at that connection's effective period.
//!
//! The table lock is only held for registry mutations. Flushes take their
//! batch under the lock, then send with the lock released; closing a
//! connection while it flushes sets a cancellation flag the flush checks
//! before every send.

mod logger;
mod table;
mod worker;

pub use logger::DataLoggerId;
pub use worker::FlushWorker;

use crate::config::EngineConfig;
use crate::connections::{CloseReason, ConnectionInfo, ConnectionRegistry, ConnectionState};
use crate::datalog::DataLog;
use crate::error::{Result, SyncError};
use crate::options::{PubSubOption, PubSubOptions};
use crate::protocol::{InboundMessage, OutboundMessage, ProtocolVersion, TopicFlags, Transport};
use crate::subscriptions::{
    SubscriptionQueue, TopicListenerConfig, TopicListenerHandle, TopicListeners,
};
use crate::topics::{CurrentValue, Owner, TopicInfo};
use crate::types::{ConnectionId, PublisherId, SubscriberId, Timestamp, Value, ValueType, ValueUpdate};
use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use table::{ConnectionSlot, Effects, TableState};

/// A connection whose handshake has not completed yet.
#[derive(Debug)]
pub struct Handshake {
    remote_ip: String,
    remote_port: u16,
    state: ConnectionState,
}

impl Handshake {
    pub fn state(&self) -> ConnectionState {
        self.state
    }
}

/// Result of a local publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers whose queue accepted the value.
    pub delivered: usize,
    /// Affected connections and how long until each may flush.
    pub flushes: Vec<(ConnectionId, Duration)>,
}

/// Result of a flush attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Batch sent.
    Flushed { messages: usize },
    /// The connection flushed too recently; retry after the delay.
    NotDue(Duration),
    /// Another flush for this connection is in flight.
    Skipped,
    /// The connection started closing or the transport failed mid-batch.
    /// The rest of the batch was discarded.
    Aborted { messages: usize },
}

/// Engine statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub topics: usize,
    pub publishers: usize,
    pub subscribers: usize,
    pub connections: usize,
    pub data_loggers: usize,
}

/// The shared table and its delivery engine.
pub struct SyncEngine {
    config: EngineConfig,

    /// Live connections and their liveness.
    connections: ConnectionRegistry,

    /// Topics, subscribers and per-connection state.
    table: Mutex<TableState>,

    transport: Arc<dyn Transport>,

    topic_listeners: TopicListeners,

    /// Wake channels of running flush workers, tagged with a registration
    /// token.
    wakers: RwLock<HashMap<ConnectionId, (u64, Sender<()>)>>,
    next_waker: AtomicU64,
}

impl SyncEngine {
    pub fn new(config: EngineConfig, transport: Arc<dyn Transport>) -> Self {
        let connections = ConnectionRegistry::with_listener_buffer(config.listener_buffer_size);
        tracing::debug!(identity = %config.identity, server = config.server, "engine created");
        Self {
            config,
            connections,
            table: Mutex::new(TableState::new()),
            transport,
            topic_listeners: TopicListeners::new(),
            wakers: RwLock::new(HashMap::new()),
            next_waker: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // --- Connection Lifecycle ---

    /// Start tracking a peer that is negotiating its protocol version.
    pub fn begin_handshake(&self, remote_ip: &str, remote_port: u16) -> Handshake {
        Handshake {
            remote_ip: remote_ip.to_string(),
            remote_port,
            state: ConnectionState::Connecting,
        }
    }

    /// Complete a handshake and register the connection.
    ///
    /// Peers whose version has no subscribe message get an implicit
    /// subscription to every topic.
    pub fn complete_handshake(
        &self,
        handshake: Handshake,
        remote_id: &str,
        version: ProtocolVersion,
        now: Timestamp,
    ) -> Result<ConnectionId> {
        if !handshake
            .state
            .can_transition_to(ConnectionState::Established)
        {
            return Err(SyncError::InvalidTransition {
                from: handshake.state,
                to: ConnectionState::Established,
            });
        }
        let features = version
            .features()
            .ok_or(SyncError::UnsupportedProtocol(version.0))?;

        let info = ConnectionInfo {
            remote_id: remote_id.to_string(),
            remote_ip: handshake.remote_ip,
            remote_port: handshake.remote_port,
            last_update: now.or_now(),
            protocol_version: version,
        };

        let mut fx = Effects::default();
        let connection = {
            let mut table = self.table.lock();
            let connection = self.connections.register(info);
            table.slots.insert(connection, ConnectionSlot::new(features));
            if features.implicit_subscribe_all() {
                let options = PubSubOptions::from_directives(&[PubSubOption::PrefixMatch(true)]);
                let subscriber =
                    table
                        .topics
                        .add_subscriber("", options, Owner::Remote(connection), None);
                table.sync_announcements(connection, &mut fx);
                table.replay(subscriber, self.config.server);
                fx.wake.insert(connection);
            }
            connection
        };
        self.apply(fx);
        Ok(connection)
    }

    /// Current state of a connection. `None` once it is closed.
    pub fn state(&self, connection: ConnectionId) -> Option<ConnectionState> {
        self.table.lock().slots.get(&connection).map(|s| s.state)
    }

    /// Close a connection.
    ///
    /// Returns `Closing` if a flush is in flight; that flush completes the
    /// close when it observes the cancellation.
    pub fn disconnect(&self, connection: ConnectionId) -> Result<ConnectionState> {
        self.close(connection, CloseReason::Disconnected, Timestamp::now())
    }

    /// Evict connections silent for longer than the liveness timeout and
    /// close them. Returns the evicted ids.
    pub fn evict_stale(&self, now: Timestamp) -> Vec<ConnectionId> {
        let now = now.or_now();
        let evicted = self
            .connections
            .evict_stale(now, self.config.liveness_timeout);
        for connection in &evicted {
            if let Err(e) = self.close(*connection, CloseReason::Stale, now) {
                tracing::debug!(connection = %connection, error = %e, "evicted connection had no engine state");
            }
        }
        evicted
    }

    fn close(
        &self,
        connection: ConnectionId,
        reason: CloseReason,
        now: Timestamp,
    ) -> Result<ConnectionState> {
        let mut fx = Effects::default();
        let state = {
            let mut guard = self.table.lock();
            let table = &mut *guard;
            let slot = table
                .slots
                .get_mut(&connection)
                .ok_or(SyncError::ConnectionNotFound(connection))?;
            slot.begin_close(connection, reason);
            if slot.flushing {
                ConnectionState::Closing
            } else {
                table.finish_close(connection, now, &mut fx);
                ConnectionState::Closed
            }
        };
        self.apply(fx);
        Ok(state)
    }

    /// Handle a parsed message from a peer.
    ///
    /// Refreshes the connection's liveness. Message kinds the peer's
    /// protocol version does not have are ignored.
    pub fn on_receive(
        &self,
        connection: ConnectionId,
        message: InboundMessage,
        now: Timestamp,
    ) -> Result<()> {
        let now = now.or_now();
        let mut fx = Effects::default();
        {
            let mut table = self.table.lock();
            let slot = table
                .slots
                .get(&connection)
                .ok_or(SyncError::ConnectionNotFound(connection))?;
            if slot.state != ConnectionState::Established {
                return Err(SyncError::ConnectionStale(connection));
            }
            let features = slot.features;
            self.connections.touch(connection, now)?;

            let kind = message.kind();
            if !features.supports(kind) {
                tracing::debug!(
                    connection = %connection,
                    version = %features.version,
                    ?kind,
                    "ignoring message kind unsupported by protocol version"
                );
                return Ok(());
            }
            table.handle_inbound(connection, message, now, self.config.server, &mut fx);
        }
        self.apply(fx);
        Ok(())
    }

    pub fn connections(&self) -> Vec<(ConnectionId, ConnectionInfo)> {
        self.connections.list()
    }

    pub fn connection_registry(&self) -> &ConnectionRegistry {
        &self.connections
    }

    // --- Flush ---

    /// Send the connection's queued output if its period has elapsed.
    pub fn flush(&self, connection: ConnectionId, now: Timestamp) -> Result<FlushOutcome> {
        let now = now.or_now();
        let (batch, features, cancel) = {
            let mut guard = self.table.lock();
            let table = &mut *guard;
            let period = table.effective_period(connection, self.config.min_period);
            let slot = table
                .slots
                .get_mut(&connection)
                .ok_or(SyncError::ConnectionNotFound(connection))?;
            if slot.state != ConnectionState::Established {
                return Err(SyncError::ConnectionStale(connection));
            }
            if slot.flushing {
                return Ok(FlushOutcome::Skipped);
            }
            if let Some(last) = slot.last_flush {
                let due = last.saturating_add(period);
                if now < due {
                    return Ok(FlushOutcome::NotDue(due.saturating_duration_since(now)));
                }
            }

            let mut batch = std::mem::take(&mut slot.outbox);
            // A value queued by several subscribers of one peer is sent once.
            let mut seen = HashSet::new();
            for subscriber in table.topics.subscribers_of(Owner::Remote(connection)) {
                let mut taken = Vec::new();
                for update in subscriber.queue.drain() {
                    let key = (update.topic, update.publisher, update.timestamp);
                    if !slot.announced.contains(&update.topic) || seen.contains(&key) {
                        continue;
                    }
                    taken.push(key);
                    batch.push(OutboundMessage::ValueUpdate {
                        id: update.topic,
                        value: update.value,
                        timestamp: update.timestamp,
                    });
                }
                seen.extend(taken);
            }
            if batch.is_empty() {
                return Ok(FlushOutcome::Flushed { messages: 0 });
            }
            slot.flushing = true;
            slot.last_flush = Some(now);
            (batch, slot.features, Arc::clone(&slot.cancel))
        };

        let mut sent = 0;
        let mut aborted = false;
        let mut failure = None;
        for message in batch {
            if cancel.load(Ordering::Acquire) {
                tracing::debug!(connection = %connection, "flush cancelled");
                aborted = true;
                break;
            }
            if !features.supports(message.kind()) {
                tracing::trace!(connection = %connection, kind = ?message.kind(), "not sent to peer");
                continue;
            }
            match self.transport.send(connection, message) {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::warn!(connection = %connection, error = %e, "transport failed during flush");
                    failure = Some(e);
                    aborted = true;
                    break;
                }
            }
        }

        let mut fx = Effects::default();
        {
            let mut guard = self.table.lock();
            let table = &mut *guard;
            let closing = match table.slots.get_mut(&connection) {
                Some(slot) => {
                    slot.flushing = false;
                    if let Some(e) = failure {
                        slot.begin_close(connection, CloseReason::TransportError(e.0));
                    }
                    slot.state == ConnectionState::Closing
                }
                None => false,
            };
            if closing {
                table.finish_close(connection, now, &mut fx);
            }
        }
        self.apply(fx);

        if aborted {
            Ok(FlushOutcome::Aborted { messages: sent })
        } else {
            Ok(FlushOutcome::Flushed { messages: sent })
        }
    }

    /// Flush every established connection that is due.
    pub fn flush_due(&self, now: Timestamp) -> Vec<(ConnectionId, FlushOutcome)> {
        let now = now.or_now();
        let mut connections: Vec<ConnectionId> = self.table.lock().slots.keys().copied().collect();
        connections.sort();
        connections
            .into_iter()
            .filter_map(|c| match self.flush(c, now) {
                Ok(FlushOutcome::NotDue(_)) | Ok(FlushOutcome::Skipped) => None,
                Ok(outcome) => Some((c, outcome)),
                Err(_) => None,
            })
            .collect()
    }

    /// Time until the connection may flush again; `None` if it is not
    /// established.
    pub fn next_flush_delay(&self, connection: ConnectionId, now: Timestamp) -> Option<Duration> {
        self.table
            .lock()
            .flush_delay(connection, now.or_now(), self.config.min_period)
    }

    /// Effective flush period of a connection.
    pub fn effective_period(&self, connection: ConnectionId) -> Duration {
        self.table
            .lock()
            .effective_period(connection, self.config.min_period)
    }

    // --- Publishers ---

    /// Create a local publisher, announcing the topic if it has no type yet.
    pub fn create_publisher(
        &self,
        name: &str,
        type_str: &str,
        properties: serde_json::Value,
    ) -> Result<PublisherId> {
        let mut fx = Effects::default();
        let publisher = self.table.lock().create_publisher(
            name,
            type_str,
            &properties,
            Owner::Local,
            &mut fx,
        )?;
        self.apply(fx);
        Ok(publisher)
    }

    /// Release a publisher. The topic is unpublished if it was the last one
    /// and the topic is neither persistent nor retained.
    pub fn release_publisher(&self, publisher: PublisherId) -> Result<()> {
        let mut fx = Effects::default();
        self.table
            .lock()
            .release_publisher(publisher, Timestamp::now(), &mut fx)?;
        self.apply(fx);
        Ok(())
    }

    /// Publish a value. `Timestamp::NOW` stamps it with the current time.
    pub fn publish(
        &self,
        publisher: PublisherId,
        value: impl Into<Value>,
        timestamp: Timestamp,
    ) -> Result<PublishReport> {
        let timestamp = timestamp.or_now();
        let value = value.into();
        let (report, wake) = {
            let mut table = self.table.lock();
            let fan = table.publish(publisher, value, timestamp, self.config.server)?;
            let flushes = fan
                .connections
                .iter()
                .filter_map(|c| {
                    table
                        .flush_delay(*c, timestamp, self.config.min_period)
                        .map(|d| (*c, d))
                })
                .collect();
            (
                PublishReport {
                    delivered: fan.delivered,
                    flushes,
                },
                fan.connections,
            )
        };
        self.wake(wake.iter());
        Ok(report)
    }

    /// Publish only if the topic has no value yet.
    ///
    /// Returns whether the topic's value (existing or new) has the
    /// publisher's type.
    pub fn set_default(&self, publisher: PublisherId, value: impl Into<Value>) -> Result<bool> {
        let value = value.into();
        let wake = {
            let mut table = self.table.lock();
            let (topic, type_str) = {
                let p = table
                    .topics
                    .publisher(publisher)
                    .ok_or(SyncError::PublisherNotFound(publisher))?;
                (p.topic, p.type_str.clone())
            };
            let expected = ValueType::from_type_str(&type_str);
            if let Some(current) = table.topics.topic(topic).and_then(|t| t.current.as_ref()) {
                return Ok(current.value.value_type() == expected);
            }
            if value.value_type() != expected {
                return Ok(false);
            }
            table
                .publish(publisher, value, Timestamp::now(), self.config.server)?
                .connections
        };
        self.wake(wake.iter());
        Ok(true)
    }

    // --- Subscribers ---

    /// Subscribe locally to a topic name, or a prefix with
    /// `PubSubOption::PrefixMatch(true)`.
    ///
    /// Subscribing to a topic that does not exist yet is allowed; values
    /// arrive once a publisher appears. The current value, if any, is
    /// offered immediately.
    pub fn subscribe(&self, name: &str, options: &[PubSubOption]) -> SubscriberId {
        let options = PubSubOptions::from_directives(options);
        let mut table = self.table.lock();
        let subscriber = table.topics.add_subscriber(name, options, Owner::Local, None);
        table.replay(subscriber, self.config.server);
        subscriber
    }

    pub fn unsubscribe(&self, subscriber: SubscriberId) -> Result<()> {
        self.table
            .lock()
            .topics
            .remove_subscriber(subscriber)
            .map(|_| ())
            .ok_or(SyncError::SubscriberNotFound(subscriber))
    }

    /// A subscriber's queue. Draining it does not take the table lock.
    pub fn queue(&self, subscriber: SubscriberId) -> Result<Arc<SubscriptionQueue>> {
        self.table
            .lock()
            .topics
            .subscriber(subscriber)
            .map(|s| Arc::clone(&s.queue))
            .ok_or(SyncError::SubscriberNotFound(subscriber))
    }

    /// Drain a subscriber's pending updates, oldest first.
    pub fn read_queue(&self, subscriber: SubscriberId) -> Result<Vec<ValueUpdate>> {
        Ok(self.queue(subscriber)?.drain())
    }

    /// Create a publisher and a subscriber on the same topic.
    ///
    /// The subscriber treats the publisher as its own, so
    /// `PubSubOption::ExcludeSelf(true)` filters out its writes.
    pub fn create_entry(
        &self,
        name: &str,
        type_str: &str,
        options: &[PubSubOption],
    ) -> Result<(SubscriberId, PublisherId)> {
        let options = PubSubOptions::from_directives(options);
        let mut fx = Effects::default();
        let ids = {
            let mut table = self.table.lock();
            let publisher = table.create_publisher(
                name,
                type_str,
                &serde_json::Value::Object(Default::default()),
                Owner::Local,
                &mut fx,
            )?;
            let subscriber =
                table
                    .topics
                    .add_subscriber(name, options, Owner::Local, Some(publisher));
            table.replay(subscriber, self.config.server);
            (subscriber, publisher)
        };
        self.apply(fx);
        Ok(ids)
    }

    // --- Topics ---

    /// Current value of a topic, `None` if it has none.
    pub fn get_value(&self, name: &str) -> Result<Option<CurrentValue>> {
        self.table
            .lock()
            .topics
            .lookup(name)
            .map(|t| t.current.clone())
            .ok_or_else(|| SyncError::UnknownTopic(name.to_string()))
    }

    /// Announced topics under `prefix`, optionally restricted to types.
    pub fn topic_info(&self, prefix: &str, types: &[ValueType]) -> Vec<TopicInfo> {
        self.table.lock().topics.topics_matching(prefix, types)
    }

    pub fn set_flags(&self, name: &str, flags: TopicFlags) -> Result<()> {
        let mut fx = Effects::default();
        self.table
            .lock()
            .set_flags(name, flags, Timestamp::now(), &mut fx)?;
        self.apply(fx);
        Ok(())
    }

    /// Merge a properties update into a topic. `null` values delete keys.
    pub fn set_properties(&self, name: &str, update: serde_json::Value) -> Result<()> {
        let mut fx = Effects::default();
        self.table.lock().set_properties(name, &update, &mut fx)?;
        self.apply(fx);
        Ok(())
    }

    /// Delete a topic: its value, type and publishers are removed.
    pub fn delete_topic(&self, name: &str) -> Result<()> {
        let mut fx = Effects::default();
        let deleted = self.table.lock().delete(name, Timestamp::now(), &mut fx);
        self.apply(fx);
        if deleted {
            Ok(())
        } else {
            Err(SyncError::UnknownTopic(name.to_string()))
        }
    }

    /// Delete every non-persistent topic. Returns how many were deleted.
    pub fn clear_topics(&self) -> usize {
        let mut fx = Effects::default();
        let cleared = self.table.lock().clear(None, Timestamp::now(), &mut fx);
        self.apply(fx);
        cleared
    }

    pub fn listen_topics(&self, config: TopicListenerConfig) -> TopicListenerHandle {
        self.topic_listeners.listen(config)
    }

    pub fn unlisten_topics(&self, id: u64) {
        self.topic_listeners.unlisten(id);
    }

    // --- Data Logs ---

    /// Mirror value changes of topics under `prefix` into `log`.
    ///
    /// Entry names are `log_prefix` followed by the topic name with
    /// `prefix` stripped. Current values are logged immediately.
    pub fn start_data_log(
        &self,
        log: Arc<dyn DataLog>,
        prefix: &str,
        log_prefix: &str,
    ) -> DataLoggerId {
        let mut guard = self.table.lock();
        let table = &mut *guard;
        let id = table.loggers.add(log, prefix, log_prefix);

        let current: Vec<_> = table
            .topics
            .announced_topics()
            .into_iter()
            .filter_map(|topic| table.topics.topic(topic))
            .filter(|t| t.name.starts_with(prefix))
            .filter_map(|t| {
                let current = t.current.as_ref()?;
                Some((
                    t.id,
                    Arc::clone(&t.name),
                    t.type_str.clone().unwrap_or_default(),
                    current.value.clone(),
                    current.timestamp,
                ))
            })
            .collect();
        for (topic, name, type_str, value, timestamp) in current {
            table
                .loggers
                .record(topic, &name, &type_str, &value, timestamp);
        }
        id
    }

    /// Stop a data logger, finishing its entries. Returns false if unknown.
    pub fn stop_data_log(&self, id: DataLoggerId) -> bool {
        self.table.lock().loggers.remove(id, Timestamp::now())
    }

    pub fn stats(&self) -> EngineStats {
        let table = self.table.lock();
        EngineStats {
            topics: table.topics.topic_count(),
            publishers: table.topics.publisher_count(),
            subscribers: table.topics.subscriber_count(),
            connections: table.slots.len(),
            data_loggers: table.loggers.len(),
        }
    }

    // --- Private Helpers ---

    /// Register a worker's wake channel, replacing any earlier one.
    /// Returns the token needed to unregister it.
    pub(crate) fn register_waker(&self, connection: ConnectionId, waker: Sender<()>) -> u64 {
        let token = self.next_waker.fetch_add(1, Ordering::Relaxed);
        if self
            .wakers
            .write()
            .insert(connection, (token, waker))
            .is_some()
        {
            tracing::debug!(connection = %connection, "replaced flush worker wake channel");
        }
        token
    }

    /// Remove a wake channel unless another worker has since replaced it.
    pub(crate) fn unregister_waker(&self, connection: ConnectionId, token: u64) {
        let mut wakers = self.wakers.write();
        if wakers.get(&connection).is_some_and(|(t, _)| *t == token) {
            wakers.remove(&connection);
        }
    }

    fn wake<'a>(&self, connections: impl Iterator<Item = &'a ConnectionId>) {
        let wakers = self.wakers.read();
        for connection in connections {
            if let Some((_, waker)) = wakers.get(connection) {
                // A full channel already holds a pending wake.
                let _ = waker.try_send(());
            }
        }
    }

    fn apply(&self, fx: Effects) {
        for connection in &fx.closed {
            self.connections.remove(*connection);
        }
        self.topic_listeners.broadcast(&fx.events);
        self.wake(fx.wake.iter().chain(fx.closed.iter()));
    }
}
