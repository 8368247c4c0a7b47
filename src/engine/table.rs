//! Table state guarded by the engine lock.
//!
//! Everything here runs with the table lock held. Side effects that must
//! happen after unlocking (listener broadcast, worker wake-ups, registry
//! removal) are collected into [`Effects`].

use super::logger::DataLoggers;
use crate::connections::{CloseReason, ConnectionState};
use crate::error::{Result, SyncError};
use crate::options::{PubSubOptions, DEFAULT_PERIODIC, MAX_PERIODIC};
use crate::protocol::{InboundMessage, OutboundMessage, ProtocolFeatures, TopicFlags};
use crate::subscriptions::TopicEvent;
use crate::topics::{merge_properties, CurrentValue, FanOut, Owner, TopicInfo, TopicRegistry};
use crate::types::{
    ConnectionId, Origin, PublisherId, SubscriberId, Timestamp, TopicId, Value, ValueUpdate,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Work to do once the table lock is released.
#[derive(Default)]
pub(crate) struct Effects {
    pub events: Vec<TopicEvent>,
    pub wake: BTreeSet<ConnectionId>,
    pub closed: Vec<ConnectionId>,
}

/// Per-connection engine state.
pub(crate) struct ConnectionSlot {
    pub state: ConnectionState,
    pub features: &'static ProtocolFeatures,
    pub last_flush: Option<Timestamp>,
    /// Control messages waiting for the next flush.
    pub outbox: Vec<OutboundMessage>,
    /// A flush is sending outside the lock.
    pub flushing: bool,
    /// Set when the connection starts closing; observed by in-flight flushes.
    pub cancel: Arc<AtomicBool>,
    /// Topics this peer has been told about.
    pub announced: HashSet<TopicId>,
    /// Peer publisher uid -> publisher.
    pub remote_publishers: HashMap<u32, PublisherId>,
    /// Peer subscriber uid -> one subscriber per requested pattern.
    pub remote_subscribers: HashMap<u32, Vec<SubscriberId>>,
    pub close_reason: Option<CloseReason>,
}

impl ConnectionSlot {
    pub fn new(features: &'static ProtocolFeatures) -> Self {
        Self {
            state: ConnectionState::Established,
            features,
            last_flush: None,
            outbox: Vec::new(),
            flushing: false,
            cancel: Arc::new(AtomicBool::new(false)),
            announced: HashSet::new(),
            remote_publishers: HashMap::new(),
            remote_subscribers: HashMap::new(),
            close_reason: None,
        }
    }

    pub fn transition(&mut self, connection: ConnectionId, next: ConnectionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(SyncError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::trace!(connection = %connection, from = ?self.state, to = ?next, "connection state");
        self.state = next;
        Ok(())
    }

    /// Move to `Closing` and signal any in-flight flush.
    pub fn begin_close(&mut self, connection: ConnectionId, reason: CloseReason) {
        if self.state == ConnectionState::Established
            && self.transition(connection, ConnectionState::Closing).is_ok()
        {
            self.cancel.store(true, Ordering::Release);
            self.close_reason = Some(reason);
        }
    }
}

pub(crate) fn announce_message(info: &TopicInfo) -> OutboundMessage {
    OutboundMessage::Announce {
        name: info.name.clone(),
        id: info.id,
        type_str: info.type_str.clone(),
        properties: info.properties.clone(),
        flags: info.flags,
    }
}

pub(crate) struct TableState {
    pub topics: TopicRegistry,
    pub slots: HashMap<ConnectionId, ConnectionSlot>,
    pub loggers: DataLoggers,
}

impl TableState {
    pub fn new() -> Self {
        Self {
            topics: TopicRegistry::new(),
            slots: HashMap::new(),
            loggers: DataLoggers::default(),
        }
    }

    // --- Scheduling ---

    /// Minimum clamped `periodic` across the connection's subscriptions.
    pub fn effective_period(&self, connection: ConnectionId, min_period: f64) -> Duration {
        let secs = self
            .topics
            .subscribers_of(Owner::Remote(connection))
            .map(|s| s.options.effective_periodic(min_period))
            .fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.min(p))))
            .unwrap_or_else(|| DEFAULT_PERIODIC.max(min_period));
        Duration::try_from_secs_f64(secs.max(0.0))
            .unwrap_or_else(|_| Duration::from_secs_f64(MAX_PERIODIC))
    }

    /// Time until the connection may flush again.
    pub fn flush_delay(
        &self,
        connection: ConnectionId,
        now: Timestamp,
        min_period: f64,
    ) -> Option<Duration> {
        let slot = self.slots.get(&connection)?;
        if slot.state != ConnectionState::Established {
            return None;
        }
        Some(match slot.last_flush {
            None => Duration::ZERO,
            Some(last) => last
                .saturating_add(self.effective_period(connection, min_period))
                .saturating_duration_since(now),
        })
    }

    // --- Announcements ---

    /// Announce a topic to listeners and to every peer subscribed to it.
    pub fn announce(&mut self, topic: TopicId, fx: &mut Effects) {
        let info = match self.topics.topic(topic) {
            Some(t) if t.is_announced() => t.info(),
            _ => return,
        };
        for (connection, slot) in self.slots.iter_mut() {
            if slot.state != ConnectionState::Established {
                continue;
            }
            if self.topics.owner_wants(Owner::Remote(*connection), &info.name)
                && slot.announced.insert(topic)
            {
                slot.outbox.push(announce_message(&info));
                fx.wake.insert(*connection);
            }
        }
        fx.events.push(TopicEvent::Announced { info });
    }

    /// Tell one peer about every announced topic it subscribes to.
    pub fn sync_announcements(&mut self, connection: ConnectionId, fx: &mut Effects) {
        let owner = Owner::Remote(connection);
        let wanted: Vec<TopicInfo> = self
            .topics
            .announced_topics()
            .into_iter()
            .filter_map(|id| self.topics.topic(id))
            .filter(|t| self.topics.owner_wants(owner, &t.name))
            .map(|t| t.info())
            .collect();
        let Some(slot) = self.slots.get_mut(&connection) else {
            return;
        };
        for info in wanted {
            if slot.announced.insert(info.id) {
                slot.outbox.push(announce_message(&info));
                fx.wake.insert(connection);
            }
        }
    }

    /// Withdraw a topic from every peer that knows it.
    pub fn unannounce(&mut self, topic: TopicId, timestamp: Timestamp, fx: &mut Effects) {
        let Some(name) = self.topics.topic(topic).map(|t| t.name.to_string()) else {
            return;
        };
        for (connection, slot) in self.slots.iter_mut() {
            if slot.announced.remove(&topic) {
                slot.outbox.push(OutboundMessage::Unannounce {
                    name: name.clone(),
                    id: topic,
                });
                fx.wake.insert(*connection);
            }
        }
        self.loggers.finish_topic(topic, timestamp);
        fx.events.push(TopicEvent::Unannounced { name, id: topic });
    }

    /// Queue a control message for every peer that knows the topic.
    fn notify_announced(&mut self, topic: TopicId, message: OutboundMessage, fx: &mut Effects) {
        for (connection, slot) in self.slots.iter_mut() {
            if slot.announced.contains(&topic) {
                slot.outbox.push(message.clone());
                fx.wake.insert(*connection);
            }
        }
    }

    fn announced_id(&self, name: &str) -> Result<TopicId> {
        self.topics
            .lookup(name)
            .filter(|t| t.is_announced())
            .map(|t| t.id)
            .ok_or_else(|| SyncError::UnknownTopic(name.to_string()))
    }

    // --- Publishers ---

    pub fn create_publisher(
        &mut self,
        name: &str,
        type_str: &str,
        properties: &serde_json::Value,
        owner: Owner,
        fx: &mut Effects,
    ) -> Result<PublisherId> {
        let (publisher, announced) = self.topics.add_publisher(name, type_str, properties, owner)?;
        if announced {
            if let Some(topic) = self.topics.publisher(publisher).map(|p| p.topic) {
                self.announce(topic, fx);
            }
        }
        Ok(publisher)
    }

    pub fn release_publisher(
        &mut self,
        publisher: PublisherId,
        timestamp: Timestamp,
        fx: &mut Effects,
    ) -> Result<()> {
        let release = self
            .topics
            .remove_publisher(publisher)
            .ok_or(SyncError::PublisherNotFound(publisher))?;
        if release.unpublished {
            self.unannounce(release.topic, timestamp, fx);
        }
        Ok(())
    }

    /// Validate, store and fan out a value.
    ///
    /// A value of the wrong type is rejected before any queue sees it.
    pub fn publish(
        &mut self,
        publisher: PublisherId,
        value: Value,
        timestamp: Timestamp,
        relay: bool,
    ) -> Result<FanOut> {
        let (topic_id, origin) = {
            let p = self.topics.check_value(publisher, &value)?;
            (p.topic, p.owner.origin())
        };
        let (name, type_str) = {
            let topic = self
                .topics
                .topic(topic_id)
                .ok_or(SyncError::PublisherNotFound(publisher))?;
            (Arc::clone(&topic.name), topic.type_str.clone().unwrap_or_default())
        };

        self.topics.set_current(
            topic_id,
            CurrentValue {
                value: value.clone(),
                timestamp,
                publisher,
                origin,
            },
        );
        let update = ValueUpdate {
            topic: topic_id,
            name,
            value,
            timestamp,
            publisher,
            origin,
        };
        let fan = self.topics.fan_out(&update, relay);
        self.loggers
            .record(topic_id, &update.name, &type_str, &update.value, timestamp);
        Ok(fan)
    }

    /// Offer current values of matching topics to a new subscriber.
    pub fn replay(&mut self, subscriber: SubscriberId, relay: bool) -> usize {
        let updates: Vec<ValueUpdate> = match self.topics.subscriber(subscriber) {
            Some(sub) => self
                .topics
                .announced_topics()
                .into_iter()
                .filter_map(|id| self.topics.topic(id))
                .filter(|t| sub.matches(&t.name))
                .filter_map(|t| {
                    t.current.as_ref().map(|c| ValueUpdate {
                        topic: t.id,
                        name: Arc::clone(&t.name),
                        value: c.value.clone(),
                        timestamp: c.timestamp,
                        publisher: c.publisher,
                        origin: c.origin,
                    })
                })
                .collect(),
            None => return 0,
        };

        let Some(sub) = self.topics.subscriber_mut(subscriber) else {
            return 0;
        };
        let mut delivered = 0;
        for update in &updates {
            if let (Owner::Remote(owner), Origin::Remote(source)) = (sub.owner, update.origin) {
                if owner == source || !relay {
                    continue;
                }
            }
            if sub.offer(update) {
                delivered += 1;
            }
        }
        delivered
    }

    // --- Topic maintenance ---

    pub fn set_flags(
        &mut self,
        name: &str,
        flags: TopicFlags,
        timestamp: Timestamp,
        fx: &mut Effects,
    ) -> Result<()> {
        let id = self.announced_id(name)?;
        let orphaned = match self.topics.topic_mut(id) {
            Some(topic) if topic.flags != flags => {
                topic.flags = flags;
                topic.publishers.is_empty() && !topic.is_sticky()
            }
            _ => return Ok(()),
        };
        self.notify_announced(id, OutboundMessage::FlagsUpdate { id, flags }, fx);
        fx.events.push(TopicEvent::Flags {
            name: name.to_string(),
            flags,
        });
        if orphaned {
            self.delete(name, timestamp, fx);
        }
        Ok(())
    }

    pub fn set_properties(
        &mut self,
        name: &str,
        update: &serde_json::Value,
        fx: &mut Effects,
    ) -> Result<()> {
        let map = update.as_object().ok_or_else(|| {
            SyncError::InvalidFormat("properties update must be a JSON object".into())
        })?;
        let id = self.announced_id(name)?;
        let properties = match self.topics.topic_mut(id) {
            Some(topic) => {
                merge_properties(&mut topic.properties, map);
                serde_json::Value::Object(topic.properties.clone())
            }
            None => return Err(SyncError::UnknownTopic(name.to_string())),
        };
        self.notify_announced(
            id,
            OutboundMessage::Properties {
                name: name.to_string(),
                properties: update.clone(),
            },
            fx,
        );
        fx.events.push(TopicEvent::Properties {
            name: name.to_string(),
            properties,
        });
        Ok(())
    }

    /// Delete a topic. Returns false if it was not announced.
    pub fn delete(&mut self, name: &str, timestamp: Timestamp, fx: &mut Effects) -> bool {
        let Some(id) = self.topics.lookup_id(name) else {
            return false;
        };
        if self.topics.delete(name).is_none() {
            return false;
        }
        self.unannounce(id, timestamp, fx);
        self.forget_stale_publishers();
        true
    }

    /// Delete every non-persistent topic. `origin` is not told to clear.
    pub fn clear(
        &mut self,
        origin: Option<ConnectionId>,
        timestamp: Timestamp,
        fx: &mut Effects,
    ) -> usize {
        let names = self.topics.transient_topics();
        let mut cleared = 0;
        for name in &names {
            let Some(id) = self.topics.lookup_id(name) else {
                continue;
            };
            if self.topics.delete(name).is_none() {
                continue;
            }
            for slot in self.slots.values_mut() {
                slot.announced.remove(&id);
            }
            self.loggers.finish_topic(id, timestamp);
            fx.events.push(TopicEvent::Unannounced {
                name: name.clone(),
                id,
            });
            cleared += 1;
        }
        for (connection, slot) in self.slots.iter_mut() {
            if Some(*connection) == origin || slot.state != ConnectionState::Established {
                continue;
            }
            slot.outbox.push(OutboundMessage::ClearTopics);
            fx.wake.insert(*connection);
        }
        self.forget_stale_publishers();
        cleared
    }

    fn forget_stale_publishers(&mut self) {
        let topics = &self.topics;
        for slot in self.slots.values_mut() {
            slot.remote_publishers
                .retain(|_, publisher| topics.publisher(*publisher).is_some());
        }
    }

    // --- Connections ---

    /// Tear down a closing connection: discard its queues, drop its
    /// subscribers and release its publishers.
    pub fn finish_close(&mut self, connection: ConnectionId, timestamp: Timestamp, fx: &mut Effects) {
        let Some(mut slot) = self.slots.remove(&connection) else {
            return;
        };
        let owner = Owner::Remote(connection);

        let subscribers: Vec<SubscriberId> =
            self.topics.subscribers_of(owner).map(|s| s.id).collect();
        let mut discarded = slot.outbox.len();
        for id in subscribers {
            if let Some(subscriber) = self.topics.remove_subscriber(id) {
                discarded += subscriber.queue.clear();
            }
        }
        for publisher in self.topics.publishers_of(owner) {
            let _ = self.release_publisher(publisher, timestamp, fx);
        }

        if slot.transition(connection, ConnectionState::Closed).is_err() {
            slot.state = ConnectionState::Closed;
        }
        tracing::debug!(
            connection = %connection,
            reason = ?slot.close_reason,
            discarded,
            "connection closed"
        );
        fx.closed.push(connection);
    }

    // --- Inbound ---

    /// Apply a message from a peer. Failures stay on this connection and
    /// are only logged.
    pub fn handle_inbound(
        &mut self,
        connection: ConnectionId,
        message: InboundMessage,
        now: Timestamp,
        relay: bool,
        fx: &mut Effects,
    ) {
        let owner = Owner::Remote(connection);
        match message {
            InboundMessage::KeepAlive => {}
            InboundMessage::Publish {
                pubuid,
                name,
                type_str,
                properties,
            } => match self.create_publisher(&name, &type_str, &properties, owner, fx) {
                Ok(publisher) => {
                    let previous = self
                        .slots
                        .get_mut(&connection)
                        .and_then(|s| s.remote_publishers.insert(pubuid, publisher));
                    if let Some(previous) = previous {
                        let _ = self.release_publisher(previous, now, fx);
                    }
                }
                Err(e) => {
                    tracing::debug!(connection = %connection, topic = %name, error = %e, "rejected remote publish");
                }
            },
            InboundMessage::Unpublish { pubuid } => {
                let publisher = self
                    .slots
                    .get_mut(&connection)
                    .and_then(|s| s.remote_publishers.remove(&pubuid));
                if let Some(publisher) = publisher {
                    let _ = self.release_publisher(publisher, now, fx);
                }
            }
            InboundMessage::ValueUpdate {
                pubuid,
                value,
                timestamp,
            } => {
                let publisher = self
                    .slots
                    .get(&connection)
                    .and_then(|s| s.remote_publishers.get(&pubuid).copied());
                let Some(publisher) = publisher else {
                    tracing::debug!(connection = %connection, pubuid, "value from unknown publisher");
                    return;
                };
                match self.publish(publisher, value, timestamp.or_now(), relay) {
                    Ok(fan) => fx.wake.extend(fan.connections),
                    Err(e) => {
                        tracing::debug!(connection = %connection, pubuid, error = %e, "rejected remote value");
                    }
                }
            }
            InboundMessage::Subscribe {
                subuid,
                topics,
                options,
            } => {
                let options = PubSubOptions::from_directives(&options);
                let ids: Vec<SubscriberId> = topics
                    .iter()
                    .map(|pattern| {
                        self.topics
                            .add_subscriber(pattern, options.clone(), owner, None)
                    })
                    .collect();
                let previous = self
                    .slots
                    .get_mut(&connection)
                    .and_then(|s| s.remote_subscribers.insert(subuid, ids.clone()));
                for id in previous.into_iter().flatten() {
                    self.topics.remove_subscriber(id);
                }
                self.sync_announcements(connection, fx);
                for id in ids {
                    self.replay(id, relay);
                }
                fx.wake.insert(connection);
            }
            InboundMessage::Unsubscribe { subuid } => {
                let ids = self
                    .slots
                    .get_mut(&connection)
                    .and_then(|s| s.remote_subscribers.remove(&subuid));
                for id in ids.into_iter().flatten() {
                    self.topics.remove_subscriber(id);
                }
            }
            InboundMessage::SetProperties { name, update } => {
                if let Err(e) = self.set_properties(&name, &update, fx) {
                    tracing::debug!(connection = %connection, topic = %name, error = %e, "rejected properties update");
                }
            }
            InboundMessage::SetFlags { name, flags } => {
                if let Err(e) = self.set_flags(&name, flags, now, fx) {
                    tracing::debug!(connection = %connection, topic = %name, error = %e, "rejected flags update");
                }
            }
            InboundMessage::DeleteTopic { name } => {
                if !self.delete(&name, now, fx) {
                    tracing::debug!(connection = %connection, topic = %name, "delete of unknown topic");
                }
            }
            InboundMessage::ClearTopics => {
                self.clear(Some(connection), now, fx);
            }
        }
    }
}
