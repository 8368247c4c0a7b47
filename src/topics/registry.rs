//! Topic, publisher and subscriber namespace.
//!
//! The registry is plain data. It performs no locking; the engine owns it
//! behind its table lock and keeps every call short.

use crate::error::{Result, SyncError};
use crate::options::PubSubOptions;
use crate::protocol::TopicFlags;
use crate::subscriptions::{evaluate, Delivery, SubscriberContext, SubscriptionQueue};
use crate::types::{
    ConnectionId, Origin, PublisherId, SubscriberId, Timestamp, TopicId, Value, ValueType,
    ValueUpdate,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Who created a publisher or subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Owner {
    Local,
    Remote(ConnectionId),
}

impl Owner {
    pub fn origin(self) -> Origin {
        match self {
            Owner::Local => Origin::Local,
            Owner::Remote(id) => Origin::Remote(id),
        }
    }

    pub fn connection(self) -> Option<ConnectionId> {
        match self {
            Owner::Local => None,
            Owner::Remote(id) => Some(id),
        }
    }
}

/// The most recent value of a topic and who wrote it.
#[derive(Clone, Debug, PartialEq)]
pub struct CurrentValue {
    pub value: Value,
    pub timestamp: Timestamp,
    pub publisher: PublisherId,
    pub origin: Origin,
}

/// A named, typed slot in the table.
#[derive(Clone, Debug)]
pub struct Topic {
    pub id: TopicId,
    pub name: Arc<str>,
    /// Declared type; `None` until a publisher announces the topic.
    pub type_str: Option<String>,
    pub properties: serde_json::Map<String, serde_json::Value>,
    pub flags: TopicFlags,
    pub current: Option<CurrentValue>,
    pub publishers: BTreeSet<PublisherId>,
}

impl Topic {
    fn new(id: TopicId, name: Arc<str>) -> Self {
        Self {
            id,
            name,
            type_str: None,
            properties: serde_json::Map::new(),
            flags: TopicFlags::default(),
            current: None,
            publishers: BTreeSet::new(),
        }
    }

    pub fn is_announced(&self) -> bool {
        self.type_str.is_some()
    }

    pub fn value_type(&self) -> Option<ValueType> {
        self.type_str.as_deref().map(ValueType::from_type_str)
    }

    /// Whether the topic outlives its last publisher.
    pub fn is_sticky(&self) -> bool {
        self.flags.persistent || self.flags.retained
    }

    pub fn info(&self) -> TopicInfo {
        TopicInfo {
            id: self.id,
            name: self.name.to_string(),
            type_str: self.type_str.clone().unwrap_or_default(),
            properties: serde_json::Value::Object(self.properties.clone()),
            flags: self.flags,
            last_change: self.current.as_ref().map(|c| c.timestamp),
        }
    }

    fn reset(&mut self) {
        self.type_str = None;
        self.current = None;
        self.publishers.clear();
    }
}

/// Public description of a topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TopicInfo {
    pub id: TopicId,
    pub name: String,
    pub type_str: String,
    pub properties: serde_json::Value,
    pub flags: TopicFlags,
    pub last_change: Option<Timestamp>,
}

/// A write binding to one topic.
#[derive(Clone, Debug)]
pub struct Publisher {
    pub id: PublisherId,
    pub topic: TopicId,
    pub owner: Owner,
    pub type_str: String,
}

/// A read binding to a topic name or prefix.
pub struct Subscriber {
    pub id: SubscriberId,
    pub pattern: String,
    pub options: PubSubOptions,
    pub owner: Owner,
    /// Publisher paired with this subscriber when both form an entry.
    pub entry_publisher: Option<PublisherId>,
    pub queue: Arc<SubscriptionQueue>,
    /// Last delivered value per (topic, publisher).
    last_delivered: HashMap<(TopicId, PublisherId), Value>,
}

impl Subscriber {
    pub fn matches(&self, name: &str) -> bool {
        if self.options.prefix_match {
            name.starts_with(&self.pattern)
        } else {
            name == self.pattern
        }
    }

    /// Run the delivery policy and enqueue the update if accepted.
    pub fn offer(&mut self, update: &ValueUpdate) -> bool {
        let key = (update.topic, update.publisher);
        let context = SubscriberContext {
            entry_publisher: self.entry_publisher,
            last_delivered: self.last_delivered.get(&key),
        };
        match evaluate(update, &self.options, &context) {
            Delivery::Accept => {
                self.last_delivered.insert(key, update.value.clone());
                self.queue.enqueue(update.clone());
                true
            }
            Delivery::Reject(reason) => {
                tracing::trace!(
                    subscriber = %self.id,
                    topic = %update.name,
                    ?reason,
                    "update not delivered"
                );
                false
            }
        }
    }

    fn forget_topic(&mut self, topic: TopicId) {
        self.last_delivered.retain(|(t, _), _| *t != topic);
    }

    fn forget_publisher(&mut self, topic: TopicId, publisher: PublisherId) {
        self.last_delivered.remove(&(topic, publisher));
    }
}

/// Result of fanning an update out to subscribers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FanOut {
    /// Subscribers whose queue accepted the update.
    pub delivered: usize,
    /// Connections owning at least one of those subscribers.
    pub connections: BTreeSet<ConnectionId>,
}

/// Result of releasing a publisher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublisherRelease {
    pub topic: TopicId,
    /// The topic lost its type because no publishers remain.
    pub unpublished: bool,
}

/// The table namespace.
pub struct TopicRegistry {
    topics: HashMap<TopicId, Topic>,
    names: HashMap<Arc<str>, TopicId>,
    publishers: HashMap<PublisherId, Publisher>,
    subscribers: HashMap<SubscriberId, Subscriber>,
    next_topic: u32,
    next_publisher: u32,
    next_subscriber: u32,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self {
            topics: HashMap::new(),
            names: HashMap::new(),
            publishers: HashMap::new(),
            subscribers: HashMap::new(),
            next_topic: 1,
            next_publisher: 1,
            next_subscriber: 1,
        }
    }

    // --- Topics ---

    /// Look up a topic by name, creating an untyped one if missing.
    pub fn get_or_create(&mut self, name: &str) -> Result<TopicId> {
        if name.is_empty() {
            return Err(SyncError::InvalidName(name.to_string()));
        }
        if let Some(id) = self.names.get(name) {
            return Ok(*id);
        }
        let id = TopicId(self.next_topic);
        self.next_topic += 1;
        let name: Arc<str> = Arc::from(name);
        self.names.insert(Arc::clone(&name), id);
        self.topics.insert(id, Topic::new(id, name));
        Ok(id)
    }

    pub fn topic(&self, id: TopicId) -> Option<&Topic> {
        self.topics.get(&id)
    }

    pub fn topic_mut(&mut self, id: TopicId) -> Option<&mut Topic> {
        self.topics.get_mut(&id)
    }

    pub fn lookup(&self, name: &str) -> Option<&Topic> {
        self.names.get(name).and_then(|id| self.topics.get(id))
    }

    pub fn lookup_id(&self, name: &str) -> Option<TopicId> {
        self.names.get(name).copied()
    }

    /// Announced topics under `prefix`, optionally restricted to value types.
    pub fn topics_matching(&self, prefix: &str, types: &[ValueType]) -> Vec<TopicInfo> {
        let mut infos: Vec<TopicInfo> = self
            .topics
            .values()
            .filter(|t| t.is_announced() && t.name.starts_with(prefix))
            .filter(|t| {
                types.is_empty() || t.value_type().map(|vt| types.contains(&vt)).unwrap_or(false)
            })
            .map(Topic::info)
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Ids of all announced topics.
    pub fn announced_topics(&self) -> Vec<TopicId> {
        let mut ids: Vec<TopicId> = self
            .topics
            .values()
            .filter(|t| t.is_announced())
            .map(|t| t.id)
            .collect();
        ids.sort();
        ids
    }

    /// Store the current value of a topic.
    pub fn set_current(&mut self, id: TopicId, current: CurrentValue) {
        if let Some(topic) = self.topics.get_mut(&id) {
            topic.current = Some(current);
        }
    }

    /// Remove type, value and publishers from a topic.
    ///
    /// Returns the topic id if it was announced.
    pub fn delete(&mut self, name: &str) -> Option<TopicId> {
        let id = *self.names.get(name)?;
        let topic = self.topics.get_mut(&id)?;
        if !topic.is_announced() {
            return None;
        }
        let publishers: Vec<PublisherId> = topic.publishers.iter().copied().collect();
        topic.reset();
        topic.flags = TopicFlags::default();
        topic.properties.clear();
        for publisher in publishers {
            self.publishers.remove(&publisher);
        }
        for subscriber in self.subscribers.values_mut() {
            subscriber.forget_topic(id);
        }
        Some(id)
    }

    /// Names of announced topics that are not persistent.
    pub fn transient_topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .topics
            .values()
            .filter(|t| t.is_announced() && !t.flags.persistent)
            .map(|t| t.name.to_string())
            .collect();
        names.sort();
        names
    }

    // --- Publishers ---

    /// Bind a publisher to a topic, announcing the topic if it has no type.
    ///
    /// Returns the publisher id and whether the topic was newly announced.
    pub fn add_publisher(
        &mut self,
        name: &str,
        type_str: &str,
        properties: &serde_json::Value,
        owner: Owner,
    ) -> Result<(PublisherId, bool)> {
        let topic_id = self.get_or_create(name)?;
        let topic = self
            .topics
            .get_mut(&topic_id)
            .ok_or_else(|| SyncError::UnknownTopic(name.to_string()))?;

        let announced = match &topic.type_str {
            Some(existing) if existing != type_str => {
                return Err(SyncError::TypeMismatch {
                    topic: name.to_string(),
                    expected: existing.clone(),
                    got: type_str.to_string(),
                });
            }
            Some(_) => false,
            None => {
                topic.type_str = Some(type_str.to_string());
                true
            }
        };

        if let serde_json::Value::Object(map) = properties {
            merge_properties(&mut topic.properties, map);
        }

        let id = PublisherId(self.next_publisher);
        self.next_publisher += 1;
        topic.publishers.insert(id);
        self.publishers.insert(
            id,
            Publisher {
                id,
                topic: topic_id,
                owner,
                type_str: type_str.to_string(),
            },
        );
        Ok((id, announced))
    }

    pub fn publisher(&self, id: PublisherId) -> Option<&Publisher> {
        self.publishers.get(&id)
    }

    /// Release a publisher. A non-sticky topic left without publishers is
    /// unpublished: its type and value are cleared.
    pub fn remove_publisher(&mut self, id: PublisherId) -> Option<PublisherRelease> {
        let publisher = self.publishers.remove(&id)?;
        let topic = self.topics.get_mut(&publisher.topic)?;
        topic.publishers.remove(&id);

        let unpublished = topic.publishers.is_empty() && !topic.is_sticky();
        let topic_id = topic.id;
        if unpublished {
            topic.reset();
        }
        for subscriber in self.subscribers.values_mut() {
            if unpublished {
                subscriber.forget_topic(topic_id);
            } else {
                subscriber.forget_publisher(topic_id, id);
            }
        }
        Some(PublisherRelease {
            topic: publisher.topic,
            unpublished,
        })
    }

    /// Validate a value against the publisher's topic type.
    pub fn check_value(&self, publisher: PublisherId, value: &Value) -> Result<&Publisher> {
        let p = self
            .publishers
            .get(&publisher)
            .ok_or(SyncError::PublisherNotFound(publisher))?;
        let topic = self
            .topics
            .get(&p.topic)
            .ok_or(SyncError::PublisherNotFound(publisher))?;
        let expected = topic.value_type().unwrap_or(ValueType::Raw);
        if value.value_type() != expected {
            return Err(SyncError::TypeMismatch {
                topic: topic.name.to_string(),
                expected: topic.type_str.clone().unwrap_or_default(),
                got: value.value_type().type_str().to_string(),
            });
        }
        Ok(p)
    }

    // --- Subscribers ---

    pub fn add_subscriber(
        &mut self,
        pattern: &str,
        options: PubSubOptions,
        owner: Owner,
        entry_publisher: Option<PublisherId>,
    ) -> SubscriberId {
        let id = SubscriberId(self.next_subscriber);
        self.next_subscriber += 1;
        let queue = Arc::new(SubscriptionQueue::from_options(&options));
        self.subscribers.insert(
            id,
            Subscriber {
                id,
                pattern: pattern.to_string(),
                options,
                owner,
                entry_publisher,
                queue,
                last_delivered: HashMap::new(),
            },
        );
        id
    }

    pub fn subscriber(&self, id: SubscriberId) -> Option<&Subscriber> {
        self.subscribers.get(&id)
    }

    pub fn subscriber_mut(&mut self, id: SubscriberId) -> Option<&mut Subscriber> {
        self.subscribers.get_mut(&id)
    }

    pub fn remove_subscriber(&mut self, id: SubscriberId) -> Option<Subscriber> {
        self.subscribers.remove(&id)
    }

    /// Subscribers owned by a connection.
    pub fn subscribers_of(&self, owner: Owner) -> impl Iterator<Item = &Subscriber> {
        self.subscribers.values().filter(move |s| s.owner == owner)
    }

    /// Whether any subscriber owned by `owner` matches `name`.
    pub fn owner_wants(&self, owner: Owner, name: &str) -> bool {
        self.subscribers_of(owner).any(|s| s.matches(name))
    }

    /// Publishers owned by a connection.
    pub fn publishers_of(&self, owner: Owner) -> Vec<PublisherId> {
        let mut ids: Vec<PublisherId> = self
            .publishers
            .values()
            .filter(|p| p.owner == owner)
            .map(|p| p.id)
            .collect();
        ids.sort();
        ids
    }

    /// Offer an update to every subscriber whose pattern matches the topic.
    ///
    /// Updates are never echoed to the connection they came from. With
    /// `relay` unset, remote updates only reach local subscribers.
    pub fn fan_out(&mut self, update: &ValueUpdate, relay: bool) -> FanOut {
        let mut result = FanOut::default();
        for subscriber in self.subscribers.values_mut() {
            if !subscriber.matches(&update.name) {
                continue;
            }
            if let (Owner::Remote(owner), Origin::Remote(source)) = (subscriber.owner, update.origin)
            {
                if owner == source || !relay {
                    continue;
                }
            }
            if subscriber.offer(update) {
                result.delivered += 1;
                if let Some(connection) = subscriber.owner.connection() {
                    result.connections.insert(connection);
                }
            }
        }
        result
    }

    pub fn topic_count(&self) -> usize {
        self.topics.values().filter(|t| t.is_announced()).count()
    }

    pub fn publisher_count(&self) -> usize {
        self.publishers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge a properties update; `null` values delete keys.
pub fn merge_properties(
    target: &mut serde_json::Map<String, serde_json::Value>,
    update: &serde_json::Map<String, serde_json::Value>,
) {
    for (key, value) in update {
        if value.is_null() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::PubSubOption;
    use serde_json::json;

    fn update_for(registry: &TopicRegistry, publisher: PublisherId, value: f64) -> ValueUpdate {
        let p = registry.publisher(publisher).unwrap();
        let topic = registry.topic(p.topic).unwrap();
        ValueUpdate {
            topic: topic.id,
            name: Arc::clone(&topic.name),
            value: Value::Double(value),
            timestamp: Timestamp(1),
            publisher,
            origin: Origin::Local,
        }
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut registry = TopicRegistry::new();
        assert!(matches!(
            registry.get_or_create(""),
            Err(SyncError::InvalidName(_))
        ));
    }

    #[test]
    fn test_type_fixed_by_first_publisher() {
        let mut registry = TopicRegistry::new();
        let (_, announced) = registry
            .add_publisher("/T", "double", &json!({}), Owner::Local)
            .unwrap();
        assert!(announced);

        let (_, again) = registry
            .add_publisher("/T", "double", &json!({}), Owner::Local)
            .unwrap();
        assert!(!again);

        let mismatch = registry.add_publisher("/T", "string", &json!({}), Owner::Local);
        assert!(matches!(mismatch, Err(SyncError::TypeMismatch { .. })));
    }

    #[test]
    fn test_check_value_type() {
        let mut registry = TopicRegistry::new();
        let (p, _) = registry
            .add_publisher("/T", "double", &json!({}), Owner::Local)
            .unwrap();
        assert!(registry.check_value(p, &Value::Double(1.0)).is_ok());
        assert!(matches!(
            registry.check_value(p, &Value::Boolean(true)),
            Err(SyncError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_struct_types_carry_raw() {
        let mut registry = TopicRegistry::new();
        let (p, _) = registry
            .add_publisher("/pose", "struct:Pose2d", &json!({}), Owner::Local)
            .unwrap();
        assert!(registry.check_value(p, &Value::Raw(vec![1, 2, 3])).is_ok());
    }

    #[test]
    fn test_unpublish_on_last_release() {
        let mut registry = TopicRegistry::new();
        let (a, _) = registry
            .add_publisher("/T", "double", &json!({}), Owner::Local)
            .unwrap();
        let (b, _) = registry
            .add_publisher("/T", "double", &json!({}), Owner::Local)
            .unwrap();

        assert!(!registry.remove_publisher(a).unwrap().unpublished);
        assert!(registry.remove_publisher(b).unwrap().unpublished);
        assert!(!registry.lookup("/T").unwrap().is_announced());

        // type may change once unpublished
        assert!(registry
            .add_publisher("/T", "string", &json!({}), Owner::Local)
            .is_ok());
    }

    #[test]
    fn test_release_forgets_publisher_history() {
        let mut registry = TopicRegistry::new();
        let (a, _) = registry
            .add_publisher("/T", "double", &json!({}), Owner::Local)
            .unwrap();
        let (b, _) = registry
            .add_publisher("/T", "double", &json!({}), Owner::Local)
            .unwrap();
        let sub = registry.add_subscriber(
            "/T",
            PubSubOptions::from_directives(&[PubSubOption::SendAll(true)]),
            Owner::Local,
            None,
        );

        let first = update_for(&registry, a, 1.0);
        let second = update_for(&registry, b, 2.0);
        registry.fan_out(&first, true);
        registry.fan_out(&second, true);
        assert_eq!(registry.subscriber(sub).unwrap().last_delivered.len(), 2);

        assert!(!registry.remove_publisher(a).unwrap().unpublished);
        let history = &registry.subscriber(sub).unwrap().last_delivered;
        assert_eq!(history.len(), 1);
        assert!(history.contains_key(&(second.topic, b)));
    }

    #[test]
    fn test_retained_topic_survives_release() {
        let mut registry = TopicRegistry::new();
        let (p, _) = registry
            .add_publisher("/T", "double", &json!({}), Owner::Local)
            .unwrap();
        let id = registry.lookup_id("/T").unwrap();
        registry.topic_mut(id).unwrap().flags.retained = true;

        assert!(!registry.remove_publisher(p).unwrap().unpublished);
        assert!(registry.lookup("/T").unwrap().is_announced());
    }

    #[test]
    fn test_properties_merge() {
        let mut registry = TopicRegistry::new();
        registry
            .add_publisher("/T", "double", &json!({"unit": "m", "x": 1}), Owner::Local)
            .unwrap();
        let id = registry.lookup_id("/T").unwrap();
        let update = json!({"x": null, "y": 2});
        if let serde_json::Value::Object(map) = &update {
            merge_properties(&mut registry.topic_mut(id).unwrap().properties, map);
        }
        assert_eq!(
            registry.lookup("/T").unwrap().info().properties,
            json!({"unit": "m", "y": 2})
        );
    }

    #[test]
    fn test_fan_out_exact_and_prefix() {
        let mut registry = TopicRegistry::new();
        let (p, _) = registry
            .add_publisher("/drive/speed", "double", &json!({}), Owner::Local)
            .unwrap();
        let exact = registry.add_subscriber("/drive/speed", PubSubOptions::default(), Owner::Local, None);
        let prefix = registry.add_subscriber(
            "/drive/",
            PubSubOptions::from_directives(&[PubSubOption::PrefixMatch(true)]),
            Owner::Remote(ConnectionId(4)),
            None,
        );
        let other = registry.add_subscriber("/arm", PubSubOptions::default(), Owner::Local, None);

        let fan = registry.fan_out(&update_for(&registry, p, 1.0), true);
        assert_eq!(fan.delivered, 2);
        assert_eq!(fan.connections.into_iter().collect::<Vec<_>>(), vec![ConnectionId(4)]);
        assert_eq!(registry.subscriber(exact).unwrap().queue.len(), 1);
        assert_eq!(registry.subscriber(prefix).unwrap().queue.len(), 1);
        assert!(registry.subscriber(other).unwrap().queue.is_empty());
    }

    #[test]
    fn test_duplicates_suppressed_per_subscriber() {
        let mut registry = TopicRegistry::new();
        let (p, _) = registry
            .add_publisher("/T", "double", &json!({}), Owner::Local)
            .unwrap();
        let sub = registry.add_subscriber("/T", PubSubOptions::default(), Owner::Local, None);

        assert_eq!(registry.fan_out(&update_for(&registry, p, 1.0), true).delivered, 1);
        registry.subscriber(sub).unwrap().queue.drain();
        assert_eq!(registry.fan_out(&update_for(&registry, p, 1.0), true).delivered, 0);
        assert_eq!(registry.fan_out(&update_for(&registry, p, 3.0), true).delivered, 1);
    }

    #[test]
    fn test_topics_matching() {
        let mut registry = TopicRegistry::new();
        registry
            .add_publisher("/a/x", "double", &json!({}), Owner::Local)
            .unwrap();
        registry
            .add_publisher("/a/y", "string", &json!({}), Owner::Local)
            .unwrap();
        registry
            .add_publisher("/b/z", "double", &json!({}), Owner::Local)
            .unwrap();
        registry.get_or_create("/a/untyped").unwrap();

        let names: Vec<String> = registry
            .topics_matching("/a/", &[])
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["/a/x", "/a/y"]);

        let doubles = registry.topics_matching("", &[ValueType::Double]);
        assert_eq!(doubles.len(), 2);
    }

    #[test]
    fn test_delete_removes_publishers() {
        let mut registry = TopicRegistry::new();
        let (p, _) = registry
            .add_publisher("/T", "double", &json!({}), Owner::Local)
            .unwrap();
        assert!(registry.delete("/T").is_some());
        assert!(registry.publisher(p).is_none());
        assert!(registry.delete("/T").is_none());
        assert_eq!(registry.topic_count(), 0);
    }
}
