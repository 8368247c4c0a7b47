//! Mirrors topic values into data logs.

use crate::datalog::{DataLog, DataLogEntry};
use crate::types::{Timestamp, TopicId, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Metadata attached to every entry started by a data logger.
const LOG_METADATA: &str = r#"{"source":"NT"}"#;

/// Identifier of a running data logger.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DataLoggerId(pub u32);

impl fmt::Debug for DataLoggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataLoggerId({})", self.0)
    }
}

struct DataLogger {
    log: Arc<dyn DataLog>,
    prefix: String,
    log_prefix: String,
    entries: HashMap<TopicId, DataLogEntry>,
}

impl DataLogger {
    fn entry_name(&self, name: &str) -> String {
        let suffix = name.strip_prefix(self.prefix.as_str()).unwrap_or(name);
        format!("{}{}", self.log_prefix, suffix)
    }

    fn finish(&mut self, topic: TopicId, timestamp: Timestamp) {
        if let Some(entry) = self.entries.remove(&topic) {
            let name = entry.name().to_string();
            if let Err(e) = entry.finish(timestamp) {
                tracing::warn!(entry = %name, error = %e, "data log finish failed");
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct DataLoggers {
    loggers: HashMap<DataLoggerId, DataLogger>,
    next_id: u32,
}

impl DataLoggers {
    pub fn add(&mut self, log: Arc<dyn DataLog>, prefix: &str, log_prefix: &str) -> DataLoggerId {
        self.next_id += 1;
        let id = DataLoggerId(self.next_id);
        self.loggers.insert(
            id,
            DataLogger {
                log,
                prefix: prefix.to_string(),
                log_prefix: log_prefix.to_string(),
                entries: HashMap::new(),
            },
        );
        id
    }

    /// Stop a logger, finishing all of its entries.
    pub fn remove(&mut self, id: DataLoggerId, timestamp: Timestamp) -> bool {
        let Some(mut logger) = self.loggers.remove(&id) else {
            return false;
        };
        let topics: Vec<TopicId> = logger.entries.keys().copied().collect();
        for topic in topics {
            logger.finish(topic, timestamp);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.loggers.len()
    }

    /// Append a value change to every logger covering the topic.
    ///
    /// Entries are started on first value and restarted if the topic's type
    /// changed since.
    pub fn record(
        &mut self,
        topic: TopicId,
        name: &str,
        type_str: &str,
        value: &Value,
        timestamp: Timestamp,
    ) {
        for logger in self.loggers.values_mut() {
            if !name.starts_with(logger.prefix.as_str()) {
                continue;
            }
            if logger
                .entries
                .get(&topic)
                .map(|e| e.type_str() != type_str)
                .unwrap_or(false)
            {
                logger.finish(topic, timestamp);
            }
            if !logger.entries.contains_key(&topic) {
                let entry_name = logger.entry_name(name);
                match DataLogEntry::start(
                    Arc::clone(&logger.log),
                    &entry_name,
                    type_str,
                    LOG_METADATA,
                    timestamp,
                ) {
                    Ok(entry) => {
                        logger.entries.insert(topic, entry);
                    }
                    Err(e) => {
                        tracing::warn!(entry = %entry_name, error = %e, "data log start failed");
                        continue;
                    }
                }
            }
            if let Some(entry) = logger.entries.get(&topic) {
                if let Err(e) = entry.append(value.clone(), timestamp) {
                    tracing::warn!(entry = %entry.name(), error = %e, "data log append failed");
                }
            }
        }
    }

    /// Finish the topic's entry in every logger.
    pub fn finish_topic(&mut self, topic: TopicId, timestamp: Timestamp) {
        for logger in self.loggers.values_mut() {
            logger.finish(topic, timestamp);
        }
    }
}
