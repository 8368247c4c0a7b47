//! Structured append-only data logging.
//!
//! A [`DataLog`] durably records typed, timestamped values under named
//! entries. Entry metadata (name, type string, free-form metadata) is supplied
//! once when the entry is started and never changes. A timestamp of zero
//! means "now".
//!
//! Two implementations ship with the crate:
//! - [`FileDataLog`]: checksummed append-only file
//! - [`MemoryDataLog`]: in-memory record list

mod file;
mod memory;

pub use file::FileDataLog;
pub use memory::MemoryDataLog;

use crate::error::{Result, SyncError};
use crate::types::{Timestamp, Value, ValueType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identifier for an entry within one log.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogEntryId(pub u32);

impl fmt::Debug for LogEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogEntryId({})", self.0)
    }
}

/// One record in a data log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LogRecord {
    Start {
        entry: LogEntryId,
        name: String,
        type_str: String,
        metadata: String,
        timestamp: Timestamp,
    },
    Append {
        entry: LogEntryId,
        value: Value,
        timestamp: Timestamp,
    },
    Finish {
        entry: LogEntryId,
        timestamp: Timestamp,
    },
}

/// Append-only structured log.
pub trait DataLog: Send + Sync {
    /// Start a new entry.
    fn start(
        &self,
        name: &str,
        type_str: &str,
        metadata: &str,
        timestamp: Timestamp,
    ) -> Result<LogEntryId>;

    /// Append a value to an entry.
    fn append(&self, entry: LogEntryId, value: &Value, timestamp: Timestamp) -> Result<()>;

    /// Mark an entry as finished.
    fn finish(&self, entry: LogEntryId, timestamp: Timestamp) -> Result<()>;
}

/// A started log entry bound to one value kind.
///
/// Values of any other kind are rejected before they reach the log.
pub struct DataLogEntry {
    log: Arc<dyn DataLog>,
    id: LogEntryId,
    name: String,
    type_str: String,
    metadata: String,
    value_type: ValueType,
}

impl DataLogEntry {
    pub fn start(
        log: Arc<dyn DataLog>,
        name: &str,
        type_str: &str,
        metadata: &str,
        timestamp: Timestamp,
    ) -> Result<Self> {
        let id = log.start(name, type_str, metadata, timestamp)?;
        Ok(Self {
            log,
            id,
            name: name.to_string(),
            type_str: type_str.to_string(),
            metadata: metadata.to_string(),
            value_type: ValueType::from_type_str(type_str),
        })
    }

    /// Append a value; `Timestamp::NOW` records the current time.
    pub fn append(&self, value: impl Into<Value>, timestamp: Timestamp) -> Result<()> {
        let value = value.into();
        if value.value_type() != self.value_type {
            return Err(SyncError::TypeMismatch {
                topic: self.name.clone(),
                expected: self.type_str.clone(),
                got: value.value_type().type_str().to_string(),
            });
        }
        self.log.append(self.id, &value, timestamp)
    }

    pub fn finish(self, timestamp: Timestamp) -> Result<()> {
        self.log.finish(self.id, timestamp)
    }

    pub fn id(&self) -> LogEntryId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_str(&self) -> &str {
        &self.type_str
    }

    pub fn metadata(&self) -> &str {
        &self.metadata
    }
}
