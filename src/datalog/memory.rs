//! In-memory data log.

use super::{DataLog, LogEntryId, LogRecord};
use crate::error::{Result, SyncError};
use crate::types::{Timestamp, Value};
use parking_lot::Mutex;
use std::collections::HashSet;

#[derive(Default)]
struct Inner {
    records: Vec<LogRecord>,
    open: HashSet<LogEntryId>,
    next_entry: u32,
}

/// Data log that keeps every record in memory.
#[derive(Default)]
pub struct MemoryDataLog {
    inner: Mutex<Inner>,
}

impl MemoryDataLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records in append order.
    pub fn records(&self) -> Vec<LogRecord> {
        self.inner.lock().records.clone()
    }

    /// Entries started and not yet finished.
    pub fn open_entries(&self) -> usize {
        self.inner.lock().open.len()
    }
}

impl DataLog for MemoryDataLog {
    fn start(
        &self,
        name: &str,
        type_str: &str,
        metadata: &str,
        timestamp: Timestamp,
    ) -> Result<LogEntryId> {
        let mut inner = self.inner.lock();
        inner.next_entry += 1;
        let entry = LogEntryId(inner.next_entry);
        inner.open.insert(entry);
        inner.records.push(LogRecord::Start {
            entry,
            name: name.to_string(),
            type_str: type_str.to_string(),
            metadata: metadata.to_string(),
            timestamp: timestamp.or_now(),
        });
        Ok(entry)
    }

    fn append(&self, entry: LogEntryId, value: &Value, timestamp: Timestamp) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.open.contains(&entry) {
            return Err(SyncError::InvalidFormat(format!("entry {:?} is not open", entry)));
        }
        inner.records.push(LogRecord::Append {
            entry,
            value: value.clone(),
            timestamp: timestamp.or_now(),
        });
        Ok(())
    }

    fn finish(&self, entry: LogEntryId, timestamp: Timestamp) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.open.remove(&entry) {
            return Err(SyncError::InvalidFormat(format!("entry {:?} is not open", entry)));
        }
        inner.records.push(LogRecord::Finish {
            entry,
            timestamp: timestamp.or_now(),
        });
        Ok(())
    }
}
