//! Append-only file data log.

use super::{DataLog, LogEntryId, LogRecord};
use crate::error::{Result, SyncError};
use crate::types::{Timestamp, Value};
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes at the start of every record.
const LOG_MAGIC: &[u8; 4] = b"NTL\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Record header size: magic + version + flags + payload length.
const RECORD_HEADER_SIZE: u64 = 4 + 1 + 1 + 4;

struct Inner {
    file: File,
    /// Current file size (for appending).
    file_size: u64,
    next_entry: u32,
    open: HashSet<LogEntryId>,
    /// Number of writes since last sync.
    writes_since_sync: u64,
}

/// Data log backed by a single append-only file.
///
/// Each record is framed as magic, version, flags, payload length, a
/// MessagePack-encoded [`LogRecord`] and a CRC32 of the payload. The file is
/// locked exclusively while open.
pub struct FileDataLog {
    path: PathBuf,
    inner: Mutex<Inner>,
    /// Sync every N writes.
    sync_interval: u64,
}

impl FileDataLog {
    /// Default sync interval.
    const DEFAULT_SYNC_INTERVAL: u64 = 100;

    /// Open or create a log with the default sync interval.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(path, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a log, syncing to disk every `sync_interval` writes
    /// (0 behaves like 1).
    pub fn open_with_sync_interval(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        file.try_lock_exclusive().map_err(|_| SyncError::Locked)?;

        let file_size = file.metadata()?.len();
        let existing = if file_size > 0 {
            read_records(&mut file, file_size)?
        } else {
            Vec::new()
        };

        // Entry ids continue after the highest one already in the file.
        let next_entry = existing
            .iter()
            .filter_map(|r| match r {
                LogRecord::Start { entry, .. } => Some(entry.0),
                _ => None,
            })
            .max()
            .unwrap_or(0);

        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                file,
                file_size,
                next_entry,
                open: HashSet::new(),
                writes_since_sync: 0,
            }),
            sync_interval: sync_interval.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file size.
    pub fn size(&self) -> u64 {
        self.inner.lock().file_size
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.sync_all()?;
        inner.writes_since_sync = 0;
        Ok(())
    }

    /// Read every record in the file, verifying checksums.
    pub fn records(&self) -> Result<Vec<LogRecord>> {
        let mut inner = self.inner.lock();
        let size = inner.file_size;
        read_records(&mut inner.file, size)
    }

    fn write(&self, inner: &mut Inner, record: &LogRecord) -> Result<()> {
        let payload = rmp_serde::to_vec_named(record)?;
        let checksum = crc32fast::hash(&payload);

        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE as usize + payload.len() + 4);
        buf.extend_from_slice(LOG_MAGIC);
        buf.push(LOG_VERSION);
        // Flags (reserved)
        buf.push(0u8);
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&payload);
        buf.extend_from_slice(&checksum.to_le_bytes());

        let offset = inner.file_size;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&buf)?;
        inner.file_size = offset + buf.len() as u64;

        inner.writes_since_sync += 1;
        if inner.writes_since_sync >= self.sync_interval {
            inner.file.sync_all()?;
            inner.writes_since_sync = 0;
        }
        Ok(())
    }
}

impl DataLog for FileDataLog {
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
        let record = LogRecord::Start {
            entry,
            name: name.to_string(),
            type_str: type_str.to_string(),
            metadata: metadata.to_string(),
            timestamp: timestamp.or_now(),
        };
        self.write(&mut inner, &record)?;
        inner.open.insert(entry);
        Ok(entry)
    }

    fn append(&self, entry: LogEntryId, value: &Value, timestamp: Timestamp) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.open.contains(&entry) {
            return Err(SyncError::InvalidFormat(format!("entry {:?} is not open", entry)));
        }
        let record = LogRecord::Append {
            entry,
            value: value.clone(),
            timestamp: timestamp.or_now(),
        };
        self.write(&mut inner, &record)
    }

    fn finish(&self, entry: LogEntryId, timestamp: Timestamp) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.open.remove(&entry) {
            return Err(SyncError::InvalidFormat(format!("entry {:?} is not open", entry)));
        }
        let record = LogRecord::Finish {
            entry,
            timestamp: timestamp.or_now(),
        };
        self.write(&mut inner, &record)
    }
}

impl Drop for FileDataLog {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}

/// Read `size` bytes of records from the start of `file`.
fn read_records(file: &mut File, size: u64) -> Result<Vec<LogRecord>> {
    file.seek(SeekFrom::Start(0))?;
    let mut records = Vec::new();
    let mut offset = 0u64;

    while offset < size {
        if size - offset < RECORD_HEADER_SIZE + 4 {
            return Err(SyncError::Corruption(format!(
                "truncated record at offset {}",
                offset
            )));
        }

        // Magic
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(SyncError::InvalidFormat("Invalid record magic".into()));
        }

        // Version
        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != LOG_VERSION {
            return Err(SyncError::InvalidFormat(format!(
                "Unsupported log version: {}",
                version[0]
            )));
        }

        // Flags
        let mut _flags = [0u8; 1];
        file.read_exact(&mut _flags)?;

        // Payload
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let payload_len = u32::from_le_bytes(len_bytes) as u64;
        if offset + RECORD_HEADER_SIZE + payload_len + 4 > size {
            return Err(SyncError::Corruption(format!(
                "record at offset {} overruns the file",
                offset
            )));
        }
        let mut payload = vec![0u8; payload_len as usize];
        file.read_exact(&mut payload)?;

        // Checksum
        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&payload);
        if stored_checksum != computed_checksum {
            return Err(SyncError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        records.push(rmp_serde::from_slice(&payload)?);
        offset += RECORD_HEADER_SIZE + payload_len + 4;
    }

    Ok(records)
}
