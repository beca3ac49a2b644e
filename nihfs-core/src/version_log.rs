//! Durable, per-path record of version transitions (`spec.md §4.1`).
//!
//! Records are framed as `[len: u32][crc32: u32][payload bytes]`, mirroring
//! the length-prefixed, checksummed record framing used by disk-backed
//! buffers elsewhere in the ecosystem (e.g. Vector's `disk_v2` buffer),
//! adapted here to a small, serde_json-encoded payload rather than a
//! zero-copy one, since a version log's record rate is orders of
//! magnitude lower than an event buffer's.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::error::ResourceError;
use crate::resource::{ResourceType, VersionEntry};

#[derive(Debug, Clone, Serialize, Deserialize)]
enum LogRecord {
    VersionAdded {
        id: uuid::Uuid,
        resource_type: ResourceType,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
    VersionCompleted {
        id: uuid::Uuid,
    },
    HeadSet {
        id: uuid::Uuid,
    },
    HeadCleared,
}

/// Durable, crash-consistent log of one path's version history, plus the
/// in-memory indices the manager queries on every message.
pub struct VersionLog {
    file: File,
    entries: Vec<VersionEntry>,
    by_id: HashMap<uuid::Uuid, usize>,
    completed: HashSet<uuid::Uuid>,
    head: Option<uuid::Uuid>,
    /// Number of trailing records discarded on the most recent `open`
    /// because they were truncated mid-write by a crash.
    pub truncated_on_open: usize,
}

impl VersionLog {
    /// Opens or creates the log file at `dir/version.log`. A corrupt tail
    /// (a record whose length runs past EOF, or whose checksum doesn't
    /// match) is truncated away; everything before it is kept.
    #[instrument(skip_all, fields(dir = %dir.display()))]
    pub fn open(dir: &Path) -> Result<VersionLog, ResourceError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("version.log");
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let mut raw = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut raw)?;

        let mut entries = Vec::new();
        let mut by_id = HashMap::new();
        let mut completed = HashSet::new();
        let mut head = None;
        let mut offset = 0usize;
        let mut truncated = 0usize;

        while offset < raw.len() {
            match read_frame(&raw[offset..]) {
                Some((record, frame_len)) => {
                    apply(record, &mut entries, &mut by_id, &mut completed, &mut head);
                    offset += frame_len;
                }
                None => {
                    truncated += raw.len() - offset;
                    break;
                }
            }
        }

        if truncated > 0 {
            warn!(bytes = truncated, "truncating corrupt version log tail");
            file.set_len(offset as u64)?;
            file.seek(SeekFrom::End(0))?;
            file.sync_all()?;
        }

        Ok(VersionLog {
            file,
            entries,
            by_id,
            completed,
            head,
            truncated_on_open: truncated,
        })
    }

    pub fn find(&self, id: &uuid::Uuid) -> Option<&VersionEntry> {
        self.by_id.get(id).map(|&i| &self.entries[i])
    }

    pub fn is_completed(&self, id: &uuid::Uuid) -> bool {
        self.completed.contains(id)
    }

    pub fn current(&self) -> Option<&VersionEntry> {
        self.head.as_ref().and_then(|id| self.find(id))
    }

    /// Appends a `VersionAdded` record. Idempotent on `entry.id`.
    pub fn add_version(&mut self, entry: VersionEntry) -> Result<(), ResourceError> {
        if let Some(existing) = self.find(&entry.id) {
            return if existing.resource_type == entry.resource_type {
                Ok(())
            } else {
                Err(ResourceError::Conflict(format!(
                    "version {} already exists with a different resource type",
                    entry.id
                )))
            };
        }
        self.write_record(&LogRecord::VersionAdded {
            id: entry.id,
            resource_type: entry.resource_type,
            timestamp: entry.timestamp,
        })?;
        let id = entry.id;
        self.by_id.insert(id, self.entries.len());
        self.entries.push(entry);
        Ok(())
    }

    /// Appends a `VersionCompleted` record. Errors if `id` is unknown;
    /// no-ops if already completed.
    pub fn complete_version(&mut self, id: uuid::Uuid) -> Result<(), ResourceError> {
        if self.find(&id).is_none() {
            return Err(ResourceError::Corrupt(format!("unknown version {id}")));
        }
        if self.completed.contains(&id) {
            return Ok(());
        }
        self.write_record(&LogRecord::VersionCompleted { id })?;
        self.completed.insert(id);
        Ok(())
    }

    /// Appends a `HeadSet` record. Requires `id` to be completed.
    pub fn set_head(&mut self, id: uuid::Uuid) -> Result<(), ResourceError> {
        if !self.completed.contains(&id) {
            return Err(ResourceError::Corrupt(format!(
                "cannot set head to uncompleted version {id}"
            )));
        }
        self.write_record(&LogRecord::HeadSet { id })?;
        self.head = Some(id);
        Ok(())
    }

    pub fn clear_head(&mut self) -> Result<(), ResourceError> {
        self.write_record(&LogRecord::HeadCleared)?;
        self.head = None;
        Ok(())
    }

    pub fn close(mut self) -> Result<(), ResourceError> {
        self.file.flush()?;
        Ok(())
    }

    fn write_record(&mut self, record: &LogRecord) -> Result<(), ResourceError> {
        let frame = encode_frame(record)?;
        self.file.write_all(&frame)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Read-only, best-effort lookup of a path's current head version id,
    /// without creating, writing to, or truncating anything. Discovery
    /// (`spec.md §5`'s "The router reads baseDir for discovery (read-only,
    /// crash-safe...)") must never reopen a live manager's log for
    /// writing, since a torn tail seen mid-write by a second opener would
    /// otherwise get truncated out from under it. Returns `None` if the
    /// log doesn't exist yet, is empty, or has no head set.
    pub fn peek_current_head(dir: &Path) -> Option<uuid::Uuid> {
        let raw = std::fs::read(dir.join("version.log")).ok()?;

        let mut entries = Vec::new();
        let mut by_id = HashMap::new();
        let mut completed = HashSet::new();
        let mut head = None;
        let mut offset = 0usize;
        while offset < raw.len() {
            match read_frame(&raw[offset..]) {
                Some((record, frame_len)) => {
                    apply(record, &mut entries, &mut by_id, &mut completed, &mut head);
                    offset += frame_len;
                }
                None => break,
            }
        }
        head
    }
}

fn apply(
    record: LogRecord,
    entries: &mut Vec<VersionEntry>,
    by_id: &mut HashMap<uuid::Uuid, usize>,
    completed: &mut HashSet<uuid::Uuid>,
    head: &mut Option<uuid::Uuid>,
) {
    match record {
        LogRecord::VersionAdded {
            id,
            resource_type,
            timestamp,
        } => {
            by_id.insert(id, entries.len());
            entries.push(VersionEntry {
                id,
                resource_type,
                timestamp,
            });
        }
        LogRecord::VersionCompleted { id } => {
            completed.insert(id);
        }
        LogRecord::HeadSet { id } => {
            *head = Some(id);
        }
        LogRecord::HeadCleared => {
            *head = None;
        }
    }
}

fn encode_frame(record: &LogRecord) -> Result<Vec<u8>, ResourceError> {
    let payload = serde_json::to_vec(record)?;
    let checksum = crc32fast::hash(&payload);
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum.to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Parses one frame from the start of `buf`. Returns `None` (signaling a
/// truncated/corrupt tail) if there isn't a full, checksum-valid frame
/// available.
fn read_frame(buf: &[u8]) -> Option<(LogRecord, usize)> {
    if buf.len() < 8 {
        return None;
    }
    let len = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
    let checksum = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    let payload = buf.get(8..8 + len)?;
    if crc32fast::hash(payload) != checksum {
        return None;
    }
    let record: LogRecord = serde_json::from_slice(payload).ok()?;
    Some((record, 8 + len))
}
