//! Interface-level model of the paired write-back store: a fast (local)
//! tier and a slow (remote) tier kept in sync by a background propagator
//! that polls a write-ahead log. No concrete fast/slow backend lives
//! here — only the on-disk log record format and the trait documenting
//! the ordering contract a real implementation must uphold.

use crate::error::{Error, Result};
use crate::kv::KvStore;
use std::fs::{self, File, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Mutex;

/// One fixed-width record: 1 state byte + 64 hex chars + newline.
pub const RECORD_LEN: usize = 66;

/// A key's state in the propagation pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    /// Written to the fast store and logged; not yet pushed to slow.
    Pending,
    /// Pushed to slow; kept logged so a crash before compaction retries
    /// nothing spuriously.
    Migrated,
    /// Deleted from both stores; dropped on the next compaction.
    Deleted,
}

impl LogState {
    fn byte(self) -> u8 {
        match self {
            LogState::Pending => b'p',
            LogState::Migrated => b'm',
            LogState::Deleted => b'd',
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            b'p' => Ok(LogState::Pending),
            b'm' => Ok(LogState::Migrated),
            b'd' => Ok(LogState::Deleted),
            other => Err(Error::Internal(format!(
                "bad propagation log state byte: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub state: LogState,
    pub key: String,
}

fn encode_record(entry: &LogEntry) -> Vec<u8> {
    let mut record = Vec::with_capacity(RECORD_LEN);
    record.push(entry.state.byte());
    record.extend_from_slice(entry.key.as_bytes());
    record.push(b'\n');
    record
}

/// Append-only propagation log: 66-byte fixed records, one per line.
/// Concurrent appenders are serialized by an internal mutex; a reader
/// that hits a short trailing record (a writer mid-append) stops there
/// and picks up the rest on its next poll.
pub struct PairedLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl PairedLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Appends one record. `key` must be exactly 64 lowercase hex
    /// characters (a repository ref's key).
    pub fn append(&self, state: LogState, key: &str) -> Result<()> {
        if key.len() != 64 {
            return Err(Error::Internal(format!(
                "propagation log key must be 64 hex chars, got {}",
                key.len()
            )));
        }
        let record = encode_record(&LogEntry {
            state,
            key: key.to_string(),
        });
        let mut f = self.file.lock().unwrap();
        f.write_all(&record)?;
        f.flush()?;
        Ok(())
    }

    /// Reads every complete record currently in the log, in file order.
    pub fn read_all(&self) -> Result<Vec<LogEntry>> {
        let contents = fs::read(&self.path)?;
        let mut out = Vec::new();
        for chunk in contents.chunks(RECORD_LEN) {
            if chunk.len() < RECORD_LEN {
                break;
            }
            let state = LogState::from_byte(chunk[0])?;
            let key = String::from_utf8_lossy(&chunk[1..65]).into_owned();
            out.push(LogEntry { state, key });
        }
        Ok(out)
    }

    /// Rewrites the log keeping only non-`Deleted` entries, first
    /// renaming the old file aside to `<name>.<unix_ts>`. Run once at
    /// startup per the compaction contract.
    pub fn compact(&self, unix_ts: u64) -> Result<()> {
        let mut f = self.file.lock().unwrap();
        let kept: Vec<LogEntry> = self
            .read_all()?
            .into_iter()
            .filter(|e| e.state != LogState::Deleted)
            .collect();

        let mut backup_name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        backup_name.push(format!(".{unix_ts}"));
        let backup_path = self.path.with_file_name(backup_name);
        fs::rename(&self.path, &backup_path)?;

        let mut new_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        for entry in &kept {
            new_file.write_all(&encode_record(entry))?;
        }
        new_file.flush()?;
        *f = new_file;
        Ok(())
    }
}

/// A write-back store pairing a fast (local) tier with a slow (remote)
/// tier, propagated asynchronously via a [`PairedLog`]. Concrete
/// fast/slow backends are external collaborators; this trait only names
/// the ordering contract a real implementation must honor:
///
/// - `put` is synchronous to the fast store plus the log; propagation to
///   the slow store happens on a background poll of the log.
/// - `get` reads fast-then-slow: on a fast miss, fall through to slow
///   (implementations may replenish the fast store from there).
/// - `delete` goes slow-then-fast: deleting from slow first closes the
///   window where a concurrent `get`, racing ahead of a fast-first
///   delete, would find the fast store empty and replenish it from a
///   slow store that still has the item.
pub trait PairedStore: KvStore {
    /// Drains pending log entries, pushing each to the slow store and
    /// marking it migrated. Intended to be driven by a dedicated
    /// background worker polling the log; one call processes one batch.
    fn propagate_pending(&self) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key(byte: u8) -> String {
        hex::encode([byte; 32])
    }

    #[test]
    fn append_and_read_all_round_trips_in_order() {
        let dir = tempdir().unwrap();
        let log = PairedLog::open(dir.path().join("log")).unwrap();

        log.append(LogState::Pending, &key(1)).unwrap();
        log.append(LogState::Migrated, &key(2)).unwrap();
        log.append(LogState::Deleted, &key(3)).unwrap();

        let entries = log.read_all().unwrap();
        assert_eq!(
            entries,
            vec![
                LogEntry {
                    state: LogState::Pending,
                    key: key(1)
                },
                LogEntry {
                    state: LogState::Migrated,
                    key: key(2)
                },
                LogEntry {
                    state: LogState::Deleted,
                    key: key(3)
                },
            ]
        );
    }

    #[test]
    fn append_rejects_short_key() {
        let dir = tempdir().unwrap();
        let log = PairedLog::open(dir.path().join("log")).unwrap();
        assert!(log.append(LogState::Pending, "deadbeef").is_err());
    }

    #[test]
    fn compact_drops_deleted_entries_and_backs_up_old_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let log = PairedLog::open(&path).unwrap();

        log.append(LogState::Migrated, &key(1)).unwrap();
        log.append(LogState::Deleted, &key(2)).unwrap();
        log.append(LogState::Pending, &key(3)).unwrap();

        log.compact(1_700_000_000).unwrap();

        let entries = log.read_all().unwrap();
        assert_eq!(
            entries,
            vec![
                LogEntry {
                    state: LogState::Migrated,
                    key: key(1)
                },
                LogEntry {
                    state: LogState::Pending,
                    key: key(3)
                },
            ]
        );
        assert!(dir.path().join("log.1700000000").exists());
    }

    #[test]
    fn read_all_ignores_a_short_trailing_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let log = PairedLog::open(&path).unwrap();
        log.append(LogState::Pending, &key(1)).unwrap();

        // Simulate a writer mid-append: a partial record tacked on after
        // a complete one.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(b"p1234").unwrap();
        }

        let entries = log.read_all().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, key(1));
    }
}
