//! Durable consensus state.
//!
//! Layout under the configured raft directory:
//!
//! ```text
//! <raft_path>/log/        RocksDB: log entries keyed by big-endian index
//! <raft_path>/raft_meta/  RocksDB: hard state (term, vote)
//! <raft_path>/snapshot/   snapshot archive + metadata files
//! ```
//!
//! Entries are persisted before the node acknowledges them; snapshots are
//! written to a temporary file, fsynced, then renamed into place so a crash
//! never leaves a torn snapshot.

use super::log::LogEntry;
use super::state::PersistentState;
use crate::error::{FsError, Result};
use crate::types::{LogIndex, Term};
use rocksdb::{Options, DB};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

const HARD_STATE_KEY: &[u8] = b"hard_state";
const SNAPSHOT_FILE: &str = "snapshot.bin";
const SNAPSHOT_META_FILE: &str = "snapshot.meta";

/// Metadata describing a snapshot's position in the log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_index: LogIndex,
    pub last_term: Term,
}

/// RocksDB-backed persistence for log entries and hard state, plus
/// file-backed snapshot archives.
pub struct RaftStorage {
    log_db: DB,
    meta_db: DB,
    snapshot_dir: PathBuf,
}

impl RaftStorage {
    /// Open (creating if needed) the three storage areas under `raft_path`.
    pub fn open<P: AsRef<Path>>(raft_path: P) -> Result<Self> {
        let raft_path = raft_path.as_ref();
        let log_path = raft_path.join("log");
        let meta_path = raft_path.join("raft_meta");
        let snapshot_dir = raft_path.join("snapshot");
        fs::create_dir_all(&snapshot_dir)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let log_db = DB::open(&opts, &log_path)?;
        let meta_db = DB::open(&opts, &meta_path)?;

        Ok(Self {
            log_db,
            meta_db,
            snapshot_dir,
        })
    }

    // ---- hard state ----

    pub fn load_hard_state(&self) -> Result<Option<PersistentState>> {
        match self.meta_db.get(HARD_STATE_KEY)? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    pub fn save_hard_state(&self, state: &PersistentState) -> Result<()> {
        let data = bincode::serialize(state)?;
        self.meta_db.put(HARD_STATE_KEY, data)?;
        self.meta_db.flush()?;
        Ok(())
    }

    // ---- log entries ----

    pub fn append_entries(&self, entries: &[LogEntry]) -> Result<()> {
        let mut batch = rocksdb::WriteBatch::default();
        for entry in entries {
            batch.put(entry.index.to_be_bytes(), bincode::serialize(entry)?);
        }
        self.log_db.write(batch)?;
        Ok(())
    }

    /// Load all entries with index >= `start_index`, in order.
    pub fn load_entries_from(&self, start_index: LogIndex) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        let start_key = start_index.to_be_bytes();
        let iter = self.log_db.iterator(rocksdb::IteratorMode::From(
            &start_key,
            rocksdb::Direction::Forward,
        ));
        for item in iter {
            let (_, value) = item?;
            entries.push(bincode::deserialize::<LogEntry>(&value)?);
        }
        Ok(entries)
    }

    /// Delete entries with index >= `from_index` (conflict truncation).
    pub fn truncate_from(&self, from_index: LogIndex) -> Result<()> {
        let mut batch = rocksdb::WriteBatch::default();
        let start_key = from_index.to_be_bytes();
        let iter = self.log_db.iterator(rocksdb::IteratorMode::From(
            &start_key,
            rocksdb::Direction::Forward,
        ));
        for item in iter {
            let (key, _) = item?;
            batch.delete(&key);
        }
        self.log_db.write(batch)?;
        Ok(())
    }

    /// Delete entries with index <= `up_to_index` (post-snapshot compaction).
    pub fn compact_to(&self, up_to_index: LogIndex) -> Result<()> {
        let mut batch = rocksdb::WriteBatch::default();
        let iter = self.log_db.iterator(rocksdb::IteratorMode::Start);
        for item in iter {
            let (key, _) = item?;
            let index = parse_index(&key)?;
            if index > up_to_index {
                break;
            }
            batch.delete(&key);
        }
        self.log_db.write(batch)?;
        Ok(())
    }

    // ---- snapshots ----

    /// Persist a snapshot archive atomically (temp file + fsync + rename).
    pub fn save_snapshot(&self, data: &[u8], last_index: LogIndex, last_term: Term) -> Result<()> {
        let meta = SnapshotMeta {
            last_index,
            last_term,
        };

        write_atomic(&self.snapshot_dir, SNAPSHOT_FILE, data)?;
        write_atomic(
            &self.snapshot_dir,
            SNAPSHOT_META_FILE,
            &bincode::serialize(&meta)?,
        )?;

        // Make the renames themselves durable.
        File::open(&self.snapshot_dir)?.sync_all()?;
        Ok(())
    }

    /// Load the latest snapshot, if one exists.
    pub fn load_snapshot(&self) -> Result<Option<(Vec<u8>, SnapshotMeta)>> {
        let meta_path = self.snapshot_dir.join(SNAPSHOT_META_FILE);
        let data_path = self.snapshot_dir.join(SNAPSHOT_FILE);
        if !meta_path.exists() || !data_path.exists() {
            return Ok(None);
        }

        let meta: SnapshotMeta = bincode::deserialize(&fs::read(&meta_path)?)?;
        let data = fs::read(&data_path)?;
        Ok(Some((data, meta)))
    }
}

fn parse_index(key: &[u8]) -> Result<LogIndex> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| FsError::Raft("malformed log key".into()))?;
    Ok(LogIndex::from_be_bytes(bytes))
}

fn write_atomic(dir: &Path, name: &str, data: &[u8]) -> Result<()> {
    let tmp = dir.join(format!("{}.tmp", name));
    let target = dir.join(name);

    let mut file = File::create(&tmp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, &target)?;
    Ok(())
}
