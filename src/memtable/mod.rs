//! # Memtable Module
//!
//! The mutable, in-memory write buffer of the storage engine, backed by
//! a write-ahead log for durability.
//!
//! ## Design Invariants
//!
//! - All writes are WAL-first: a mutation is durable in the log before it
//!   becomes observable in the tree.
//! - Deletes are tombstones, not physical removal; they shadow older
//!   values in deeper layers until compaction resolves them.
//! - A memtable instance is either *active* (accepting writes) or
//!   *frozen* (immutable, awaiting flush). Freezes are totally ordered
//!   with respect to writes — no write observes a half-frozen table.
//!
//! ## Freeze Semantics
//!
//! A freeze seals the current WAL segment, moves the tree into a
//! [`FrozenMemtable`] pushed onto the shared [`FrozenQueue`], and
//! re-initializes the active table over a fresh WAL segment. Freezes are
//! triggered by size overrun — the overflowing write is logged, applied,
//! and sealed into the frozen snapshot before the fresh table takes
//! over — and by the engine's flush timer.
//!
//! ## Frozen Memtable
//!
//! A [`FrozenMemtable`] is read-only. It remembers its sealed WAL
//! segment so the segment can be deleted once an SSTable fully
//! represents the data.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod tree;

pub use tree::{Tree, TreeGet, TreeIter};

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info, trace};

use crate::encoding::{self, ByteReader, EncodingError};
use crate::types::{self, Key, Value};
use crate::wal;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by memtable operations.
#[derive(Debug, Error)]
pub enum MemTableError {
    /// Underlying WAL failure.
    #[error("WAL error: {0}")]
    Wal(#[from] wal::WalError),

    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record serialization failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// The table was already read-only when the write arrived; it has
    /// been frozen, retry against the fresh active table.
    #[error("memtable is read-only, flushed")]
    Frozen,

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// WAL record codec
// ------------------------------------------------------------------------------------------------

/// One logical WAL record: a serialized key plus the tagged stored value
/// (live payload or tombstone marker).
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct WalRecord {
    pub key: Vec<u8>,
    pub stored: Vec<u8>,
}

impl WalRecord {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(self.key.len() + self.stored.len() + 2 * encoding::MAX_UVARINT_LEN);
        encoding::put_uvarint(&mut buf, self.key.len() as u64);
        buf.extend_from_slice(&self.key);
        encoding::put_uvarint(&mut buf, self.stored.len() as u64);
        buf.extend_from_slice(&self.stored);
        buf
    }

    pub(crate) fn decode(payload: &[u8]) -> Result<Self, EncodingError> {
        let mut r = ByteReader::new(payload);
        let key_len = r.read_uvarint()? as usize;
        let key = r.read_exact(key_len)?.to_vec();
        let stored_len = r.read_uvarint()? as usize;
        let stored = r.read_exact(stored_len)?.to_vec();
        Ok(Self { key, stored })
    }
}

// ------------------------------------------------------------------------------------------------
// WAL segment naming
// ------------------------------------------------------------------------------------------------

/// File name of WAL segment `n`.
pub(crate) fn wal_file_name(seq: u64) -> String {
    format!("wal_{seq}.log")
}

/// Parses a WAL segment number out of `wal_{n}.log`.
pub(crate) fn parse_wal_name(name: &str) -> Option<u64> {
    name.strip_prefix("wal_")?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

// ------------------------------------------------------------------------------------------------
// Lookup result
// ------------------------------------------------------------------------------------------------

/// Result of a point lookup against a memtable layer.
#[derive(Debug, PartialEq)]
pub enum MemTableGet<V> {
    /// A live value.
    Put(V),

    /// The key is tombstoned in this layer.
    Deleted,

    /// This layer holds nothing for the key.
    NotFound,
}

// ------------------------------------------------------------------------------------------------
// MemTable Core
// ------------------------------------------------------------------------------------------------

/// State of the active table; the read-only phase only exists inside a
/// freeze transition, which runs under the manager mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TableState {
    Writable,
    ReadOnly,
}

struct MemTableInner<K: Key, V: Value> {
    tree: Tree<K, V>,
    wal: wal::Writer<File>,
    wal_path: PathBuf,
    wal_seq: u64,
    log_dir: PathBuf,
    cur_size: usize,
    max_size: usize,
    state: TableState,
}

/// The active memtable manager: WAL-first writes into an ordered tree,
/// with size- and timer-triggered freezes into a shared [`FrozenQueue`].
pub struct MemTable<K: Key, V: Value> {
    inner: Mutex<MemTableInner<K, V>>,
    frozen: Arc<FrozenQueue<K, V>>,
}

impl<K: Key, V: Value> MemTable<K, V> {
    /// Creates an active table writing WAL segment `wal_seq` under
    /// `log_dir`, pushing freezes onto `frozen`.
    pub fn new(
        log_dir: impl AsRef<Path>,
        wal_seq: u64,
        max_size: usize,
        frozen: Arc<FrozenQueue<K, V>>,
    ) -> Result<Self, MemTableError> {
        let log_dir = log_dir.as_ref().to_path_buf();
        let (wal, wal_path) = open_wal_segment(&log_dir, wal_seq)?;

        info!(seq = wal_seq, path = %wal_path.display(), "memtable opened");

        Ok(Self {
            inner: Mutex::new(MemTableInner {
                tree: Tree::new(),
                wal,
                wal_path,
                wal_seq,
                log_dir,
                cur_size: 0,
                max_size,
                state: TableState::Writable,
            }),
            frozen,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemTableInner<K, V>>, MemTableError> {
        self.inner
            .lock()
            .map_err(|_| MemTableError::Internal("memtable mutex poisoned".into()))
    }

    /// Inserts or updates a key.
    ///
    /// WAL-first: the record is durable in the log before the tree is
    /// touched. A write that overflows the size budget is still admitted
    /// — it lands in the table that is then frozen. Returns `Ok(true)`
    /// when this write triggered a freeze, so the caller can arrange a
    /// flush.
    pub fn put(&self, key: K, value: V) -> Result<bool, MemTableError> {
        let stored = types::tag_live(&value.to_bytes());
        self.write_entry(key, Some(value), stored)
    }

    /// Deletes a key by recording a tombstone.
    ///
    /// The tombstone shadows any older value in frozen tables and
    /// SSTables until compaction resolves it. Returns `Ok(true)` when
    /// this write triggered a freeze.
    pub fn delete(&self, key: K) -> Result<bool, MemTableError> {
        let stored = types::tag_tombstone();
        self.write_entry(key, None, stored)
    }

    fn write_entry(
        &self,
        key: K,
        value: Option<V>,
        stored: Vec<u8>,
    ) -> Result<bool, MemTableError> {
        let key_bytes = key.to_bytes();
        let record = WalRecord {
            key: key_bytes,
            stored,
        }
        .encode();
        let entry_size = record.len();

        let mut inner = self.lock()?;

        // 1. A table caught mid-freeze: finish the freeze and ask the
        //    caller to retry against the fresh table.
        if inner.state == TableState::ReadOnly {
            self.freeze_locked(&mut inner)?;
            return Err(MemTableError::Frozen);
        }

        // 2. WAL first (crash safety).
        {
            let mut rec = inner.wal.next()?;
            io::Write::write_all(&mut rec, &record)?;
        }

        // 3. In-memory update.
        match value {
            Some(v) => inner.tree.insert(key, v),
            None => inner.tree.insert_tombstone(key),
        }
        inner.cur_size += entry_size;

        // 4. Size overrun: seal this table, the overflowing write
        //    included. The freeze syncs the segment before handing the
        //    snapshot to the queue.
        if inner.cur_size > inner.max_size {
            inner.state = TableState::ReadOnly;
            self.freeze_locked(&mut inner)?;
            return Ok(true);
        }

        // 5. Durability for the common path.
        inner.wal.flush()?;
        inner.wal.get_ref().sync_all()?;

        trace!(size = inner.cur_size, "memtable write applied");
        Ok(false)
    }

    /// Point lookup against the active tree only; frozen tables are the
    /// caller's next stop.
    pub fn get(&self, key: &K) -> Result<MemTableGet<V>, MemTableError> {
        let inner = self.lock()?;
        Ok(match inner.tree.find(key) {
            TreeGet::Put(v) => MemTableGet::Put(v.clone()),
            TreeGet::Deleted => MemTableGet::Deleted,
            TreeGet::NotFound => MemTableGet::NotFound,
        })
    }

    /// Freezes the active table if it holds any data.
    ///
    /// Returns true when a frozen entry was produced. Used by the
    /// engine's flush timer; a tick against an empty table is a no-op.
    pub fn freeze(&self) -> Result<bool, MemTableError> {
        let mut inner = self.lock()?;
        self.freeze_locked(&mut inner)
    }

    /// Moves the active tree into the frozen queue and re-initializes
    /// the table over the next WAL segment.
    fn freeze_locked(
        &self,
        inner: &mut MemTableInner<K, V>,
    ) -> Result<bool, MemTableError> {
        if inner.tree.is_empty() {
            inner.state = TableState::Writable;
            return Ok(false);
        }

        inner.state = TableState::ReadOnly;

        // Seal the segment: flush pending chunks and sync.
        inner.wal.close()?;
        inner.wal.get_ref().sync_all()?;

        let next_seq = inner.wal_seq + 1;
        let (new_wal, new_path) = open_wal_segment(&inner.log_dir, next_seq)?;

        let old_wal = std::mem::replace(&mut inner.wal, new_wal);
        let old_path = std::mem::replace(&mut inner.wal_path, new_path);
        let tree = std::mem::take(&mut inner.tree);
        let entry_count = tree.len();

        drop(old_wal);

        self.frozen.push(FrozenMemtable {
            tree,
            wal_path: old_path,
            wal_seq: inner.wal_seq,
        });

        inner.wal_seq = next_seq;
        inner.cur_size = 0;
        inner.state = TableState::Writable;

        debug!(
            entries = entry_count,
            next_wal_seq = next_seq,
            "memtable frozen"
        );
        Ok(true)
    }

    /// Current byte size of the active table's WAL records.
    pub fn size(&self) -> Result<usize, MemTableError> {
        Ok(self.lock()?.cur_size)
    }

    /// True when the active tree holds no entries.
    pub fn is_empty(&self) -> Result<bool, MemTableError> {
        Ok(self.lock()?.tree.is_empty())
    }

    /// Sequence number of the segment the active table is writing.
    pub fn wal_seq(&self) -> Result<u64, MemTableError> {
        Ok(self.lock()?.wal_seq)
    }

    /// Flushes and syncs the active WAL segment.
    pub fn sync(&self) -> Result<(), MemTableError> {
        let mut inner = self.lock()?;
        inner.wal.flush()?;
        inner.wal.get_ref().sync_all()?;
        Ok(())
    }
}

/// Creates (truncating) WAL segment `seq` under `log_dir`.
fn open_wal_segment(
    log_dir: &Path,
    seq: u64,
) -> Result<(wal::Writer<File>, PathBuf), MemTableError> {
    let path = log_dir.join(wal_file_name(seq));
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)?;
    Ok((wal::Writer::new(file), path))
}

// ------------------------------------------------------------------------------------------------
// Frozen Memtable
// ------------------------------------------------------------------------------------------------

/// An immutable, read-only snapshot of a memtable awaiting flush.
///
/// Retains the path of its sealed WAL segment; the segment is deleted by
/// the engine once the flushed SSTable is installed.
pub struct FrozenMemtable<K: Key, V: Value> {
    tree: Tree<K, V>,
    /// Sealed WAL segment backing this snapshot.
    pub wal_path: PathBuf,
    /// Sequence number of the sealed segment.
    pub wal_seq: u64,
}

impl<K: Key, V: Value> FrozenMemtable<K, V> {
    /// Builds a frozen table directly from a tree (test hook and flush
    /// plumbing).
    pub fn from_tree(tree: Tree<K, V>, wal_path: PathBuf, wal_seq: u64) -> Self {
        Self {
            tree,
            wal_path,
            wal_seq,
        }
    }

    /// Point lookup.
    pub fn get(&self, key: &K) -> MemTableGet<V> {
        match self.tree.find(key) {
            TreeGet::Put(v) => MemTableGet::Put(v.clone()),
            TreeGet::Deleted => MemTableGet::Deleted,
            TreeGet::NotFound => MemTableGet::NotFound,
        }
    }

    /// In-order iteration over all entries; `None` values are
    /// tombstones.
    pub fn iter(&self) -> TreeIter<'_, K, V> {
        self.tree.iter()
    }

    /// Entry count, tombstones included.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// True when the snapshot holds no entries.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

// ------------------------------------------------------------------------------------------------
// Frozen Queue
// ------------------------------------------------------------------------------------------------

/// Queue of frozen memtables owned by the engine.
///
/// Memtables push snapshots in; the flush worker drains them oldest
/// first; readers consult them newest first.
pub struct FrozenQueue<K: Key, V: Value> {
    inner: Mutex<VecDeque<Arc<FrozenMemtable<K, V>>>>,
}

impl<K: Key, V: Value> Default for FrozenQueue<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key, V: Value> FrozenQueue<K, V> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends a snapshot (newest position).
    pub fn push(&self, table: FrozenMemtable<K, V>) {
        let mut q = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        q.push_back(Arc::new(table));
    }

    /// Point lookup, newest snapshot first.
    pub fn get(&self, key: &K) -> MemTableGet<V> {
        let q = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        for table in q.iter().rev() {
            match table.get(key) {
                MemTableGet::NotFound => continue,
                hit => return hit,
            }
        }
        MemTableGet::NotFound
    }

    /// Oldest snapshot, if any (the next flush candidate).
    pub fn oldest(&self) -> Option<Arc<FrozenMemtable<K, V>>> {
        let q = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        q.front().cloned()
    }

    /// Drops the oldest snapshot. Called after its SSTable is installed.
    pub fn pop_oldest(&self) -> Option<Arc<FrozenMemtable<K, V>>> {
        let mut q = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        q.pop_front()
    }

    /// Number of snapshots awaiting flush.
    pub fn len(&self) -> usize {
        let q = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        q.len()
    }

    /// True when no snapshots are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
