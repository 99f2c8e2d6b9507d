//! # Storage Engine
//!
//! The public surface of the store: a **crash-safe**, **typed** LSM
//! engine assembling the memtable manager, the frozen queue, the WAL,
//! and the leveled SSTable tree.
//!
//! ## Design Overview
//!
//! Data is queried newest-first across three layers:
//!
//! 1. **Active memtable** — an in-memory ordered tree backed by a WAL
//!    segment.
//! 2. **Frozen memtables** — read-only snapshots awaiting flush, newest
//!    first.
//! 3. **SSTables** — the leveled on-disk tree; level 0 newest-first,
//!    deeper levels partitioned by key range.
//!
//! A tombstone found in any layer resolves the lookup to *absent*
//! immediately — deletions shadow older values until compaction
//! reclaims them.
//!
//! ## Background tasks
//!
//! [`Engine::open`] starts five threads: the flush ticker, the flush
//! worker, and the LSM tree's dispatcher and two compaction loops. All
//! stop when the shutdown channel disconnects in [`Engine::close`].
//!
//! ## Crash recovery
//!
//! On open, the engine rebuilds the level array from the `.sst` files
//! in the data directory, then replays every WAL segment under
//! `dir/log/` in sequence order into a fresh memtable — re-logging the
//! records into the new active segment — and removes the replayed
//! segments. Corruption encountered during replay is reported through
//! the WAL [`Dropper`](crate::wal::Dropper) and skipped unless
//! [`Config::wal_strict`] is set.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigError};
use crate::encoding::EncodingError;
use crate::lsm::LsmTree;
use crate::memtable::{
    FrozenQueue, MemTable, MemTableError, MemTableGet, WalRecord, parse_wal_name,
};
use crate::types::{self, Key, Value};
use crate::wal::{self, LogDropper, ReadOptions, WalError};
use crate::{LsmError, SstError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the engine's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Memtable or freeze failure.
    #[error("memtable error: {0}")]
    MemTable(#[from] MemTableError),

    /// LSM tree failure.
    #[error("LSM error: {0}")]
    Lsm(#[from] LsmError),

    /// SSTable failure.
    #[error("SSTable error: {0}")]
    Sst(#[from] SstError),

    /// WAL failure during recovery.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Key or value (de)serialization failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Operation on a closed engine.
    #[error("engine is closed")]
    Closed,
}

// ------------------------------------------------------------------------------------------------
// Stats
// ------------------------------------------------------------------------------------------------

/// Snapshot of engine state returned by [`Engine::stats`].
#[derive(Debug)]
pub struct EngineStats {
    /// Frozen memtables awaiting flush.
    pub frozen_count: usize,

    /// SSTable count per level.
    pub level_counts: Vec<usize>,

    /// Total SSTable bytes per level.
    pub level_sizes: Vec<u64>,
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

struct EngineShared<K: Key, V: Value> {
    conf: Arc<Config>,
    memtable: MemTable<K, V>,
    frozen: Arc<FrozenQueue<K, V>>,
    lsm: Arc<LsmTree>,
    flush_tx: Sender<()>,

    /// Serializes flush-queue draining between the worker thread and
    /// explicit [`Engine::flush`] calls.
    flush_lock: Mutex<()>,
}

/// The storage engine handle.
///
/// Generic over the user key and value types; see [`Key`] and [`Value`]
/// for the serialization contract.
pub struct Engine<K: Key, V: Value> {
    shared: Arc<EngineShared<K, V>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    closed: AtomicBool,
}

impl<K: Key, V: Value> std::fmt::Debug for Engine<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("dir", &self.shared.conf.dir)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<K: Key, V: Value> Engine<K, V> {
    /// Opens (or creates) an engine rooted at `conf.dir`.
    ///
    /// Validates the configuration, loads persisted SSTables, replays
    /// the WAL directory, and starts the background tasks.
    pub fn open(conf: Config) -> Result<Self, EngineError> {
        conf.validate()?;
        let conf = Arc::new(conf);

        fs::create_dir_all(&conf.dir)?;
        let log_dir = conf.log_dir();
        fs::create_dir_all(&log_dir)?;

        let (stop_tx, stop_rx) = channel::bounded::<()>(0);

        // 1. Rebuild the level array from disk.
        let lsm = Arc::new(LsmTree::new(conf.clone(), stop_rx.clone()));
        lsm.load_existing()?;

        // 2. Fresh active memtable on the next WAL segment.
        let segments = scan_wal_segments(&log_dir)?;
        let next_seq = segments.last().map_or(1, |(seq, _)| seq + 1);

        let frozen = Arc::new(FrozenQueue::new());
        let memtable = MemTable::new(&log_dir, next_seq, conf.memtable_size, frozen.clone())?;

        let (flush_tx, flush_rx) = channel::bounded::<()>(16);
        let shared = Arc::new(EngineShared {
            conf,
            memtable,
            frozen,
            lsm,
            flush_tx,
            flush_lock: Mutex::new(()),
        });

        // 3. Replay and retire old WAL segments (oldest first). The
        //    replayed records are re-logged into the new segment before
        //    the old one is removed.
        for (seq, path) in &segments {
            replay_segment(&shared, *seq, path)?;
            if let Err(e) = fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to remove replayed WAL segment");
            }
        }

        // 4. Background tasks.
        let mut threads = shared.lsm.start();
        threads.push(spawn_ticker(shared.clone(), stop_rx.clone()));
        threads.push(spawn_flush_worker(shared.clone(), flush_rx, stop_rx));

        if !shared.frozen.is_empty() {
            let _ = shared.flush_tx.try_send(());
        }

        info!(dir = %shared.conf.dir.display(), wal_seq = next_seq, "engine opened");

        Ok(Self {
            shared,
            threads: Mutex::new(threads),
            stop_tx: Mutex::new(Some(stop_tx)),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    /// Inserts or updates a key.
    ///
    /// A write that overflows the memtable lands in the snapshot that
    /// gets frozen; the freeze wakes the flush worker. A write arriving
    /// at an already-read-only table is retried once against the fresh
    /// table.
    pub fn put(&self, key: K, value: V) -> Result<(), EngineError> {
        self.ensure_open()?;
        for _ in 0..2 {
            match self.shared.memtable.put(key.clone(), value.clone()) {
                Ok(frozen) => {
                    if frozen {
                        let _ = self.shared.flush_tx.try_send(());
                    }
                    return Ok(());
                }
                Err(MemTableError::Frozen) => {
                    let _ = self.shared.flush_tx.try_send(());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(MemTableError::Frozen.into())
    }

    /// Deletes a key by writing a tombstone.
    pub fn delete(&self, key: K) -> Result<(), EngineError> {
        self.ensure_open()?;
        for _ in 0..2 {
            match self.shared.memtable.delete(key.clone()) {
                Ok(frozen) => {
                    if frozen {
                        let _ = self.shared.flush_tx.try_send(());
                    }
                    return Ok(());
                }
                Err(MemTableError::Frozen) => {
                    let _ = self.shared.flush_tx.try_send(());
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(MemTableError::Frozen.into())
    }

    /// Point lookup across all layers, newest first.
    ///
    /// Returns `Ok(None)` for a missing or deleted key.
    pub fn get(&self, key: &K) -> Result<Option<V>, EngineError> {
        self.ensure_open()?;

        // 1. Active memtable.
        match self.shared.memtable.get(key)? {
            MemTableGet::Put(v) => return Ok(Some(v)),
            MemTableGet::Deleted => return Ok(None),
            MemTableGet::NotFound => {}
        }

        // 2. Frozen memtables, newest first.
        match self.shared.frozen.get(key) {
            MemTableGet::Put(v) => return Ok(Some(v)),
            MemTableGet::Deleted => return Ok(None),
            MemTableGet::NotFound => {}
        }

        // 3. SSTables.
        match self.shared.lsm.get(&key.to_bytes())? {
            Some(stored) => match types::untag(&stored)? {
                Some(payload) => Ok(Some(V::from_bytes(payload)?)),
                None => Ok(None), // tombstone
            },
            None => Ok(None),
        }
    }

    /// Lookup restricted to the frozen queue (test hook).
    pub fn get_from_frozen(&self, key: &K) -> MemTableGet<V> {
        self.shared.frozen.get(key)
    }

    /// Freezes the active memtable and synchronously drains the frozen
    /// queue to level 0.
    pub fn flush(&self) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.shared.memtable.freeze()?;
        drain_frozen(&self.shared)
    }

    /// Returns a snapshot of engine statistics.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let mut level_counts = Vec::with_capacity(self.shared.conf.max_level);
        let mut level_sizes = Vec::with_capacity(self.shared.conf.max_level);
        for level in 0..self.shared.conf.max_level {
            level_counts.push(self.shared.lsm.level_len(level)?);
            level_sizes.push(self.shared.lsm.level_total_size(level)?);
        }
        Ok(EngineStats {
            frozen_count: self.shared.frozen.len(),
            level_counts,
            level_sizes,
        })
    }

    /// Gracefully shuts down the engine.
    ///
    /// Stops the background tasks, waits for in-flight work, drains the
    /// remaining frozen tables to level 0, and syncs the active WAL.
    pub fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Disconnect the shutdown channel; every loop exits on its next
        // iteration.
        if let Ok(mut tx) = self.stop_tx.lock() {
            tx.take();
        }

        let handles = {
            let mut threads = self
                .threads
                .lock()
                .map_err(|_| MemTableError::Internal("engine mutex poisoned".into()))?;
            std::mem::take(&mut *threads)
        };
        for handle in handles {
            let _ = handle.join();
        }
        self.shared.lsm.join_destroyers();

        // Persist everything still buffered in memory.
        self.shared.memtable.freeze()?;
        drain_frozen(&self.shared)?;
        self.shared.memtable.sync()?;

        info!(dir = %self.shared.conf.dir.display(), "engine closed");
        Ok(())
    }
}

impl<K: Key, V: Value> Drop for Engine<K, V> {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire)
            && let Err(e) = self.close()
        {
            error!(error = %e, "engine close failed on drop");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Flush plumbing
// ------------------------------------------------------------------------------------------------

/// Flushes queued frozen tables to level 0, oldest first. Each table's
/// sealed WAL segment is removed once its SSTable is installed.
fn drain_frozen<K: Key, V: Value>(shared: &EngineShared<K, V>) -> Result<(), EngineError> {
    let _guard = shared
        .flush_lock
        .lock()
        .map_err(|_| MemTableError::Internal("flush mutex poisoned".into()))?;

    while let Some(table) = shared.frozen.oldest() {
        let tag = table.wal_seq.to_string();
        shared.lsm.flush_record(table.as_ref(), &tag)?;
        shared.frozen.pop_oldest();

        if let Err(e) = fs::remove_file(&table.wal_path) {
            warn!(path = %table.wal_path.display(), error = %e,
                "failed to remove flushed WAL segment");
        }
    }
    Ok(())
}

fn spawn_flush_worker<K: Key, V: Value>(
    shared: Arc<EngineShared<K, V>>,
    flush_rx: Receiver<()>,
    stop_rx: Receiver<()>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        loop {
            crossbeam::select! {
                recv(flush_rx) -> msg => {
                    if msg.is_err() {
                        break;
                    }
                    // Failures leave the table queued; the next freeze
                    // signal retries.
                    if let Err(e) = drain_frozen(&shared) {
                        error!(error = %e, "flush worker failed");
                    }
                },
                recv(stop_rx) -> _ => break,
            }
        }
        debug!("flush worker stopped");
    })
}

/// The freeze ticker: every `flush_period`, a still-writable non-empty
/// memtable is frozen and the flush worker is woken.
fn spawn_ticker<K: Key, V: Value>(
    shared: Arc<EngineShared<K, V>>,
    stop_rx: Receiver<()>,
) -> JoinHandle<()> {
    let ticker = channel::tick(shared.conf.flush_period);
    std::thread::spawn(move || {
        loop {
            crossbeam::select! {
                recv(ticker) -> _ => {
                    match shared.memtable.freeze() {
                        Ok(true) => {
                            let _ = shared.flush_tx.try_send(());
                        }
                        Ok(false) => {} // empty table, re-arm
                        Err(e) => error!(error = %e, "timed freeze failed"),
                    }
                },
                recv(stop_rx) -> _ => break,
            }
        }
        debug!("flush ticker stopped");
    })
}

// ------------------------------------------------------------------------------------------------
// WAL recovery
// ------------------------------------------------------------------------------------------------

/// Lists `wal_{n}.log` segments under `log_dir`, ordered by `n`.
fn scan_wal_segments(log_dir: &Path) -> Result<Vec<(u64, PathBuf)>, EngineError> {
    let mut segments = Vec::new();
    for dirent in fs::read_dir(log_dir)? {
        let dirent = dirent?;
        let path = dirent.path();
        if let Some(seq) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_wal_name)
        {
            segments.push((seq, path));
        }
    }
    segments.sort_by_key(|(seq, _)| *seq);
    Ok(segments)
}

/// Replays one sealed WAL segment into the active memtable.
///
/// Corrupt chunks and undecodable records are reported and skipped in
/// non-strict mode; strict mode fails the open.
fn replay_segment<K: Key, V: Value>(
    shared: &EngineShared<K, V>,
    seq: u64,
    path: &Path,
) -> Result<(), EngineError> {
    let strict = shared.conf.wal_strict;
    let options = ReadOptions {
        strict,
        checksum: shared.conf.wal_checksum,
    };
    let file = File::open(path)?;
    let mut reader = wal::Reader::new(file, Some(Box::new(LogDropper)), options);

    let mut replayed = 0u64;
    loop {
        let payload = match reader.read_record() {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(WalError::Corruption(e)) => {
                if strict {
                    return Err(WalError::Corruption(e).into());
                }
                warn!(wal_seq = seq, error = %e, "skipping corrupt WAL record");
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        match decode_replay_entry::<K, V>(&payload) {
            Ok((key, Some(value))) => replay_write(|| {
                shared.memtable.put(key.clone(), value.clone())
            })?,
            Ok((key, None)) => {
                replay_write(|| shared.memtable.delete(key.clone()))?
            }
            Err(e) => {
                if strict {
                    return Err(e);
                }
                warn!(wal_seq = seq, error = %e, "skipping undecodable WAL record");
            }
        }
        replayed += 1;
    }

    info!(wal_seq = seq, records = replayed, "WAL segment replayed");
    Ok(())
}

/// Decodes a WAL payload into a typed key and optional value
/// (`None` = tombstone).
fn decode_replay_entry<K: Key, V: Value>(
    payload: &[u8],
) -> Result<(K, Option<V>), EngineError> {
    let record = WalRecord::decode(payload)?;
    let key = K::from_bytes(&record.key)?;
    match types::untag(&record.stored)? {
        Some(bytes) => Ok((key, Some(V::from_bytes(bytes)?))),
        None => Ok((key, None)),
    }
}

/// Applies one replayed write, riding through at most one freeze.
/// Freezes during replay simply queue snapshots; the flush worker
/// drains them once the background tasks start.
fn replay_write(
    mut write: impl FnMut() -> Result<bool, MemTableError>,
) -> Result<(), EngineError> {
    for _ in 0..2 {
        match write() {
            Ok(_) => return Ok(()),
            Err(MemTableError::Frozen) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(MemTableError::Frozen.into())
}
