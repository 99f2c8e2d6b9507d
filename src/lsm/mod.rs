//! # LSM Tree Module
//!
//! The leveled heart of the engine: an array of SSTable [`Node`]s per
//! level, flush-from-memtable into level 0, and background k-way merge
//! compaction that promotes data down the levels.
//!
//! ## Level invariants
//!
//! - Level 0 tables may overlap; they are ordered by `seq_no` ascending
//!   and point reads consult them newest-first.
//! - Tables at level ≥ 1 have disjoint key ranges and are ordered by
//!   `start_key`.
//! - `seq_no[level]` is monotonically increasing; a new table at level
//!   `L` receives `seq_no = ++seq_no[L]`.
//! - A flushed or compacted table becomes visible to readers only after
//!   `insert_node` returns; compaction never deletes an input file
//!   before its replacement is installed at the next level.
//!
//! ## Scheduling
//!
//! Three cooperating loops, started by [`LsmTree::start`] and stopped by
//! closing the engine's shutdown channel:
//!
//! 1. a **dispatcher** draining the compaction channel and routing
//!    level 0 to the level-0 loop, deeper levels to the level-N loop;
//! 2. the **level-0 loop**, compacting when the table count exceeds the
//!    configured threshold;
//! 3. the **level-N loop**, compacting a level while its total size
//!    exceeds `sst_size · 10^(level+1)`.
//!
//! The long-running merge itself runs unlocked; the tree mutex is held
//! only for `pick`, `insert_node`, `remove_nodes`, and `next_seq_no`.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod merge;

pub use merge::MergeIterator;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crossbeam::channel::{self, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::memtable::FrozenMemtable;
use crate::sstable::{Node, SstError, SstWriter};
use crate::types::{self, Key, Value};

/// Tag carried in the file names of compaction outputs.
const COMPACT_TAG: &str = "c";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by LSM tree operations.
#[derive(Debug, Error)]
pub enum LsmError {
    /// SSTable read/write failure.
    #[error("SSTable error: {0}")]
    Sst(#[from] SstError),

    /// Underlying filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// File naming
// ------------------------------------------------------------------------------------------------

/// File name of the table with the given coordinates:
/// `{level}_{seq}_{tag}.sst`.
pub fn format_name(level: usize, seq_no: u64, tag: &str) -> String {
    format!("{level}_{seq_no}_{tag}.sst")
}

/// Parses `{level}_{seq}_{tag}.sst` back into its coordinates.
pub fn parse_name(name: &str) -> Option<(usize, u64, String)> {
    let stem = name.strip_suffix(".sst")?;
    let mut parts = stem.splitn(3, '_');
    let level = parts.next()?.parse().ok()?;
    let seq_no = parts.next()?.parse().ok()?;
    let tag = parts.next()?.to_string();
    Some((level, seq_no, tag))
}

// ------------------------------------------------------------------------------------------------
// Level state
// ------------------------------------------------------------------------------------------------

struct LevelState {
    /// `levels[L]` holds the nodes of level `L` in their invariant
    /// order.
    levels: Vec<Vec<Arc<Node>>>,

    /// Per-level sequence counters.
    seq_no: Vec<u64>,
}

// ------------------------------------------------------------------------------------------------
// LsmTree
// ------------------------------------------------------------------------------------------------

/// The leveled SSTable tree and its compaction scheduler.
pub struct LsmTree {
    conf: Arc<Config>,
    state: Mutex<LevelState>,

    compact_tx: Sender<usize>,
    compact_rx: Receiver<usize>,
    stop_rx: Receiver<()>,

    /// Background destroy threads for consumed compaction inputs;
    /// joined on shutdown so files are gone before a reopen.
    destroyers: Mutex<Vec<JoinHandle<()>>>,
}

impl LsmTree {
    /// Creates an empty tree. `stop_rx` is the engine's shutdown
    /// broadcast; the loops exit when it disconnects.
    pub fn new(conf: Arc<Config>, stop_rx: Receiver<()>) -> Self {
        let (compact_tx, compact_rx) = channel::bounded(64);
        Self {
            state: Mutex::new(LevelState {
                levels: vec![Vec::new(); conf.max_level],
                seq_no: vec![0; conf.max_level],
            }),
            conf,
            compact_tx,
            compact_rx,
            stop_rx,
            destroyers: Mutex::new(Vec::new()),
        }
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, LevelState>, LsmError> {
        self.state
            .lock()
            .map_err(|_| LsmError::Internal("LSM mutex poisoned".into()))
    }

    /// Queues a compaction check for `level`. Signals are droppable —
    /// the loops re-derive the decision from tree state on every wake.
    fn signal_compact(&self, level: usize) {
        if self.compact_tx.try_send(level).is_err() {
            debug!(level, "compaction channel full, signal dropped");
        }
    }

    // --------------------------------------------------------------------------------------------
    // Sequence numbers and membership
    // --------------------------------------------------------------------------------------------

    /// Increments and returns the sequence counter of `level`.
    pub fn next_seq_no(&self, level: usize) -> Result<u64, LsmError> {
        let mut state = self.lock_state()?;
        state.seq_no[level] += 1;
        Ok(state.seq_no[level])
    }

    /// Installs a node at its level, preserving the level's order
    /// invariant.
    pub fn insert_node(&self, node: Arc<Node>) -> Result<(), LsmError> {
        let mut state = self.lock_state()?;
        let level = node.level;
        if level >= state.levels.len() {
            return Err(LsmError::Internal(format!(
                "node level {level} out of range"
            )));
        }

        let nodes = &mut state.levels[level];
        if level == 0 {
            // Ordered by seq_no ascending; an equal seq_no replaces.
            match nodes.binary_search_by(|n| n.seq_no.cmp(&node.seq_no)) {
                Ok(pos) => nodes[pos] = node,
                Err(pos) => nodes.insert(pos, node),
            }
        } else {
            // Ordered by start_key ascending; ranges are disjoint.
            let pos = nodes.partition_point(|n| n.start_key() < node.start_key());
            nodes.insert(pos, node);
        }
        Ok(())
    }

    /// Unlinks the given nodes from their levels and destroys them on a
    /// background thread (close reader, delete file).
    fn remove_nodes(&self, inputs: &[Arc<Node>]) -> Result<(), LsmError> {
        {
            let mut state = self.lock_state()?;
            for input in inputs {
                let level = input.level;
                state.levels[level].retain(|n| !Arc::ptr_eq(n, input));
            }
        }

        let doomed: Vec<Arc<Node>> = inputs.to_vec();
        let handle = std::thread::spawn(move || {
            for node in doomed {
                if let Err(e) = node.destroy() {
                    warn!(level = node.level, seq = node.seq_no, error = %e,
                        "failed to destroy compacted SSTable");
                }
            }
        });
        if let Ok(mut destroyers) = self.destroyers.lock() {
            destroyers.retain(|h| !h.is_finished());
            destroyers.push(handle);
        }
        Ok(())
    }

    /// Waits for pending input-file destruction. Called during engine
    /// shutdown so a subsequent open sees a settled directory.
    pub fn join_destroyers(&self) {
        let handles = match self.destroyers.lock() {
            Ok(mut destroyers) => std::mem::take(&mut *destroyers),
            Err(_) => return,
        };
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Number of nodes at `level`.
    pub fn level_len(&self, level: usize) -> Result<usize, LsmError> {
        Ok(self.lock_state()?.levels[level].len())
    }

    /// Snapshot of the nodes at `level` (invariant checks in tests).
    #[cfg(test)]
    pub(crate) fn level_nodes(&self, level: usize) -> Vec<Arc<Node>> {
        self.lock_state()
            .map(|state| state.levels[level].clone())
            .unwrap_or_default()
    }

    /// Sum of file sizes at `level`.
    pub fn level_total_size(&self, level: usize) -> Result<u64, LsmError> {
        Ok(self.lock_state()?.levels[level]
            .iter()
            .map(|n| n.file_size)
            .sum())
    }

    // --------------------------------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------------------------------

    /// Writes a frozen memtable into a fresh level-0 SSTable and
    /// installs it.
    ///
    /// Live entries and tombstones both survive the flush — tombstones
    /// must reach disk so compaction can suppress older values of the
    /// same key.
    pub fn flush_record<K: Key, V: Value>(
        &self,
        table: &FrozenMemtable<K, V>,
        tag: &str,
    ) -> Result<(), LsmError> {
        if table.is_empty() {
            return Ok(());
        }

        let level = 0;
        let seq_no = self.next_seq_no(level)?;
        let file = format_name(level, seq_no, tag);
        let path = self.conf.dir.join(&file);

        let mut writer = SstWriter::new(&path, &self.conf)?;
        let mut count = 0u64;
        for (key, value) in table.iter() {
            let stored = match value {
                Some(v) => types::tag_live(&v.to_bytes()),
                None => types::tag_tombstone(),
            };
            writer.append(&key.to_bytes(), &stored)?;
            count += 1;
        }

        let (file_size, filter, index) = writer.finish()?;
        let node = Node::new(filter, index, level, seq_no, tag, file_size, &path)?;
        self.insert_node(Arc::new(node))?;

        info!(file = %file, count, bytes = file_size, "memtable flushed to level 0");

        self.signal_compact(level);
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Point lookup
    // --------------------------------------------------------------------------------------------

    /// Returns the stored (tagged) value bytes of `key` from the newest
    /// table containing it, or `None`.
    ///
    /// Level 0 is scanned newest-`seq_no`-first; deeper levels are
    /// binary-searched by key range (ranges are disjoint there).
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, LsmError> {
        let candidates: Vec<Arc<Node>> = {
            let state = self.lock_state()?;
            let mut out = Vec::new();

            for node in state.levels[0].iter().rev() {
                out.push(node.clone());
            }

            for nodes in state.levels.iter().skip(1) {
                let pos = nodes.partition_point(|n| n.end_key() < key);
                if let Some(node) = nodes.get(pos)
                    && node.start_key() <= key
                {
                    out.push(node.clone());
                }
            }
            out
        };

        for node in candidates {
            if let Some(stored) = node.get(key)? {
                return Ok(Some(stored));
            }
        }
        Ok(None)
    }

    // --------------------------------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------------------------------

    /// Selects the input set for compacting `level` into `level + 1`.
    ///
    /// Seeds the key range from the level's first node (level 0) or its
    /// middle node (deeper levels), then collects every non-compacting
    /// overlapping node from `level + 1` first — widening the range to
    /// cover them — and from `level` second. Selected nodes are marked
    /// `compacting` under the tree mutex.
    fn pick(&self, level: usize) -> Result<Vec<Arc<Node>>, LsmError> {
        let state = self.lock_state()?;
        let nodes = &state.levels[level];
        if nodes.is_empty() {
            return Ok(Vec::new());
        }

        let seed = if level == 0 {
            &nodes[0]
        } else {
            &nodes[nodes.len() / 2]
        };
        if seed.is_compacting() {
            return Ok(Vec::new());
        }

        let mut start = seed.start_key().to_vec();
        let mut end = seed.end_key().to_vec();
        let mut set = Vec::new();

        for lvl in [level + 1, level] {
            if lvl >= state.levels.len() {
                continue;
            }
            for node in &state.levels[lvl] {
                if node.is_compacting() || !node.overlaps(&start, &end) {
                    continue;
                }
                if !node.mark_compacting() {
                    continue;
                }
                if lvl == level + 1 {
                    if node.start_key() < start.as_slice() {
                        start = node.start_key().to_vec();
                    }
                    if node.end_key() > end.as_slice() {
                        end = node.end_key().to_vec();
                    }
                }
                set.push(node.clone());
            }
        }

        Ok(set)
    }

    /// Merges one picked input set from `level` into `level + 1`.
    ///
    /// Returns the number of consumed inputs (zero when there was
    /// nothing to do). Output tables rotate whenever the writer's data
    /// area exceeds the level's size budget.
    pub fn compact(&self, level: usize) -> Result<usize, LsmError> {
        if level + 1 >= self.conf.max_level {
            return Ok(0); // bottom level has nowhere to push
        }

        let inputs = self.pick(level)?;
        if inputs.is_empty() {
            return Ok(0);
        }

        let next_level = level + 1;
        let rotate_limit = self.conf.level_size_limit(level);

        debug!(
            level,
            inputs = inputs.len(),
            rotate_limit,
            "compaction started"
        );

        let mut merge = MergeIterator::new(inputs.clone())?;
        let mut writer: Option<(SstWriter, u64, PathBuf)> = None;
        let mut outputs = 0usize;

        while let Some((key, value)) = merge.next_entry()? {
            if writer.is_none() {
                let seq_no = self.next_seq_no(next_level)?;
                let path = self
                    .conf
                    .dir
                    .join(format_name(next_level, seq_no, COMPACT_TAG));
                writer = Some((SstWriter::new(&path, &self.conf)?, seq_no, path));
            }

            let rotate = {
                let (w, _, _) = writer.as_mut().expect("writer just installed");
                w.append(&key, &value)?;
                w.size() as u64 > rotate_limit
            };
            if rotate {
                let (w, seq_no, path) = writer.take().expect("writer present");
                self.install_output(w, next_level, seq_no, &path)?;
                outputs += 1;
            }
        }

        if let Some((w, seq_no, path)) = writer.take() {
            self.install_output(w, next_level, seq_no, &path)?;
            outputs += 1;
        }

        self.remove_nodes(&inputs)?;

        info!(
            level,
            next_level,
            inputs = inputs.len(),
            outputs,
            "compaction finished"
        );

        self.signal_compact(next_level);
        Ok(inputs.len())
    }

    fn install_output(
        &self,
        writer: SstWriter,
        level: usize,
        seq_no: u64,
        path: &PathBuf,
    ) -> Result<(), LsmError> {
        let (file_size, filter, index) = writer.finish()?;
        let node = Node::new(filter, index, level, seq_no, COMPACT_TAG, file_size, path)?;
        self.insert_node(Arc::new(node))?;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Startup recovery
    // --------------------------------------------------------------------------------------------

    /// Rebuilds the level array from the `.sst` files in the data
    /// directory and restores the per-level sequence counters.
    ///
    /// Stray `.tmp` files from an interrupted build are removed. Levels
    /// holding data are signalled so compaction debt is worked off after
    /// the loops start.
    pub fn load_existing(&self) -> Result<(), LsmError> {
        let mut loaded = 0usize;
        for dirent in fs::read_dir(&self.conf.dir)? {
            let dirent = dirent?;
            let path = dirent.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.ends_with(".tmp") {
                warn!(file = name, "removing interrupted SSTable build");
                let _ = fs::remove_file(&path);
                continue;
            }
            let Some((level, seq_no, tag)) = parse_name(name) else {
                continue;
            };
            if level >= self.conf.max_level {
                return Err(LsmError::Internal(format!(
                    "SSTable {name} at level {level} exceeds max_level {}",
                    self.conf.max_level
                )));
            }

            let node = Node::load(&path, level, seq_no, tag.as_str())?;
            {
                let mut state = self.lock_state()?;
                if state.seq_no[level] < seq_no {
                    state.seq_no[level] = seq_no;
                }
            }
            self.insert_node(Arc::new(node))?;
            loaded += 1;
        }

        if loaded > 0 {
            info!(tables = loaded, "existing SSTables loaded");
            let state = self.lock_state()?;
            let occupied: Vec<usize> = state
                .levels
                .iter()
                .enumerate()
                .filter(|(_, nodes)| !nodes.is_empty())
                .map(|(level, _)| level)
                .collect();
            drop(state);
            for level in occupied {
                self.signal_compact(level);
            }
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Background loops
    // --------------------------------------------------------------------------------------------

    /// Spawns the dispatcher and the two compaction loops.
    ///
    /// All three exit when the engine's shutdown channel disconnects.
    /// A compaction failure terminates its loop; the tree remains
    /// readable and writable.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let (l0_tx, l0_rx) = channel::bounded::<()>(4);
        let (ln_tx, ln_rx) = channel::bounded::<usize>(16);

        let mut handles = Vec::with_capacity(3);

        // Dispatcher: route compaction signals to the level loops.
        {
            let tree = Arc::clone(self);
            handles.push(std::thread::spawn(move || {
                loop {
                    crossbeam::select! {
                        recv(tree.compact_rx) -> msg => match msg {
                            Ok(0) => {
                                let _ = l0_tx.try_send(());
                            }
                            Ok(level) => {
                                let _ = ln_tx.try_send(level);
                            }
                            Err(_) => break,
                        },
                        recv(tree.stop_rx) -> _ => break,
                    }
                }
                debug!("compaction dispatcher stopped");
            }));
        }

        // Level-0 loop: compact when the table count exceeds the
        // threshold.
        {
            let tree = Arc::clone(self);
            handles.push(std::thread::spawn(move || {
                loop {
                    crossbeam::select! {
                        recv(l0_rx) -> msg => {
                            if msg.is_err() {
                                break;
                            }
                            let over = match tree.level_len(0) {
                                Ok(len) => len > tree.conf.level0_compact_threshold,
                                Err(_) => break,
                            };
                            if over && let Err(e) = tree.compact(0) {
                                error!(error = %e, "level-0 compaction failed");
                                break;
                            }
                        },
                        recv(tree.stop_rx) -> _ => break,
                    }
                }
                debug!("level-0 compaction loop stopped");
            }));
        }

        // Level-N loop: compact a level until it is back under its size
        // budget.
        {
            let tree = Arc::clone(self);
            handles.push(std::thread::spawn(move || {
                loop {
                    crossbeam::select! {
                        recv(ln_rx) -> msg => {
                            let level = match msg {
                                Ok(level) => level,
                                Err(_) => break,
                            };
                            if level + 1 >= tree.conf.max_level {
                                continue;
                            }
                            loop {
                                let over = match tree.level_total_size(level) {
                                    Ok(size) => size > tree.conf.level_size_limit(level),
                                    Err(_) => return,
                                };
                                if !over {
                                    break;
                                }
                                match tree.compact(level) {
                                    Ok(0) => break,
                                    Ok(_) => continue,
                                    Err(e) => {
                                        error!(level, error = %e, "level compaction failed");
                                        return;
                                    }
                                }
                            }
                        },
                        recv(tree.stop_rx) -> _ => break,
                    }
                }
                debug!("level-N compaction loop stopped");
            }));
        }

        handles
    }
}
