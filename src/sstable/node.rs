//! Level node — an open SSTable installed in the LSM tree.
//!
//! A [`Node`] couples an open [`SstReader`](super::SstReader) with the
//! table's filter map, index, key range, and level/sequence metadata.
//! It serves bounded point lookups (bloom-gated, restart-point binary
//! search) and the sequential record iteration that feeds compaction.
//!
//! # Concurrency
//!
//! The reader handle and iteration cursor live behind one mutex; the
//! `compacting` flag is an atomic set under the LSM lock and never
//! cleared (compacting nodes are removed on completion). `destroy()`
//! acquires the reader mutex — thereby waiting out in-flight reads —
//! closes the table, and deletes the backing file.

use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::trace;

use crate::block;
use crate::encoding::ByteReader;
use crate::filter;

use super::{FilterMap, IndexEntry, SstError, SstReader};

// ------------------------------------------------------------------------------------------------
// Iteration cursor
// ------------------------------------------------------------------------------------------------

/// Decoded state of the block currently being iterated.
#[derive(Debug)]
struct BlockCursor {
    records: Vec<u8>,
    pos: usize,
    prev_key: Vec<u8>,
}

#[derive(Debug)]
struct NodeInner {
    reader: Option<SstReader>,

    /// Index position of the next block to iterate (entry 0 carries no
    /// block, so iteration starts at 1).
    cur_block: usize,
    cur: Option<BlockCursor>,
}

// ------------------------------------------------------------------------------------------------
// Node
// ------------------------------------------------------------------------------------------------

/// One SSTable installed at a level of the LSM tree.
pub struct Node {
    /// Level this table lives at.
    pub level: usize,

    /// Per-level sequence number; at level 0, larger is newer.
    pub seq_no: u64,

    /// Free-form tag carried in the file name.
    pub tag: String,

    /// Total file size in bytes.
    pub file_size: u64,

    pub(crate) start_key: Vec<u8>,
    pub(crate) end_key: Vec<u8>,

    filter: FilterMap,
    index: Vec<IndexEntry>,

    inner: Mutex<NodeInner>,
    compacting: AtomicBool,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("level", &self.level)
            .field("seq_no", &self.seq_no)
            .field("tag", &self.tag)
            .field("file_size", &self.file_size)
            .field("blocks", &self.index.len().saturating_sub(1))
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Builds a node over a freshly written table, reusing the filter
    /// map and index emitted by the writer.
    pub fn new(
        filter: FilterMap,
        index: Vec<IndexEntry>,
        level: usize,
        seq_no: u64,
        tag: impl Into<String>,
        file_size: u64,
        path: impl AsRef<Path>,
    ) -> Result<Self, SstError> {
        let reader = SstReader::open(path)?;
        Self::with_reader(reader, filter, index, level, seq_no, tag, file_size)
    }

    /// Re-opens a table from disk, reading footer, filter, and index.
    /// Used when loading a persisted tree on startup.
    pub fn load(
        path: impl AsRef<Path>,
        level: usize,
        seq_no: u64,
        tag: impl Into<String>,
    ) -> Result<Self, SstError> {
        let mut reader = SstReader::open(path)?;
        reader.read_footer()?;
        let filter = reader.read_filter()?;
        let index = reader.read_index()?;
        let file_size = reader.file_size();
        Self::with_reader(reader, filter, index, level, seq_no, tag, file_size)
    }

    fn with_reader(
        reader: SstReader,
        filter: FilterMap,
        index: Vec<IndexEntry>,
        level: usize,
        seq_no: u64,
        tag: impl Into<String>,
        file_size: u64,
    ) -> Result<Self, SstError> {
        let (start_key, end_key) = match (index.first(), index.last()) {
            (Some(first), Some(last)) => (first.separator.clone(), last.separator.clone()),
            _ => {
                return Err(SstError::Internal(
                    "node constructed with an empty index".into(),
                ));
            }
        };

        Ok(Self {
            level,
            seq_no,
            tag: tag.into(),
            file_size,
            start_key,
            end_key,
            filter,
            index,
            inner: Mutex::new(NodeInner {
                reader: Some(reader),
                cur_block: 1,
                cur: None,
            }),
            compacting: AtomicBool::new(false),
        })
    }

    /// Smallest separator in the index (lower bound of the key range).
    pub fn start_key(&self) -> &[u8] {
        &self.start_key
    }

    /// Largest key stored in the table.
    pub fn end_key(&self) -> &[u8] {
        &self.end_key
    }

    /// True when this node's key range intersects `[start, end]`.
    pub fn overlaps(&self, start: &[u8], end: &[u8]) -> bool {
        self.start_key.as_slice() <= end && start <= self.end_key.as_slice()
    }

    /// Marks this node as a compaction input. Returns false when it was
    /// already claimed by another compaction.
    pub fn mark_compacting(&self) -> bool {
        self.compacting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// True when this node is claimed by an in-flight compaction.
    pub fn is_compacting(&self) -> bool {
        self.compacting.load(Ordering::Acquire)
    }

    // --------------------------------------------------------------------------------------------
    // Point lookup
    // --------------------------------------------------------------------------------------------

    /// Bounded point lookup.
    ///
    /// Returns the stored (tagged) value bytes, or `None` when the table
    /// holds nothing for the key. The index narrows the search to one
    /// data block, the block's bloom filter screens it, and the block's
    /// restart points bound a short linear scan.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SstError> {
        if key < self.start_key.as_slice() || key > self.end_key.as_slice() {
            return Ok(None);
        }

        // First entry whose separator is ≥ key locates the only block
        // that can contain it.
        let idx = self
            .index
            .partition_point(|e| e.separator.as_slice() < key);
        let Some(entry) = self.index.get(idx) else {
            return Ok(None);
        };
        if entry.block_size == 0 {
            return Ok(None);
        }

        if let Some(bloom) = self.filter.get(&entry.block_offset)
            && !filter::contains(bloom, key)
        {
            trace!(level = self.level, seq = self.seq_no, "bloom negative");
            return Ok(None);
        }

        let inner = self
            .inner
            .lock()
            .map_err(|_| SstError::Internal("node mutex poisoned".into()))?;
        let Some(reader) = inner.reader.as_ref() else {
            return Ok(None); // destroyed concurrently
        };
        let plain = reader.read_block(entry.block_offset, entry.block_size)?;
        drop(inner);

        let (records, restarts) = block::decode_block(&plain)?;

        // Binary search for the last restart whose anchor key is ≤ key.
        let mut lo = 0usize;
        let mut hi = restarts.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let mut r = ByteReader::new(&records[restarts[mid] as usize..]);
            match block::read_record(&[], &mut r)? {
                Some((anchor, _)) if anchor.as_slice() <= key => lo = mid + 1,
                _ => hi = mid,
            }
        }
        if lo == 0 {
            return Ok(None);
        }
        let group_start = restarts[lo - 1] as usize;

        // Scan forward from the anchor until the key matches or the scan
        // passes it.
        let mut r = ByteReader::new(&records[group_start..]);
        let mut prev_key = Vec::new();
        while let Some((rkey, value)) = block::read_record(&prev_key, &mut r)? {
            if rkey.as_slice() == key {
                return Ok(Some(value));
            }
            if rkey.as_slice() > key {
                break;
            }
            prev_key = rkey;
        }

        Ok(None)
    }

    // --------------------------------------------------------------------------------------------
    // Sequential iteration (compaction feed)
    // --------------------------------------------------------------------------------------------

    /// Yields the next record in key order, advancing across blocks.
    ///
    /// Returns `Ok(None)` once the table is exhausted. Iteration state
    /// is per-node; compaction is the only caller.
    pub fn next_record(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>, SstError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| SstError::Internal("node mutex poisoned".into()))?;

        loop {
            if inner.cur.is_none() {
                if inner.cur_block >= self.index.len() {
                    return Ok(None);
                }
                let entry = &self.index[inner.cur_block];
                let Some(reader) = inner.reader.as_ref() else {
                    return Ok(None);
                };
                let plain = reader.read_block(entry.block_offset, entry.block_size)?;
                let records = {
                    let (records, _) = block::decode_block(&plain)?;
                    records.to_vec()
                };
                inner.cur = Some(BlockCursor {
                    records,
                    pos: 0,
                    prev_key: Vec::new(),
                });
                inner.cur_block += 1;
            }

            let cursor = inner.cur.as_mut().expect("cursor just installed");
            let mut r = ByteReader::new(&cursor.records[cursor.pos..]);
            match block::read_record(&cursor.prev_key, &mut r)? {
                Some((key, value)) => {
                    cursor.pos += r.position();
                    cursor.prev_key = key.clone();
                    return Ok(Some((key, value)));
                }
                None => {
                    inner.cur = None;
                }
            }
        }
    }

    /// Closes the reader — waiting out any in-flight lookup — and
    /// deletes the backing file.
    pub fn destroy(&self) -> Result<(), SstError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| SstError::Internal("node mutex poisoned".into()))?;
        inner.cur = None;
        match inner.reader.take() {
            Some(reader) => reader.destroy(),
            None => Ok(()),
        }
    }
}
