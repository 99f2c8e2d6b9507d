//! K-way merge over SSTable record streams.
//!
//! Compaction feeds the per-node iterators of its input set through a
//! heap-based merge that yields records in ascending key order. On key
//! ties the record from the **largest source index** wins — input sets
//! are ordered oldest-to-newest, so the newest version survives and the
//! older duplicates are discarded as they surface.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::sstable::{Node, SstError};

struct HeapEntry {
    key: Vec<u8>,
    value: Vec<u8>,
    source_idx: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source_idx == other.source_idx
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    /// Max-heap order inverted on keys so the smallest key pops first;
    /// among equal keys the largest source index pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        match other.key.cmp(&self.key) {
            Ordering::Equal => self.source_idx.cmp(&other.source_idx),
            ord => ord,
        }
    }
}

/// Merges the record streams of several nodes into one sorted stream
/// with per-key deduplication (newest source wins).
pub struct MergeIterator {
    sources: Vec<Arc<Node>>,
    heap: BinaryHeap<HeapEntry>,
    last_key: Option<Vec<u8>>,
}

impl MergeIterator {
    /// Primes the heap with the first record of every source.
    ///
    /// Source order is significant: later entries in `sources` shadow
    /// earlier ones on key collisions.
    pub fn new(sources: Vec<Arc<Node>>) -> Result<Self, SstError> {
        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (source_idx, node) in sources.iter().enumerate() {
            if let Some((key, value)) = node.next_record()? {
                heap.push(HeapEntry {
                    key,
                    value,
                    source_idx,
                });
            }
        }
        Ok(Self {
            sources,
            heap,
            last_key: None,
        })
    }

    /// Yields the next surviving record, or `Ok(None)` when all sources
    /// are drained.
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>, SstError> {
        while let Some(entry) = self.heap.pop() {
            // Refill the source that surfaced.
            if let Some((key, value)) = self.sources[entry.source_idx].next_record()? {
                self.heap.push(HeapEntry {
                    key,
                    value,
                    source_idx: entry.source_idx,
                });
            }

            // Duplicate of the record just emitted: an older version.
            if self.last_key.as_deref() == Some(entry.key.as_slice()) {
                continue;
            }

            self.last_key = Some(entry.key.clone());
            return Ok(Some((entry.key, entry.value)));
        }

        Ok(None)
    }
}
