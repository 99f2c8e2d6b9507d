//! SSTable writer — builds a complete table file from a sorted stream.
//!
//! [`SstWriter`] accepts strictly increasing keys with their tagged
//! stored values and lays out the file as
//! `data blocks || filter block || index block || footer`.
//!
//! # Input Requirements
//!
//! - Keys **must arrive in strictly increasing byte order** (the
//!   memtable iterator and the compaction merge both guarantee this).
//! - Values are opaque; tombstone tagging happens upstream.
//!
//! # Output Guarantees
//!
//! - Every data block is Snappy-encoded with a CRC32-Castagnoli trailer.
//! - Each data block's bloom filter is registered in the filter block
//!   under the block's file offset.
//! - The index block carries one separator per block boundary plus a
//!   final entry for the table's last key.
//! - [`SstWriter::finish`] returns the total file size together with the
//!   in-memory filter map and index, so freshly flushed tables can be
//!   installed without re-reading the file.
//!
//! # Atomicity
//!
//! The table is written to `<name>.tmp` and renamed into place after the
//! final sync; a crash cannot leave a half-written `.sst` behind.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::block::{self, BlockWriter};
use crate::config::{Config, SST_FOOTER_SIZE};
use crate::encoding;
use crate::filter::BloomFilter;

use super::{FilterMap, IndexEntry, SstError};

// ------------------------------------------------------------------------------------------------
// SstWriter
// ------------------------------------------------------------------------------------------------

/// Builds one SSTable file.
pub struct SstWriter {
    path: PathBuf,
    tmp_path: PathBuf,
    data_block_size: usize,

    data_buf: Vec<u8>,

    data_block: BlockWriter,
    filter_block: BlockWriter,
    index_block: BlockWriter,
    bloom: BloomFilter,

    index: Vec<IndexEntry>,
    filter: FilterMap,

    prev_key: Vec<u8>,
    prev_block_offset: u64,
    prev_block_size: u64,
    record_count: u64,
}

impl SstWriter {
    /// Creates a writer targeting `path`, configured by `conf`.
    pub fn new(path: impl AsRef<Path>, conf: &Config) -> Result<Self, SstError> {
        let path = path.as_ref().to_path_buf();
        let tmp_path = path.with_extension("tmp");

        Ok(Self {
            path,
            tmp_path,
            data_block_size: conf.sst_data_block_size,
            data_buf: Vec::new(),
            data_block: BlockWriter::new(conf.sst_restart_interval),
            filter_block: BlockWriter::new(conf.sst_restart_interval),
            index_block: BlockWriter::new(conf.sst_restart_interval),
            bloom: BloomFilter::new(conf.bloom_bits_per_key),
            index: Vec::new(),
            filter: FilterMap::new(),
            prev_key: Vec::new(),
            prev_block_offset: 0,
            prev_block_size: 0,
            record_count: 0,
        })
    }

    /// Appends one record. Keys must be strictly increasing.
    pub fn append(&mut self, key: &[u8], value: &[u8]) -> Result<(), SstError> {
        if self.data_block.is_empty() {
            self.add_index(key);
        }

        self.data_block.append(key, value);
        self.bloom.add(key);
        self.prev_key.clear();
        self.prev_key.extend_from_slice(key);
        self.record_count += 1;

        if self.data_block.size() > self.data_block_size {
            self.flush_block()?;
        }

        Ok(())
    }

    /// Pushes an index entry delimiting the previous block from the one
    /// starting at `key`.
    fn add_index(&mut self, key: &[u8]) {
        let mut handle = Vec::with_capacity(2 * encoding::MAX_UVARINT_LEN);
        encoding::put_uvarint(&mut handle, self.prev_block_offset);
        encoding::put_uvarint(&mut handle, self.prev_block_size);

        let separator = block::get_separator(&self.prev_key, key);
        self.index_block.append(&separator, &handle);
        self.index.push(IndexEntry {
            separator,
            block_offset: self.prev_block_offset,
            block_size: self.prev_block_size,
        });
    }

    /// Seals the in-progress data block: registers its bloom filter
    /// under the block's offset and appends the compressed bytes to the
    /// data area.
    fn flush_block(&mut self) -> Result<(), SstError> {
        self.prev_block_offset = self.data_buf.len() as u64;

        let bloom_payload = self.bloom.finish();
        self.filter
            .insert(self.prev_block_offset, bloom_payload.clone());
        self.filter_block.append(
            &encoding::uvarint_to_vec(self.prev_block_offset),
            &bloom_payload,
        );
        self.bloom.reset();

        let compressed = self.data_block.finish()?;
        self.prev_block_size = compressed.len() as u64;
        self.data_buf.extend_from_slice(&compressed);

        Ok(())
    }

    /// Bytes of sealed data blocks accumulated so far; drives output
    /// rotation during compaction.
    pub fn size(&self) -> usize {
        self.data_buf.len()
    }

    /// Records appended so far.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Seals the table: flushes the final data block, writes the filter
    /// and index blocks and the footer, syncs, and renames the file into
    /// place.
    ///
    /// Returns `(total_file_size, filter_map, index)` so the caller can
    /// install the table without re-reading it.
    pub fn finish(mut self) -> Result<(u64, FilterMap, Vec<IndexEntry>), SstError> {
        if self.record_count == 0 {
            return Err(SstError::Internal(
                "cannot build an SSTable from zero records".into(),
            ));
        }

        if !self.data_block.is_empty() {
            self.flush_block()?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.tmp_path)?;
        let mut w = BufWriter::new(file);

        // 1. Data area.
        w.write_all(&self.data_buf)?;
        let filter_offset = self.data_buf.len() as u64;

        // 2. Filter block.
        let filter_bytes = self.filter_block.finish()?;
        w.write_all(&filter_bytes)?;
        let filter_size = filter_bytes.len() as u64;

        // 3. Index block, closed by a final entry for the last key
        //    (separator of a key with itself is the key).
        let last_key = self.prev_key.clone();
        self.add_index(&last_key);
        let index_bytes = self.index_block.finish()?;
        let index_offset = filter_offset + filter_size;
        w.write_all(&index_bytes)?;
        let index_size = index_bytes.len() as u64;

        // 4. Footer: four varints, zero-padded to the fixed size.
        let mut footer = Vec::with_capacity(SST_FOOTER_SIZE);
        encoding::put_uvarint(&mut footer, filter_offset);
        encoding::put_uvarint(&mut footer, filter_size);
        encoding::put_uvarint(&mut footer, index_offset);
        encoding::put_uvarint(&mut footer, index_size);
        footer.resize(SST_FOOTER_SIZE, 0);
        w.write_all(&footer)?;

        w.flush()?;
        let file = w
            .into_inner()
            .map_err(|e| SstError::Internal(format!("buffered writer flush: {e}")))?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.tmp_path, &self.path)?;

        let total_size = index_offset + index_size + SST_FOOTER_SIZE as u64;

        debug!(
            path = %self.path.display(),
            records = self.record_count,
            blocks = self.index.len().saturating_sub(1),
            data_bytes = filter_offset,
            total_bytes = total_size,
            "SSTable sealed"
        );

        Ok((total_size, self.filter, self.index))
    }
}
