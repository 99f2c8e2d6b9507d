//! Sorted String Table (SSTable) Module
//!
//! This module implements an **immutable**, **disk-backed** sorted string
//! table with prefix-compressed blocks, per-block bloom filters, and a
//! varint footer, suitable for embedded databases and key-value storage
//! engines.
//!
//! # On-disk layout
//!
//! ```text
//! [data block]...[data block][filter block][index block][footer (40 B)]
//! ```
//!
//! - **Data blocks** — prefix-compressed records (see [`crate::block`]),
//!   Snappy-encoded, each followed by a 4-byte CRC32-Castagnoli trailer.
//! - **Filter block** — same block framing; records map each data
//!   block's file offset (varint key) to its bloom filter payload.
//! - **Index block** — records map a separator key to the *previous*
//!   block's `(offset, size)` varint pair. The first entry carries a
//!   zero handle; entry *i* locates the block ending before its
//!   separator.
//! - **Footer** — exactly 40 bytes: varints `filter_offset`,
//!   `filter_size`, `index_offset`, `index_size`, zero-padded. All four
//!   must be non-zero and the offsets in range.
//!
//! # Sub-modules
//!
//! - [`builder`] — [`SstWriter`] building tables from sorted streams.
//! - [`node`] — [`Node`], an open table installed in an LSM level.
//!
//! # Concurrency model
//!
//! SSTables are immutable once written; [`SstReader`] serves reads from
//! a read-only memory map. A [`node::Node`] serializes access to its
//! reader and iteration cursor behind a mutex, and `destroy()` waits for
//! in-flight readers before deleting the backing file.

// ------------------------------------------------------------------------------------------------
// Sub-modules
// ------------------------------------------------------------------------------------------------

pub mod builder;
pub mod node;

#[cfg(test)]
mod tests;

pub use builder::SstWriter;
pub use node::Node;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use thiserror::Error;
use tracing::trace;

use crate::block::{self, BlockError};
use crate::checksum;
use crate::config::{SST_BLOCK_TRAILER_SIZE, SST_FOOTER_SIZE};
use crate::encoding::{self, ByteReader, EncodingError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations (read, write, build).
#[derive(Debug, Error)]
pub enum SstError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Block encode/decode failure.
    #[error("block error: {0}")]
    Block(#[from] BlockError),

    /// Varint decoding failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Snappy decompression failure.
    #[error("compression error: {0}")]
    Compression(#[from] snap::Error),

    /// A block's stored CRC did not match its compressed payload.
    #[error("checksum mismatch at offset {offset}")]
    ChecksumMismatch {
        /// File offset of the block.
        offset: u64,
    },

    /// The footer failed structural validation.
    #[error("invalid footer: {0}")]
    Footer(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Shared types
// ------------------------------------------------------------------------------------------------

/// One index-block record: a separator key and the location of the data
/// block it delimits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Short key ≥ every key in the previous block and < every key in
    /// the next.
    pub separator: Vec<u8>,

    /// File offset of the previous data block (zero handle on the first
    /// entry).
    pub block_offset: u64,

    /// On-disk size of the previous data block, CRC trailer included.
    pub block_size: u64,
}

/// Per-table bloom filters keyed by data-block file offset.
pub type FilterMap = BTreeMap<u64, Vec<u8>>;

// ------------------------------------------------------------------------------------------------
// SstReader — mmap-backed table reader
// ------------------------------------------------------------------------------------------------

/// Read-only, memory-mapped access to one SSTable file.
///
/// # Safety
///
/// Uses `unsafe { Mmap::map(..) }` but is memory-safe in practice: the
/// file is never written after creation (tables are immutable and built
/// via rename-on-success), the map is read-only, and every block
/// boundary is validated before slicing.
pub struct SstReader {
    path: PathBuf,
    mmap: Mmap,
    file_size: u64,

    /// Footer fields; zero until [`SstReader::read_footer`] runs.
    pub filter_offset: u64,
    pub filter_size: u64,
    pub index_offset: u64,
    pub index_size: u64,
}

impl std::fmt::Debug for SstReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SstReader")
            .field("path", &self.path)
            .field("file_size", &self.file_size)
            .finish_non_exhaustive()
    }
}

impl SstReader {
    /// Opens and memory-maps the table at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SstError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len();

        if (file_size as usize) < SST_FOOTER_SIZE {
            return Err(SstError::Footer(format!(
                "file {} too small ({file_size} bytes)",
                path.display()
            )));
        }

        let mmap = unsafe { Mmap::map(&file)? };

        Ok(Self {
            path,
            mmap,
            file_size,
            filter_offset: 0,
            filter_size: 0,
            index_offset: 0,
            index_size: 0,
        })
    }

    /// Total file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Decodes and validates the 40-byte footer.
    pub fn read_footer(&mut self) -> Result<(), SstError> {
        let start = self.file_size as usize - SST_FOOTER_SIZE;
        let mut r = ByteReader::new(&self.mmap[start..]);

        let filter_offset = r.read_uvarint()?;
        let filter_size = r.read_uvarint()?;
        let index_offset = r.read_uvarint()?;
        let index_size = r.read_uvarint()?;

        if filter_offset == 0 || filter_size == 0 || index_offset == 0 || index_size == 0 {
            return Err(SstError::Footer("zero field".into()));
        }
        if filter_offset >= self.file_size || index_offset >= self.file_size {
            return Err(SstError::Footer(format!(
                "offsets ({filter_offset}, {index_offset}) out of range for {} bytes",
                self.file_size
            )));
        }

        self.filter_offset = filter_offset;
        self.filter_size = filter_size;
        self.index_offset = index_offset;
        self.index_size = index_size;
        Ok(())
    }

    /// Reads a block at `(offset, size)`, verifies its CRC, and returns
    /// the decompressed plaintext.
    pub fn read_block(&self, offset: u64, size: u64) -> Result<Vec<u8>, SstError> {
        trace!(path = %self.path.display(), offset, size, "reading block");

        let end = offset
            .checked_add(size)
            .filter(|&end| end <= self.file_size)
            .ok_or_else(|| {
                SstError::Internal(format!(
                    "block ({offset}, {size}) out of range for {} bytes",
                    self.file_size
                ))
            })?;
        if (size as usize) <= SST_BLOCK_TRAILER_SIZE {
            return Err(SstError::Internal(format!("block too small ({size} bytes)")));
        }

        let raw = &self.mmap[offset as usize..end as usize];
        let (compressed, crc_bytes) = raw.split_at(raw.len() - SST_BLOCK_TRAILER_SIZE);
        let stored_crc = encoding::read_u32_le(crc_bytes, 0)?;

        if checksum::crc32(compressed) != stored_crc {
            return Err(SstError::ChecksumMismatch { offset });
        }

        Ok(snap::raw::Decoder::new().decompress_vec(compressed)?)
    }

    /// Reads the filter block into an offset → bloom-payload map.
    pub fn read_filter(&mut self) -> Result<FilterMap, SstError> {
        if self.filter_offset == 0 {
            self.read_footer()?;
        }

        let plain = self.read_block(self.filter_offset, self.filter_size)?;
        let (records, _) = block::decode_block(&plain)?;

        let mut filters = FilterMap::new();
        let mut r = ByteReader::new(records);
        let mut prev_key = Vec::new();
        while let Some((key, value)) = block::read_record(&prev_key, &mut r)? {
            let (offset, _) = encoding::uvarint(&key)?;
            filters.insert(offset, value);
            prev_key = key;
        }

        Ok(filters)
    }

    /// Reads the index block into an ordered entry list.
    pub fn read_index(&mut self) -> Result<Vec<IndexEntry>, SstError> {
        if self.index_offset == 0 {
            self.read_footer()?;
        }

        let plain = self.read_block(self.index_offset, self.index_size)?;
        let (records, _) = block::decode_block(&plain)?;

        let mut entries = Vec::new();
        let mut r = ByteReader::new(records);
        let mut prev_key = Vec::new();
        while let Some((key, value)) = block::read_record(&prev_key, &mut r)? {
            let (block_offset, n) = encoding::uvarint(&value)?;
            let (block_size, _) = encoding::uvarint(&value[n..])?;
            entries.push(IndexEntry {
                separator: key.clone(),
                block_offset,
                block_size,
            });
            prev_key = key;
        }

        Ok(entries)
    }

    /// Closes the map and deletes the backing file. Called at the end of
    /// compaction, once the table's replacement is installed.
    pub fn destroy(self) -> Result<(), SstError> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(&path)?;
        Ok(())
    }
}
