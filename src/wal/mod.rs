//! Write-Ahead Logging (WAL) Module
//!
//! This module implements a **durable**, **append-only** write-ahead log
//! with 32 KiB block framing, suitable for embedded databases and
//! key-value storage engines. Logical records of arbitrary length are
//! split into CRC-protected chunks that never straddle a block boundary,
//! so a reader can resynchronize after a torn write by skipping to the
//! next block.
//!
//! # On-disk layout
//!
//! ```text
//! block (32768 bytes):
//!   [chunk][chunk]...[zero padding when < 7 bytes remain]
//! chunk:
//!   [crc32c u32 LE][length u16 LE][type u8][payload]
//! ```
//!
//! - **type** — `FULL` (0), `FIRST` (1), `MIDDLE` (2), `LAST` (3).
//!   A logical record is one `FULL` chunk, or `FIRST`, zero or more
//!   `MIDDLE`, then `LAST`.
//! - **crc32c** — CRC32-Castagnoli over `type || payload`.
//!
//! # Concurrency model
//!
//! A [`Writer`] or [`Reader`] is owned by a single component (the
//! memtable manager serializes access under its own mutex). The
//! per-record handles returned by [`Writer::next`] and [`Reader::next`]
//! borrow the codec mutably, so a stale handle is unrepresentable.
//!
//! # Guarantees
//!
//! - **Durability:** `flush()` finalizes the pending chunk and forwards
//!   to the sink's flush; the owner syncs the file when required.
//! - **Integrity:** every chunk checksum is verified during replay
//!   (unless disabled via [`ReadOptions::checksum`]).
//! - **Corruption reporting:** non-fatal corruption is delivered to the
//!   configured [`Dropper`]; with [`ReadOptions::strict`] it becomes
//!   fatal instead.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests;

// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::io::{self, Read, Write};

use thiserror::Error;
use tracing::warn;

use crate::checksum;
use crate::encoding;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Fixed WAL block size.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Chunk header size: `crc32 (4) + length (2) + type (1)`.
pub const HEADER_SIZE: usize = 7;

const CHUNK_FULL: u8 = 0;
const CHUNK_FIRST: u8 = 1;
const CHUNK_MIDDLE: u8 = 2;
const CHUNK_LAST: u8 = 3;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A chunk failed structural or checksum validation.
    #[error(transparent)]
    Corruption(#[from] CorruptionError),
}

/// A single corrupted region of the log.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("wal corrupted: {reason} ({bytes} bytes)")]
pub struct CorruptionError {
    /// Bytes rendered unreadable by this corruption.
    pub bytes: usize,

    /// What failed validation.
    pub reason: CorruptionReason,
}

/// Classification of WAL corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptionReason {
    /// Header bytes were all zero (block padding read as a chunk).
    ZeroHeader,

    /// Chunk type byte outside `FULL..=LAST`.
    InvalidChunkType(u8),

    /// Declared chunk length runs past the block.
    ChunkOverflow,

    /// Stored checksum does not match `crc32c(type || payload)`.
    ChecksumMismatch,

    /// A `MIDDLE`/`LAST` chunk appeared where a record must start.
    OrphanChunk,

    /// The log ended before the record's `LAST` chunk.
    MissingChunkPart,
}

impl std::fmt::Display for CorruptionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ZeroHeader => write!(f, "zero header"),
            Self::InvalidChunkType(t) => write!(f, "invalid chunk type {t:#x}"),
            Self::ChunkOverflow => write!(f, "chunk overflow"),
            Self::ChecksumMismatch => write!(f, "checksum mismatch"),
            Self::OrphanChunk => write!(f, "orphan chunk"),
            Self::MissingChunkPart => write!(f, "missing chunk part"),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Dropper capability
// ------------------------------------------------------------------------------------------------

/// Receives non-fatal corruption notifications during replay.
///
/// In non-strict mode the reader skips corrupted regions after reporting
/// them here; in strict mode the same corruption is also returned as an
/// error.
pub trait Dropper: Send {
    /// Called once per corrupted region.
    fn dropped(&mut self, err: &CorruptionError);
}

/// A [`Dropper`] that logs each corruption at `warn` level.
#[derive(Debug, Default)]
pub struct LogDropper;

impl Dropper for LogDropper {
    fn dropped(&mut self, err: &CorruptionError) {
        warn!(bytes = err.bytes, reason = %err.reason, "WAL corruption dropped");
    }
}

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

/// Chunked WAL writer over any byte sink.
///
/// Records are started with [`Writer::next`]; the returned
/// [`RecordWriter`] implements [`std::io::Write`] and splits the payload
/// across `FIRST`/`MIDDLE`/`LAST` chunks as blocks fill up.
#[derive(Debug)]
pub struct Writer<W: Write> {
    w: W,
    buf: Box<[u8; BLOCK_SIZE]>,

    /// Offset of the current chunk's header within `buf`.
    i: usize,

    /// Write cursor within `buf`.
    j: usize,

    /// Bytes of `buf` already handed to the sink.
    written: usize,

    /// Completed blocks flushed so far.
    block_number: u64,

    /// The current chunk is the first of its record.
    first: bool,

    /// A chunk header is open and awaiting finalization.
    pending: bool,
}

impl<W: Write> Writer<W> {
    /// Creates a writer over `w`, starting at a block boundary.
    pub fn new(w: W) -> Self {
        Self {
            w,
            buf: Box::new([0u8; BLOCK_SIZE]),
            i: 0,
            j: 0,
            written: 0,
            block_number: 0,
            first: false,
            pending: false,
        }
    }

    /// Finalizes the header of the chunk at `self.i..self.j`.
    fn fill_header(&mut self, last: bool) {
        debug_assert!(self.i + HEADER_SIZE <= self.j && self.j <= BLOCK_SIZE);

        self.buf[self.i + 6] = if last {
            if self.first { CHUNK_FULL } else { CHUNK_LAST }
        } else if self.first {
            CHUNK_FIRST
        } else {
            CHUNK_MIDDLE
        };

        let crc = checksum::crc32(&self.buf[self.i + 6..self.j]);
        self.buf[self.i..self.i + 4].copy_from_slice(&crc.to_le_bytes());
        let len = (self.j - self.i - HEADER_SIZE) as u16;
        self.buf[self.i + 4..self.i + 6].copy_from_slice(&len.to_le_bytes());
    }

    /// Flushes the rest of the current block and rewinds the cursors.
    fn write_block(&mut self) -> io::Result<()> {
        self.w.write_all(&self.buf[self.written..])?;
        self.i = 0;
        self.j = HEADER_SIZE;
        self.written = 0;
        self.block_number += 1;
        Ok(())
    }

    /// Finalizes any pending chunk and hands completed bytes to the sink.
    fn write_pending(&mut self) -> io::Result<()> {
        if self.pending {
            self.fill_header(true);
            self.pending = false;
        }
        self.w.write_all(&self.buf[self.written..self.j])?;
        self.written = self.j;
        Ok(())
    }

    /// Starts a new logical record, closing any record still pending.
    pub fn next(&mut self) -> Result<RecordWriter<'_, W>, WalError> {
        if self.pending {
            self.fill_header(true);
        }
        self.i = self.j;
        self.j += HEADER_SIZE;

        // Not enough room for a header: pad the block with zeroes.
        if self.j > BLOCK_SIZE {
            for b in &mut self.buf[self.i..] {
                *b = 0;
            }
            self.write_block()?;
        }

        self.first = true;
        self.pending = true;
        Ok(RecordWriter { w: self })
    }

    /// Finalizes the pending record and flushes the sink.
    pub fn flush(&mut self) -> Result<(), WalError> {
        self.write_pending()?;
        self.w.flush()?;
        Ok(())
    }

    /// Writes any pending data and flushes. The owner is responsible for
    /// syncing the underlying file.
    pub fn close(&mut self) -> Result<(), WalError> {
        self.write_pending()?;
        self.w.flush()?;
        Ok(())
    }

    /// Discards pending state and rebinds the writer to a new sink,
    /// returning the previous one.
    pub fn reset(&mut self, w: W) -> W {
        let old = std::mem::replace(&mut self.w, w);
        self.i = 0;
        self.j = 0;
        self.written = 0;
        self.block_number = 0;
        self.first = false;
        self.pending = false;
        old
    }

    /// Logical size written so far: completed blocks plus the cursor.
    pub fn size(&self) -> u64 {
        self.block_number * BLOCK_SIZE as u64 + self.j as u64
    }

    /// Borrows the underlying sink (for file syncs).
    pub fn get_ref(&self) -> &W {
        &self.w
    }
}

/// Handle for writing one logical record's payload.
///
/// Returned by [`Writer::next`]; borrows the writer, so only one record
/// can be open at a time.
#[derive(Debug)]
pub struct RecordWriter<'a, W: Write> {
    w: &'a mut Writer<W>,
}

impl<W: Write> Write for RecordWriter<'_, W> {
    fn write(&mut self, p: &[u8]) -> io::Result<usize> {
        let w = &mut self.w;
        let total = p.len();
        let mut p = p;

        while !p.is_empty() {
            if w.j == BLOCK_SIZE {
                w.fill_header(false);
                w.write_block()?;
                w.first = false;
            }
            let n = p.len().min(BLOCK_SIZE - w.j);
            w.buf[w.j..w.j + n].copy_from_slice(&p[..n]);
            w.j += n;
            p = &p[n..];
        }

        Ok(total)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.w.flush().map_err(|e| match e {
            WalError::Io(e) => e,
            other => io::Error::other(other),
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Reader
// ------------------------------------------------------------------------------------------------

/// Options recognized by the WAL reader.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    /// Make corruption fatal instead of reported-and-skipped.
    pub strict: bool,

    /// Verify each chunk's CRC.
    pub checksum: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            strict: false,
            checksum: true,
        }
    }
}

/// Outcome of advancing to the next chunk.
enum ChunkOutcome {
    /// A valid chunk is available at `i..j`.
    Chunk,

    /// End of the log.
    Eof,

    /// A corrupted region was skipped (non-strict mode).
    Skip,
}

/// Chunked WAL reader mirroring [`Writer`].
pub struct Reader<R: Read> {
    r: R,
    dropper: Option<Box<dyn Dropper>>,
    strict: bool,
    checksum: bool,

    /// Start of the current chunk's payload within `buf`.
    i: usize,

    /// End of the current chunk's payload within `buf`.
    j: usize,

    /// Valid bytes in `buf`.
    n: usize,

    /// The current chunk terminates its record.
    last: bool,

    buf: Box<[u8; BLOCK_SIZE]>,
}

impl<R: Read> std::fmt::Debug for Reader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("i", &self.i)
            .field("j", &self.j)
            .field("n", &self.n)
            .field("strict", &self.strict)
            .field("checksum", &self.checksum)
            .finish_non_exhaustive()
    }
}

impl<R: Read> Reader<R> {
    /// Creates a reader over `r`.
    pub fn new(r: R, dropper: Option<Box<dyn Dropper>>, options: ReadOptions) -> Self {
        Self {
            r,
            dropper,
            strict: options.strict,
            checksum: options.checksum,
            i: 0,
            j: 0,
            n: 0,
            last: true,
            buf: Box::new([0u8; BLOCK_SIZE]),
        }
    }

    /// Reports a corrupted region, failing in strict mode.
    fn corrupt(
        &mut self,
        bytes: usize,
        reason: CorruptionReason,
        skip: bool,
    ) -> Result<ChunkOutcome, WalError> {
        let err = CorruptionError { bytes, reason };
        if let Some(dropper) = &mut self.dropper {
            dropper.dropped(&err);
        }
        if self.strict && !skip {
            return Err(WalError::Corruption(err));
        }
        Ok(ChunkOutcome::Skip)
    }

    /// Advances `i..j` to the next chunk, reading blocks as needed.
    ///
    /// `first` is true when a record boundary is expected here.
    fn next_chunk(&mut self, first: bool) -> Result<ChunkOutcome, WalError> {
        loop {
            if self.j + HEADER_SIZE <= self.n {
                let stored_crc =
                    encoding::read_u32_le(&self.buf[..], self.j).map_err(io::Error::other)?;
                let length = encoding::read_u16_le(&self.buf[..], self.j + 4)
                    .map_err(io::Error::other)? as usize;
                let chunk_type = self.buf[self.j + 6];
                let unprocessed = self.n - self.j;

                if stored_crc == 0 && length == 0 && chunk_type == 0 {
                    self.i = self.n;
                    self.j = self.n;
                    return self.corrupt(unprocessed, CorruptionReason::ZeroHeader, false);
                }
                if chunk_type > CHUNK_LAST {
                    self.i = self.n;
                    self.j = self.n;
                    return self.corrupt(
                        unprocessed,
                        CorruptionReason::InvalidChunkType(chunk_type),
                        false,
                    );
                }

                self.i = self.j + HEADER_SIZE;
                self.j = self.j + HEADER_SIZE + length;
                if self.j > self.n {
                    self.i = self.n;
                    self.j = self.n;
                    return self.corrupt(unprocessed, CorruptionReason::ChunkOverflow, false);
                }

                if self.checksum && stored_crc != checksum::crc32(&self.buf[self.i - 1..self.j]) {
                    self.i = self.n;
                    self.j = self.n;
                    return self.corrupt(unprocessed, CorruptionReason::ChecksumMismatch, false);
                }

                if first && chunk_type != CHUNK_FULL && chunk_type != CHUNK_FIRST {
                    let chunk_size = (self.j - self.i) + HEADER_SIZE;
                    self.i = self.j;
                    return self.corrupt(chunk_size, CorruptionReason::OrphanChunk, true);
                }

                self.last = chunk_type == CHUNK_FULL || chunk_type == CHUNK_LAST;
                return Ok(ChunkOutcome::Chunk);
            }

            // The previous read returned a partial (final) block.
            if self.n > 0 && self.n < BLOCK_SIZE {
                if !first {
                    return self.corrupt(0, CorruptionReason::MissingChunkPart, false);
                }
                return Ok(ChunkOutcome::Eof);
            }

            let n = read_full(&mut self.r, &mut self.buf[..])?;
            if n == 0 {
                if !first {
                    return self.corrupt(0, CorruptionReason::MissingChunkPart, false);
                }
                return Ok(ChunkOutcome::Eof);
            }
            self.i = 0;
            self.j = 0;
            self.n = n;
        }
    }

    /// Positions the reader at the next record.
    ///
    /// Returns `Ok(None)` at end of log. Orphan chunks and (in non-strict
    /// mode) corrupted regions are skipped.
    pub fn next(&mut self) -> Result<Option<RecordReader<'_, R>>, WalError> {
        self.i = self.j;
        loop {
            match self.next_chunk(true)? {
                ChunkOutcome::Chunk => return Ok(Some(RecordReader { r: self })),
                ChunkOutcome::Eof => return Ok(None),
                ChunkOutcome::Skip => continue,
            }
        }
    }

    /// Reads one complete logical record.
    ///
    /// Returns `Ok(None)` at end of log. A record truncated mid-way
    /// (e.g. by a crash) surfaces as a [`CorruptionError`] with reason
    /// [`CorruptionReason::MissingChunkPart`]; the reader stays usable
    /// and resynchronizes on the following call.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>, WalError> {
        self.i = self.j;
        loop {
            match self.next_chunk(true)? {
                ChunkOutcome::Chunk => break,
                ChunkOutcome::Eof => return Ok(None),
                ChunkOutcome::Skip => continue,
            }
        }

        let mut out = Vec::new();
        out.extend_from_slice(&self.buf[self.i..self.j]);
        self.i = self.j;

        while !self.last {
            match self.next_chunk(false)? {
                ChunkOutcome::Chunk => {
                    out.extend_from_slice(&self.buf[self.i..self.j]);
                    self.i = self.j;
                }
                ChunkOutcome::Eof | ChunkOutcome::Skip => {
                    return Err(WalError::Corruption(CorruptionError {
                        bytes: out.len(),
                        reason: CorruptionReason::MissingChunkPart,
                    }));
                }
            }
        }

        Ok(Some(out))
    }

    /// Rebinds the reader to a new source, discarding buffered state.
    pub fn reset(&mut self, r: R, dropper: Option<Box<dyn Dropper>>, options: ReadOptions) {
        self.r = r;
        self.dropper = dropper;
        self.strict = options.strict;
        self.checksum = options.checksum;
        self.i = 0;
        self.j = 0;
        self.n = 0;
        self.last = true;
    }
}

/// Handle for streaming one logical record's payload.
pub struct RecordReader<'a, R: Read> {
    r: &'a mut Reader<R>,
}

impl<R: Read> Read for RecordReader<'_, R> {
    fn read(&mut self, p: &mut [u8]) -> io::Result<usize> {
        let r = &mut self.r;
        while r.i == r.j {
            if r.last {
                return Ok(0);
            }
            match r.next_chunk(false) {
                Ok(ChunkOutcome::Chunk) => {}
                Ok(ChunkOutcome::Eof | ChunkOutcome::Skip) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "record truncated",
                    ));
                }
                Err(WalError::Io(e)) => return Err(e),
                Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
            }
        }

        let n = p.len().min(r.j - r.i);
        p[..n].copy_from_slice(&r.buf[r.i..r.i + n]);
        r.i += n;
        Ok(n)
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Reads until `buf` is full or the source is exhausted.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
