//! Prefix-compressed block codec shared by SSTable data, filter, and
//! index blocks.
//!
//! # On-disk layout
//!
//! ```text
//! plaintext:  [record]...[record][restart_offset u32 LE]...[restart_count u32 LE]
//! record:     [shared_len uvarint][suffix_len uvarint][value_len uvarint]
//!             [key_suffix][value]
//! on disk:    [snappy(plaintext)][crc32c(compressed) u32 LE]
//! ```
//!
//! Every *restart-interval*-th record is written with `shared_len = 0`,
//! producing an independently decodable anchor; the trailer lists the
//! byte offset of each anchor. The reconstructed key of a record is
//! `prev_key[..shared_len] ++ key_suffix`.

use thiserror::Error;

use crate::checksum;
use crate::encoding::{self, ByteReader, EncodingError};

/// Size of the CRC32 trailer appended after the compressed payload.
pub const BLOCK_TRAILER_SIZE: usize = 4;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by block encoding and decoding.
#[derive(Debug, Error)]
pub enum BlockError {
    /// Varint or cursor decoding failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Snappy compression or decompression failure.
    #[error("compression error: {0}")]
    Compression(#[from] snap::Error),

    /// Structurally invalid block contents.
    #[error("corrupt block: {0}")]
    Corrupt(String),
}

// ------------------------------------------------------------------------------------------------
// BlockWriter
// ------------------------------------------------------------------------------------------------

/// Builds one prefix-compressed block.
///
/// The writer is reused: [`BlockWriter::finish`] emits the compressed
/// block (with CRC trailer) and clears all internal state.
#[derive(Debug)]
pub struct BlockWriter {
    records: Vec<u8>,
    trailer: Vec<u8>,
    n: usize,
    prev_key: Vec<u8>,
    restart_interval: usize,
}

impl BlockWriter {
    /// Creates an empty writer with the given restart interval.
    pub fn new(restart_interval: usize) -> Self {
        Self {
            records: Vec::new(),
            trailer: Vec::new(),
            n: 0,
            prev_key: Vec::new(),
            restart_interval: restart_interval.max(1),
        }
    }

    /// Appends one record. Keys must arrive in strictly increasing order.
    pub fn append(&mut self, key: &[u8], value: &[u8]) {
        let shared = if self.n % self.restart_interval == 0 {
            self.trailer
                .extend_from_slice(&(self.records.len() as u32).to_le_bytes());
            0
        } else {
            shared_prefix_len(&self.prev_key, key)
        };

        encoding::put_uvarint(&mut self.records, shared as u64);
        encoding::put_uvarint(&mut self.records, (key.len() - shared) as u64);
        encoding::put_uvarint(&mut self.records, value.len() as u64);
        self.records.extend_from_slice(&key[shared..]);
        self.records.extend_from_slice(value);

        self.prev_key.clear();
        self.prev_key.extend_from_slice(key);
        self.n += 1;
    }

    /// Current plaintext size: record area plus the trailer so far and
    /// its pending count word.
    pub fn size(&self) -> usize {
        self.records.len() + self.trailer.len() + 4
    }

    /// Number of records appended since the last finish.
    pub fn entry_count(&self) -> usize {
        self.n
    }

    /// True when no records have been appended since the last finish.
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Seals the block: appends the restart count, Snappy-compresses the
    /// plaintext, and appends the CRC32 trailer over the compressed bytes.
    ///
    /// Internal state is cleared for the next block.
    pub fn finish(&mut self) -> Result<Vec<u8>, BlockError> {
        let restart_count = (self.trailer.len() / 4) as u32;
        self.trailer.extend_from_slice(&restart_count.to_le_bytes());

        let mut plain = std::mem::take(&mut self.records);
        plain.extend_from_slice(&self.trailer);

        let mut out = snap::raw::Encoder::new().compress_vec(&plain)?;
        let crc = checksum::crc32(&out);
        out.extend_from_slice(&crc.to_le_bytes());

        self.trailer.clear();
        self.prev_key.clear();
        self.n = 0;

        Ok(out)
    }
}

// ------------------------------------------------------------------------------------------------
// Decoding
// ------------------------------------------------------------------------------------------------

/// Splits a decompressed block into its record area and restart offsets.
pub fn decode_block(plain: &[u8]) -> Result<(&[u8], Vec<u32>), BlockError> {
    if plain.len() < 4 {
        return Err(BlockError::Corrupt("block shorter than trailer".into()));
    }

    let n = plain.len();
    let restart_count = encoding::read_u32_le(plain, n - 4)? as usize;

    let trailer_len = restart_count
        .checked_mul(4)
        .and_then(|v| v.checked_add(4))
        .ok_or_else(|| BlockError::Corrupt("restart count overflow".into()))?;
    if trailer_len > n {
        return Err(BlockError::Corrupt(format!(
            "restart trailer ({trailer_len} bytes) exceeds block ({n} bytes)"
        )));
    }

    let records_end = n - trailer_len;
    let mut restarts = Vec::with_capacity(restart_count);
    for i in 0..restart_count {
        let offset = encoding::read_u32_le(plain, records_end + i * 4)?;
        if offset as usize > records_end {
            return Err(BlockError::Corrupt(format!(
                "restart offset {offset} past record area ({records_end} bytes)"
            )));
        }
        restarts.push(offset);
    }

    Ok((&plain[..records_end], restarts))
}

/// Reads one record from the cursor, reconstructing the key from
/// `prev_key` and the stored suffix.
///
/// Returns `Ok(None)` when the cursor is exhausted.
pub fn read_record(
    prev_key: &[u8],
    r: &mut ByteReader<'_>,
) -> Result<Option<(Vec<u8>, Vec<u8>)>, BlockError> {
    if r.is_empty() {
        return Ok(None);
    }

    let shared = r.read_uvarint()? as usize;
    let suffix_len = r.read_uvarint()? as usize;
    let value_len = r.read_uvarint()? as usize;

    if shared > prev_key.len() {
        return Err(BlockError::Corrupt(format!(
            "shared prefix {shared} exceeds previous key length {}",
            prev_key.len()
        )));
    }

    let suffix = r.read_exact(suffix_len)?;
    let value = r.read_exact(value_len)?;

    let mut key = Vec::with_capacity(shared + suffix_len);
    key.extend_from_slice(&prev_key[..shared]);
    key.extend_from_slice(suffix);

    Ok(Some((key, value.to_vec())))
}

// ------------------------------------------------------------------------------------------------
// Key separators
// ------------------------------------------------------------------------------------------------

/// Length of the longest common prefix of `a` and `b`.
pub fn shared_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Computes a short separator `s` with `a ≤ s < b`, used as the index key
/// delimiting the block ending at `a` from the block starting at `b`.
///
/// With an empty `a` (no previous block), returns `b` with its final byte
/// decremented. When the shared prefix covers none or all of `a`, `a`
/// itself is the separator.
pub fn get_separator(a: &[u8], b: &[u8]) -> Vec<u8> {
    if a.is_empty() {
        let mut sep = b.to_vec();
        if let Some(last) = sep.last_mut() {
            *last = last.wrapping_sub(1);
        }
        return sep;
    }

    let n = shared_prefix_len(a, b);
    if n == 0 || n == a.len() {
        return a.to_vec();
    }

    let mut sep = a[..n].to_vec();
    sep.push(a[n].wrapping_add(1));
    sep
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn decompress(block: &[u8]) -> Vec<u8> {
        let (payload, crc_bytes) = block.split_at(block.len() - BLOCK_TRAILER_SIZE);
        let crc = u32::from_le_bytes(crc_bytes.try_into().unwrap());
        assert_eq!(crc, checksum::crc32(payload), "block CRC mismatch");
        snap::raw::Decoder::new().decompress_vec(payload).unwrap()
    }

    fn collect_records(plain: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let (records, _) = decode_block(plain).unwrap();
        let mut r = ByteReader::new(records);
        let mut prev = Vec::new();
        let mut out = Vec::new();
        while let Some((key, value)) = read_record(&prev, &mut r).unwrap() {
            prev = key.clone();
            out.push((key, value));
        }
        out
    }

    #[test]
    fn round_trip_including_restart_boundaries() {
        let mut w = BlockWriter::new(4);
        let input: Vec<(Vec<u8>, Vec<u8>)> = (0..37)
            .map(|i| {
                (
                    format!("user_{i:04}").into_bytes(),
                    format!("value-{i}").into_bytes(),
                )
            })
            .collect();
        for (k, v) in &input {
            w.append(k, v);
        }

        let block = w.finish().unwrap();
        let plain = decompress(&block);
        assert_eq!(collect_records(&plain), input);

        // Restart points: one per 4 records.
        let (_, restarts) = decode_block(&plain).unwrap();
        assert_eq!(restarts.len(), 37usize.div_ceil(4));
        assert_eq!(restarts[0], 0);
    }

    #[test]
    fn restart_records_are_standalone() {
        let mut w = BlockWriter::new(2);
        w.append(b"shared_aaa", b"1");
        w.append(b"shared_aab", b"2");
        w.append(b"shared_aac", b"3"); // restart: no prefix sharing

        let plain = decompress(&w.finish().unwrap());
        let (records, restarts) = decode_block(&plain).unwrap();
        assert_eq!(restarts.len(), 2);

        // Decoding from the second restart with no previous key works.
        let mut r = ByteReader::new(&records[restarts[1] as usize..]);
        let (key, value) = read_record(&[], &mut r).unwrap().unwrap();
        assert_eq!(key, b"shared_aac");
        assert_eq!(value, b"3");
    }

    #[test]
    fn writer_resets_after_finish() {
        let mut w = BlockWriter::new(16);
        w.append(b"a", b"1");
        let _ = w.finish().unwrap();

        assert!(w.is_empty());
        w.append(b"b", b"2");
        let plain = decompress(&w.finish().unwrap());
        let records = collect_records(&plain);
        assert_eq!(records, vec![(b"b".to_vec(), b"2".to_vec())]);
    }

    #[test]
    fn decode_rejects_bogus_trailer() {
        assert!(decode_block(&[0, 0]).is_err());

        // Restart count claims more entries than the block can hold.
        let mut plain = vec![0u8; 8];
        plain[4..8].copy_from_slice(&100u32.to_le_bytes());
        assert!(decode_block(&plain).is_err());
    }

    #[test]
    fn read_record_rejects_bad_shared_prefix() {
        let mut buf = Vec::new();
        encoding::put_uvarint(&mut buf, 5); // shared = 5 but prev key is empty
        encoding::put_uvarint(&mut buf, 1);
        encoding::put_uvarint(&mut buf, 0);
        buf.push(b'x');

        let mut r = ByteReader::new(&buf);
        assert!(read_record(&[], &mut r).is_err());
    }

    #[test]
    fn separator_shapes() {
        // Empty previous key: next key with final byte decremented.
        assert_eq!(get_separator(b"", b"key1"), b"key0".to_vec());
        // Partial shared prefix: prefix plus incremented divergence byte.
        assert_eq!(get_separator(b"abcd", b"abzz"), b"abd".to_vec());
        // No shared prefix: previous key unchanged.
        assert_eq!(get_separator(b"abc", b"xyz"), b"abc".to_vec());
        // Previous key is a prefix of the next: unchanged.
        assert_eq!(get_separator(b"abc", b"abcdef"), b"abc".to_vec());
    }

    #[test]
    fn separator_orders_between_blocks() {
        let a = b"user_1299";
        let b = b"user_1300";
        let sep = get_separator(a, b);
        assert!(sep.as_slice() >= a.as_slice());
        assert!(sep.as_slice() < b.as_slice());
    }

    #[test]
    fn separator_wraps_extreme_bytes_without_panicking() {
        // 0xFF at the divergence byte wraps around instead of
        // overflowing.
        assert_eq!(get_separator(&[1, 0xFF, 5], &[1, 0x00]), vec![1, 0x00]);
        // A trailing 0x00 wraps the other way in the empty-prefix case.
        assert_eq!(get_separator(b"", &[0x00]), vec![0xFF]);
    }
}
