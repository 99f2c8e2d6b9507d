//! Checksums and hash functions backing block integrity and bloom probes.
//!
//! Two distinct concerns live here:
//!
//! - **Integrity** — every WAL chunk and every compressed SSTable block
//!   carries a CRC32-Castagnoli checksum, stored little-endian on disk.
//! - **Membership hashing** — the bloom filter probes with a
//!   LevelDB-style 32-bit hash (see [`hash`] for its tail handling).
//!   A Murmur3-32 variant keyed by the same seed is provided as an
//!   alternative; a filter must use the same function for `add` and
//!   `contains`.

// ------------------------------------------------------------------------------------------------
// CRC32 (Castagnoli)
// ------------------------------------------------------------------------------------------------

/// CRC32-Castagnoli over `data`.
///
/// Used for WAL chunk headers (over `type || payload`) and SSTable block
/// trailers (over the compressed payload).
pub fn crc32(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

// ------------------------------------------------------------------------------------------------
// LevelDB-style hash
// ------------------------------------------------------------------------------------------------

/// Seed shared by both hash functions when probing bloom filters.
pub const BLOOM_SEED: u32 = 0xbc9f1d34;

const HASH_M: u32 = 0xc6a4a793;
const HASH_R: u32 = 24;

/// The LevelDB-style 32-bit hash: seed ⊕ len·M, word-wise accumulate,
/// then the tail.
///
/// Tail handling: a tail of length 3 absorbs bytes 2 and 1, length 2
/// absorbs byte 1, and only a length-1 tail absorbs byte 0 and runs the
/// final multiply-shift. Filters written with this function must be
/// probed with it.
pub fn hash(data: &[u8], seed: u32) -> u32 {
    let mut h = seed ^ (data.len() as u32).wrapping_mul(HASH_M);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        h = h.wrapping_add(w);
        h = h.wrapping_mul(HASH_M);
        h ^= h >> 16;
    }

    let tail = chunks.remainder();
    match tail.len() {
        3 => {
            h = h.wrapping_add(u32::from(tail[2]) << 16);
            h = h.wrapping_add(u32::from(tail[1]) << 8);
        }
        2 => {
            h = h.wrapping_add(u32::from(tail[1]) << 8);
        }
        1 => {
            h = h.wrapping_add(u32::from(tail[0]));
            h = h.wrapping_mul(HASH_M);
            h ^= h >> HASH_R;
        }
        _ => {}
    }

    h
}

// ------------------------------------------------------------------------------------------------
// Murmur3-32
// ------------------------------------------------------------------------------------------------

const MUR_C1: u32 = 0xcc9e2d51;
const MUR_C2: u32 = 0x1b873593;
const MUR_MAGIC1: u32 = 0x85ebca6b;
const MUR_MAGIC2: u32 = 0xc2b2ae35;

/// Murmur3 32-bit hash, the alternative bloom probe function.
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    let mut h = seed;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(MUR_C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(MUR_C2);

        h ^= k;
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe6546b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k: u32 = 0;
        if tail.len() >= 3 {
            k ^= u32::from(tail[2]) << 16;
        }
        if tail.len() >= 2 {
            k ^= u32::from(tail[1]) << 8;
        }
        k ^= u32::from(tail[0]);
        k = k.wrapping_mul(MUR_C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(MUR_C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(MUR_MAGIC1);
    h ^= h >> 13;
    h = h.wrapping_mul(MUR_MAGIC2);
    h ^= h >> 16;

    h
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
