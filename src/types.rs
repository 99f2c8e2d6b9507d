//! Typed key/value capabilities and the stored-value tombstone tag.
//!
//! The engine is generic over a user key and value type; everything at
//! and below the block boundary operates on bytes. The [`Key`] and
//! [`Value`] traits supply the serialization in both directions.
//!
//! # Ordering contract
//!
//! SSTables and blocks order keys by their **byte** representation, while
//! the memtable orders them by `Ord`. [`Key::to_bytes`] must therefore be
//! order-preserving: `a < b` ⇔ `a.to_bytes() < b.to_bytes()`
//! lexicographically. The provided implementations (`Vec<u8>`, `String`,
//! big-endian `u64`) all satisfy this.
//!
//! # Tombstone tag
//!
//! Every stored value — in WAL records and SSTable records alike — is
//! prefixed with a one-byte kind tag so that deletions survive flush and
//! compaction:
//!
//! ```text
//! [0x00][value bytes]   live value
//! [0x01]                tombstone (no payload)
//! ```

use crate::encoding::EncodingError;

// ------------------------------------------------------------------------------------------------
// Key / Value capabilities
// ------------------------------------------------------------------------------------------------

/// A user key type: totally ordered, byte-serializable both ways.
pub trait Key: Ord + Clone + std::fmt::Debug + Send + Sync + 'static {
    /// Order-preserving byte serialization.
    fn to_bytes(&self) -> Vec<u8>;

    /// Inverse of [`Key::to_bytes`].
    fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError>;
}

/// A user value type: byte-serializable both ways.
pub trait Value: Clone + std::fmt::Debug + Send + Sync + 'static {
    /// Byte serialization.
    fn to_bytes(&self) -> Vec<u8>;

    /// Inverse of [`Value::to_bytes`].
    fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError>;
}

impl Key for Vec<u8> {
    fn to_bytes(&self) -> Vec<u8> {
        self.clone()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError> {
        Ok(bytes.to_vec())
    }
}

impl Value for Vec<u8> {
    fn to_bytes(&self) -> Vec<u8> {
        self.clone()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError> {
        Ok(bytes.to_vec())
    }
}

impl Key for String {
    fn to_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| EncodingError::Custom(format!("invalid UTF-8 key: {e}")))
    }
}

impl Value for String {
    fn to_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| EncodingError::Custom(format!("invalid UTF-8 value: {e}")))
    }
}

// Big-endian keeps numeric order equal to byte order.
impl Key for u64 {
    fn to_bytes(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| EncodingError::Custom(
            format!("u64 key must be 8 bytes, got {}", bytes.len()),
        ))?;
        Ok(u64::from_be_bytes(raw))
    }
}

impl Value for u64 {
    fn to_bytes(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, EncodingError> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| EncodingError::Custom(
            format!("u64 value must be 8 bytes, got {}", bytes.len()),
        ))?;
        Ok(u64::from_be_bytes(raw))
    }
}

// ------------------------------------------------------------------------------------------------
// Stored-value kind tag
// ------------------------------------------------------------------------------------------------

const KIND_PUT: u8 = 0x00;
const KIND_TOMBSTONE: u8 = 0x01;

/// Wraps live value bytes with the kind tag.
pub(crate) fn tag_live(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 1);
    out.push(KIND_PUT);
    out.extend_from_slice(value);
    out
}

/// The tombstone marker: a kind tag with no payload.
pub(crate) fn tag_tombstone() -> Vec<u8> {
    vec![KIND_TOMBSTONE]
}

/// Splits a tagged stored value into its payload.
///
/// Returns `Ok(None)` for a tombstone, `Ok(Some(payload))` for a live
/// value, and an error for an unknown tag or an empty buffer.
pub(crate) fn untag(stored: &[u8]) -> Result<Option<&[u8]>, EncodingError> {
    match stored.split_first() {
        Some((&KIND_PUT, payload)) => Ok(Some(payload)),
        Some((&KIND_TOMBSTONE, _)) => Ok(None),
        Some((&tag, _)) => Err(EncodingError::Custom(format!(
            "unknown stored value tag 0x{tag:02x}"
        ))),
        None => Err(EncodingError::Custom("empty stored value".into())),
    }
}
