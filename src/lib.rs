//! # StrataDB
//!
//! An embeddable, persistent key-value storage engine built on a
//! **leveled Log-Structured Merge Tree (LSM-tree)**. Designed for fast
//! writes and crash-safe operation.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                       Engine                           │
//! │  ┌────────────┐   ┌──────────────┐   ┌─────────────┐   │
//! │  │  Active    │   │   Frozen     │   │  SSTables   │   │
//! │  │  Memtable  │   │  Memtables   │   │  (levels    │   │
//! │  │  + WAL     │   │  (queue)     │   │   0..N)     │   │
//! │  └─────┬──────┘   └──────┬───────┘   └──────┬──────┘   │
//! │        │  freeze         │  flush           │          │
//! │        └────────►        └────────►         │          │
//! │                                             │          │
//! │  ┌──────────────────────────────────────────┘          │
//! │  │  Compaction (dispatcher / level-0 / level-N loops)  │
//! │  └─────────────────────────────────────────────────────┘
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`engine`] | Public surface — open, put, get, delete, flush, close |
//! | [`memtable`] | Ordered in-memory write buffer with WAL-first writes |
//! | [`wal`] | 32 KiB-block chunked write-ahead log codec |
//! | [`sstable`] | Immutable on-disk tables: writer, mmap reader, level nodes |
//! | [`lsm`] | Level array, flush, k-way merge compaction, scheduling |
//! | [`block`] | Prefix-compressed block codec with restart points |
//! | [`filter`] | Per-block bloom filters with a bit-exact layout |
//! | [`checksum`] | CRC32-Castagnoli and bloom hash functions |
//! | [`encoding`] | Crate-owned varint / fixed-int wire helpers |
//! | [`config`] | Explicit configuration, no global state |
//! | [`types`] | `Key` / `Value` serialization capabilities |
//!
//! ## Key Features
//!
//! - **Write-ahead logging** — every mutation is persisted to a chunked,
//!   CRC-protected WAL before it is applied in memory; crash recovery
//!   replays the WAL directory on open.
//! - **Leveled compaction** — level 0 collects flushed memtables;
//!   background loops merge overlapping tables downward, newest version
//!   winning per key.
//! - **Bloom-gated point lookups** — each data block carries a bloom
//!   filter consulted before the block is read and decoded.
//! - **Prefix-compressed, Snappy-encoded blocks** — with restart points
//!   for random access and a CRC32-Castagnoli trailer per block.
//! - **Tombstone durability** — deletions are tagged values that survive
//!   flush and compaction, shadowing older versions of the key.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stratadb::{Config, Engine};
//!
//! let config = Config::new("/tmp/my_db");
//! let engine: Engine<String, String> = Engine::open(config).unwrap();
//!
//! engine.put("hello".into(), "world".into()).unwrap();
//! assert_eq!(engine.get(&"hello".into()).unwrap(), Some("world".into()));
//!
//! engine.delete("hello".into()).unwrap();
//! assert_eq!(engine.get(&"hello".into()).unwrap(), None);
//!
//! engine.close().unwrap();
//! ```

pub mod block;
pub mod checksum;
pub mod config;
pub mod encoding;
pub mod engine;
pub mod filter;
pub mod lsm;
pub mod memtable;
pub mod sstable;
pub mod types;
pub mod wal;

pub use config::{Config, ConfigError};
pub use engine::{Engine, EngineError, EngineStats};
pub use lsm::LsmError;
pub use memtable::{MemTableError, MemTableGet};
pub use sstable::SstError;
pub use types::{Key, Value};
pub use wal::WalError;
