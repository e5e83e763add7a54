//! # linekv — learned-index key-value storage engine
//!
//! linekv is the storage core of a learned-index key-value store. Fixed
//! 64-bit integer keys map to opaque byte values; on disk, records live in
//! variable-length segments of 1–16 pages whose intra-segment addressing
//! is computed by a per-segment linear model instead of a per-page index.
//!
//! ## Quick Start
//!
//! ```ignore
//! use linekv::{Manager, Options};
//!
//! let records: Vec<(u64, Vec<u8>)> =
//!     (0..10_000).map(|i| (i * 10, i.to_be_bytes().to_vec())).collect();
//! let db = Manager::bulk_load_into_segments("./mydb".as_ref(), &records, Options::default())?;
//!
//! db.put(42, b"hello")?;
//! db.flush_memtable()?;
//! assert_eq!(db.get(42)?, Some(b"hello".to_vec()));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │           Manager (public API)            │
//! ├─────────────────────┬─────────────────────┤
//! │  MemTable (writes)  │  Ordered index      │
//! │  skip map, seq-     │  base key → segment │
//! │  tagged entries     │  (model, location)  │
//! ├─────────────────────┴─────────────────────┤
//! │  SegmentBuilder / PLR model fitting       │
//! ├───────────────────────────────────────────┤
//! │  Buffer manager (fix/unfix, page latches) │
//! ├───────────────────────────────────────────┤
//! │  Segment files / free list / checksums    │
//! └───────────────────────────────────────────┘
//! ```
//!
//! Reads go memtable → index → model-addressed page (→ overflow chain).
//! Writes land in the memtable; a flush drains them into existing pages,
//! growing overflow chains, and saturated chains are reshaped by one of
//! three reorganizations: chain flattening, a sliding-window segment
//! rewrite, or the non-model overflow-chain reorganization.
//!
//! ## Durability
//!
//! New segments are written completely — stamped with a monotone sequence
//! number and per-page CRC32 — before the in-memory index swings over;
//! replaced segments are invalidated by zeroing afterwards. Recovery scans
//! the segment files and adopts the highest sequence number covering each
//! key range, so a crash anywhere in that pipeline resolves to one side or
//! the other, never a mix.
//!
//! ## Module Overview
//!
//! - [`manager`]: the engine itself — reads, flush, rewrites, recovery
//! - [`memtable`]: ordered write buffer with sequence-tagged entries
//! - [`segment_builder`]: streaming piecewise-linear segment construction
//! - [`model`]: the per-segment line and its fitting corridor
//! - [`storage`]: page format, segment files, free list, checksums
//! - [`bufmgr`]: page frames, pin counts and latches
//! - [`pool`]: background workers for parallel page I/O
//! - [`wal`]: the rewrite-logging interface (encoding out of scope)

pub mod bufmgr;
pub mod config;
pub mod error;
pub mod key;
pub mod manager;
pub mod memtable;
pub mod model;
pub mod pool;
pub mod segment_builder;
pub mod storage;
pub mod wal;

pub use config::Options;
pub use error::StorageError;
pub use key::Key;
pub use manager::Manager;
pub use memtable::{EntryKind, MemTable, SequenceNumber};
pub use model::{page_for_key, Line64};
pub use segment_builder::{compute_page_lower_boundaries, Record, Segment, SegmentBuilder};
pub use storage::{SegmentId, SegmentInfo};
