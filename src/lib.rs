//! # tupleheap - In-Memory Tuple Storage Core
//!
//! tupleheap is the physical tuple layer of a row-oriented OLTP table:
//! fixed-size blocks of uniform tuple slots, O(1) free-slot allocation,
//! density-bucketed block indexing, and online compaction that packs
//! sparse blocks into dense ones without disturbing snapshot readers.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tupleheap::{ColumnSpec, Schema, Table, Value, ValueType};
//!
//! let mut table = Table::new(128 * 1024);
//! let schema = Arc::new(Schema::new(vec![
//!     ColumnSpec::fixed(ValueType::BigInt, false),
//!     ColumnSpec::varchar(64, true),
//! ]));
//! table.initialize(schema, vec!["id".into(), "name".into()])?;
//!
//! let addr = table.insert(&[Value::BigInt(1), Value::varchar("alice")])?;
//! table.free_slot(addr)?;
//! table.forced_compaction();
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Table (allocation,           │
//! │     compaction, scans, wire format)     │
//! ├──────────────────┬──────────────────────┤
//! │  Density Buckets │  Snapshot Partitions │
//! ├──────────────────┴──────────────────────┤
//! │       Block (slots, free list,          │
//! │         relocation fence, merge)        │
//! ├─────────────────────────────────────────┤
//! │   Tuple Views (status byte + payload)   │
//! ├────────────────────┬────────────────────┤
//! │  Schema / Types    │   String Pool      │
//! └────────────────────┴────────────────────┘
//! ```
//!
//! ## Design Points
//!
//! - **Slot identity**: a tuple's address (block id, slot index) is
//!   stable until the tuple is freed or compaction relocates it, in which
//!   case the owning table's `IndexObserver` hears about every move.
//! - **Two snapshot partitions**: blocks pending a snapshot and blocks
//!   not pending one are bucketed and compacted independently, so a tuple
//!   never migrates across the snapshot boundary.
//! - **Pinned blocks**: a scan removes its current block from every
//!   bucket and partition set; compaction cannot see it until release.
//! - **Shared string pool**: variable-length payloads live out-of-line
//!   behind 8-byte handles; each table accounts its own charge.
//! - **Single-writer discipline**: the core is not internally
//!   synchronized; the engine serializes mutators per table.
//!
//! ## Module Overview
//!
//! - [`table`]: table core, compaction, scans, wire serialization
//! - [`block`]: slot blocks, density buckets, merge
//! - [`tuple`]: status flags and typed slot views
//! - [`schema`]: immutable column layout
//! - [`pool`]: shared out-of-line string storage
//! - [`encoding`]: big-endian wire codec
//! - [`types`]: column types and runtime values
//! - [`error`]: recoverable error classification

pub mod block;
pub mod encoding;
pub mod error;
pub mod pool;
pub mod schema;
pub mod table;
pub mod tuple;
pub mod types;

pub use block::{BlockAllocation, BlockId, Partition, PartitionState, SlotAddr};
pub use error::{ErrorKind, TableError};
pub use pool::{StringPool, StringRef};
pub use schema::{ColumnSpec, Schema};
pub use table::{
    CompactionStats, IndexObserver, NullIndexObserver, Table, TableConfig, TableIterator,
    DEFAULT_ALLOCATION_TARGET, DEFAULT_NUM_BUCKETS,
};
pub use tuple::{status, TupleMut, TupleRef, TUPLE_HEADER_SIZE};
pub use types::{Value, ValueType};
