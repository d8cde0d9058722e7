//! # flintdb — Embedded B-Tree Index for Flash-Backed Storage
//!
//! flintdb is an embedded B-tree index that stores fixed-size key/value
//! records on a block-addressable backing store using only a tiny, fixed
//! pool of in-memory page buffers. The design target is a
//! microcontroller-class device: no allocation after initialization, no
//! recursion on tree depth, and a RAM footprint of under ~1.5 KB with
//! 512-byte pages and two buffers.
//!
//! ## Quick Start
//!
//! ```ignore
//! use flintdb::{BTreeIndex, FileMedium, IndexConfig, PageStore};
//!
//! let config = IndexConfig::new(4 * 1024 * 1024);
//! let medium = FileMedium::create("index.bin", config.end_addr)?;
//! let store = PageStore::new(Box::new(medium), &config)?;
//! let mut index = BTreeIndex::create(store, &config)?;
//!
//! index.put(&7u32.to_le_bytes(), b"hello flash!")?;
//!
//! let mut value = [0u8; 12];
//! if index.get(&7u32.to_le_bytes(), &mut value)? {
//!     // value now holds the record
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │        B-Tree Engine (btree)         │
//! │  descent · splits · mapping table    │
//! │  active path · range cursor          │
//! ├───────────────┬──────────────────────┤
//! │ RecycleHooks  │   reads / appends    │
//! ├───────────────┴──────────────────────┤
//! │        Page Store (storage)          │
//! │  buffer pool · write head ·          │
//! │  erase-block ring · statistics       │
//! ├──────────────────────────────────────┤
//! │   Medium (mmap file / raw flash)     │
//! └──────────────────────────────────────┘
//! ```
//!
//! The store is log-structured: updating a node appends a fresh copy and
//! the engine reconciles the parent's stale pointer through an in-RAM
//! remapping table (demoted to on-disk `next_id` chains when it fills).
//! When the write head wraps around the medium, the store calls back into
//! the engine to relocate still-live pages out of the block it is about to
//! erase. Those two mechanisms — lazy pointer fix-up and cooperative block
//! recycling — are the heart of the crate.
//!
//! ## What flintdb Is Not
//!
//! Single writer, single reader, one thread. No deletes, no variable-size
//! records, no transactions, no crash consistency beyond scanning for the
//! newest root on [`BTreeIndex::recover`]. Page fields are host-native
//! byte order, so volumes are not portable across endianness.

pub mod btree;
pub mod config;
pub mod storage;

pub use btree::{BTreeIndex, RangeIter, TreeCheck};
pub use config::{compare_unsigned, IndexConfig, KeyCompare, MAX_LEVELS};
pub use storage::{
    FileMedium, Medium, PageId, PageStore, StoreStats, NO_PAGE, PAGE_HEADER_SIZE,
};
