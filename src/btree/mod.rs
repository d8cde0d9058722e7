//! # B-Tree Index
//!
//! A balanced multi-way search tree storing fixed-size key/value records,
//! one node per storage page. The module is split along the same lines as
//! the storage layer:
//!
//! - `node`: typed leaf/interior views over page bytes and the binary
//!   searches
//! - `mapping`: the bounded page-id remapping table
//! - `tree`: the engine (insert, lookup, splits, recycling cooperation,
//!   recovery, structural checking)
//! - `iter`: the range cursor
//!
//! ## Design Constraints
//!
//! The engine targets microcontroller-class devices: a fixed pool of page
//! buffers shared with the store, no allocation after construction (scratch
//! buffers for splits are sized at init), no recursion on tree depth (paths
//! are arrays bounded by [`crate::config::MAX_LEVELS`]), and a single
//! caller (no interior synchronization).

mod iter;
mod mapping;
mod node;
mod tree;

pub use iter::RangeIter;
pub use node::{InteriorNode, InteriorNodeMut, LeafNode, LeafNodeMut, NodeLayout};
pub use tree::{BTreeIndex, TreeCheck};
