//! # Index Configuration
//!
//! This module centralizes the tunable parameters of a flintdb index and the
//! geometry derived from them. Values that depend on each other are computed
//! in one place so the page store and the tree engine can never disagree.
//!
//! ## Parameter Relationships
//!
//! ```text
//! page_size (512)
//!       │
//!       ├─> max_leaf_records     = (page_size - 16) / (key_size + data_size)
//!       │
//!       └─> max_interior_fanout  = (page_size - 16 - 4) / (key_size + 4)
//!             Interior nodes store F keys followed by F+1 child page ids,
//!             so one extra 4-byte id is reserved beyond the key slots.
//!
//! start_addr / end_addr
//!       │
//!       └─> num_data_pages = (end_addr - start_addr) / page_size
//!             Must be a whole number of erase blocks; the store's ring
//!             arithmetic assumes block-aligned media.
//!
//! num_buffers (>= 2)
//!       Slot 0 is the engine's scratch buffer, slot 1 is reserved for the
//!       root when three or more slots exist. See `storage::store` for the
//!       full replacement policy.
//! ```
//!
//! ## Key Comparison
//!
//! Keys are opaque fixed-size byte strings ordered by a caller-supplied
//! comparator. The default interprets the key as a little-endian unsigned
//! integer of `key_size` bytes, which matches `u32::to_le_bytes` keys in the
//! tests and benchmarks.

use core::cmp::Ordering;

use eyre::{ensure, Result};

use crate::storage::PAGE_HEADER_SIZE;

/// Maximum tree depth. A fixed bound lets the engine keep its root-to-leaf
/// paths in plain arrays instead of recursing on tree height.
pub const MAX_LEVELS: usize = 8;

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 512;

/// Default number of in-memory page buffers.
pub const DEFAULT_NUM_BUFFERS: usize = 3;

/// Default key size in bytes.
pub const DEFAULT_KEY_SIZE: usize = 4;

/// Default value size in bytes.
pub const DEFAULT_DATA_SIZE: usize = 12;

/// Default capacity of the in-memory page-id remapping table.
pub const DEFAULT_MAPPING_CAPACITY: usize = 64;

/// Ordering callback for two keys of equal, configured size.
pub type KeyCompare = fn(&[u8], &[u8]) -> Ordering;

/// Compares two keys as little-endian unsigned integers.
///
/// The most significant byte is the last one, so the comparison walks the
/// slices back to front.
pub fn compare_unsigned(a: &[u8], b: &[u8]) -> Ordering {
    debug_assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().rev().zip(b.iter().rev()) {
        match x.cmp(y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Configuration for a flintdb index and its backing page store.
#[derive(Clone)]
pub struct IndexConfig {
    /// Bytes per page; every other size is derived from this.
    pub page_size: usize,
    /// Number of in-RAM page buffers (>= 2).
    pub num_buffers: usize,
    /// Key size K in bytes.
    pub key_size: usize,
    /// Value size V in bytes.
    pub data_size: usize,
    /// Maximum entries in the RAM page-id remapping table.
    pub mapping_capacity: usize,
    /// Pages per erase block; 1 on media without erase blocks.
    pub erase_block_pages: u32,
    /// First byte of the index region on the medium.
    pub start_addr: u64,
    /// One past the last byte of the index region on the medium.
    pub end_addr: u64,
    /// Key ordering callback.
    pub compare: KeyCompare,
}

impl IndexConfig {
    /// Creates a configuration covering `[0, end_addr)` of the medium with
    /// default sizes and the unsigned comparator.
    pub fn new(end_addr: u64) -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            num_buffers: DEFAULT_NUM_BUFFERS,
            key_size: DEFAULT_KEY_SIZE,
            data_size: DEFAULT_DATA_SIZE,
            mapping_capacity: DEFAULT_MAPPING_CAPACITY,
            erase_block_pages: 1,
            start_addr: 0,
            end_addr,
            compare: compare_unsigned,
        }
    }

    /// Size of one record in bytes.
    pub fn record_size(&self) -> usize {
        self.key_size + self.data_size
    }

    /// Maximum records per leaf page.
    pub fn max_leaf_records(&self) -> usize {
        (self.page_size - PAGE_HEADER_SIZE) / self.record_size()
    }

    /// Maximum keys per interior page. An interior page with `n` keys holds
    /// `n + 1` child pointers, so one id beyond the key slots is reserved.
    pub fn max_interior_fanout(&self) -> usize {
        (self.page_size - PAGE_HEADER_SIZE - 4) / (self.key_size + 4)
    }

    /// Number of pages in the index region.
    pub fn num_data_pages(&self) -> u32 {
        ((self.end_addr - self.start_addr) / self.page_size as u64) as u32
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.page_size > PAGE_HEADER_SIZE,
            "page size {} does not fit the {}-byte page header",
            self.page_size,
            PAGE_HEADER_SIZE
        );
        ensure!(self.num_buffers >= 2, "at least 2 page buffers required");
        ensure!(
            self.key_size >= 1 && self.key_size <= 255,
            "key size {} out of range 1..=255",
            self.key_size
        );
        ensure!(
            self.data_size >= 1 && self.data_size <= 255,
            "data size {} out of range 1..=255",
            self.data_size
        );
        ensure!(self.mapping_capacity >= 1, "mapping capacity must be >= 1");
        ensure!(self.erase_block_pages >= 1, "erase block must be >= 1 page");
        ensure!(
            self.end_addr > self.start_addr,
            "end address {:#x} not beyond start address {:#x}",
            self.end_addr,
            self.start_addr
        );
        ensure!(
            (self.end_addr - self.start_addr) % self.page_size as u64 == 0,
            "index region of {} bytes is not a whole number of {}-byte pages",
            self.end_addr - self.start_addr,
            self.page_size
        );
        ensure!(
            self.max_leaf_records() >= 2,
            "page size {} holds fewer than 2 records of {} bytes",
            self.page_size,
            self.record_size()
        );
        ensure!(
            self.max_leaf_records() < 10_000 && self.max_interior_fanout() < 10_000,
            "per-page record counts must stay below the 10000 flag range"
        );
        ensure!(
            self.max_interior_fanout() >= 2,
            "page size {} holds fewer than 2 separators of {} bytes",
            self.page_size,
            self.key_size + 4
        );
        let pages = self.num_data_pages();
        ensure!(
            pages % self.erase_block_pages == 0,
            "{} data pages is not a whole number of {}-page erase blocks",
            pages,
            self.erase_block_pages
        );
        ensure!(
            pages >= 3 * self.erase_block_pages,
            "medium must span at least 3 erase blocks, got {} pages",
            pages
        );
        Ok(())
    }
}

impl core::fmt::Debug for IndexConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IndexConfig")
            .field("page_size", &self.page_size)
            .field("num_buffers", &self.num_buffers)
            .field("key_size", &self.key_size)
            .field("data_size", &self.data_size)
            .field("mapping_capacity", &self.mapping_capacity)
            .field("erase_block_pages", &self.erase_block_pages)
            .field("start_addr", &self.start_addr)
            .field("end_addr", &self.end_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_geometry_for_default_pages() {
        let config = IndexConfig::new(512 * 1024);

        assert_eq!(config.record_size(), 16);
        assert_eq!(config.max_leaf_records(), 31);
        assert_eq!(config.max_interior_fanout(), 61);
        assert_eq!(config.num_data_pages(), 1024);
    }

    #[test]
    fn validate_accepts_defaults() {
        let config = IndexConfig::new(512 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_single_buffer() {
        let mut config = IndexConfig::new(512 * 1024);
        config.num_buffers = 1;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("2 page buffers"));
    }

    #[test]
    fn validate_rejects_unaligned_region() {
        let mut config = IndexConfig::new(512 * 1024 + 100);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("whole number"));

        config.end_addr = 512 * 1024;
        config.erase_block_pages = 7;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("erase block"));
    }

    #[test]
    fn compare_unsigned_orders_le_integers() {
        let a = 5u32.to_le_bytes();
        let b = 300u32.to_le_bytes();

        assert_eq!(compare_unsigned(&a, &b), Ordering::Less);
        assert_eq!(compare_unsigned(&b, &a), Ordering::Greater);
        assert_eq!(compare_unsigned(&a, &a), Ordering::Equal);
    }

    #[test]
    fn compare_unsigned_uses_high_bytes_first() {
        // 0x0100 > 0x00ff even though the first byte is smaller
        let a = [0x00, 0x01];
        let b = [0xff, 0x00];

        assert_eq!(compare_unsigned(&a, &b), Ordering::Greater);
    }
}
