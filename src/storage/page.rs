//! # Page Header Layout
//!
//! Every page on the medium begins with a 16-byte header followed by the
//! node payload. The header is the same for leaf and interior nodes; the
//! node kind is packed into the count field.
//!
//! ## Header Layout (16 bytes)
//!
//! ```text
//! Offset  Size  Field            Description
//! ------  ----  ---------------  ----------------------------------------
//! 0       4     logical_id       Monotonic sequence number stamped on
//!                                every append write
//! 4       4     prev_id          Physical id this page replaces, or
//!                                NO_PAGE if it never moved
//! 8       4     next_id          Physical id of the on-disk successor if
//!                                this page was superseded after the RAM
//!                                mapping table filled up, or NO_PAGE
//! 12      2     count_and_flags  Record count plus node-kind flags
//! 14      1     level            Height above the leaf level (leaf = 0)
//! 15      1     reserved
//! ```
//!
//! ## Count Encoding
//!
//! `count_and_flags` packs three facts into 16 bits:
//!
//! - raw record count = `c mod 10000` (always < 10000)
//! - `c >= 10000` marks an interior node
//! - `c >= 20000` marks the root
//!
//! `set_record_count` writes a raw count and therefore clears both flags;
//! callers re-tag the node afterwards, mirroring how the split and
//! root-creation paths rebuild a page from scratch. `increment_count` bumps
//! the raw count and keeps the flags.
//!
//! Note that the root tag implies the interior tag numerically. A
//! single-level tree therefore has a root page whose `is_interior()` reads
//! true; the engine always decides leaf-versus-interior from the descent
//! level, never from the flag alone.
//!
//! ## Byte Order
//!
//! Fields are host-native integers. Volumes are not portable across
//! endianness; this is a documented limitation of the format.

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::{PageId, NO_PAGE};

/// Size of the persisted page header in bytes.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Byte offset of the `next_id` field, used for in-place chain patches.
pub const NEXT_ID_OFFSET: usize = 8;

/// Raw counts live below this value; everything above is flag space.
pub const COUNT_FLAG_BASE: u16 = 10_000;

const INTERIOR_TAG: u16 = 10_000;
const ROOT_TAG: u16 = 20_000;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageHeader {
    logical_id: u32,
    prev_id: u32,
    next_id: u32,
    count_and_flags: u16,
    level: u8,
    reserved: u8,
}

impl PageHeader {
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );

        Self::ref_from_bytes(&data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );

        Self::mut_from_bytes(&mut data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn logical_id(&self) -> u32 {
        self.logical_id
    }

    pub fn set_logical_id(&mut self, id: u32) {
        self.logical_id = id;
    }

    pub fn prev_id(&self) -> PageId {
        self.prev_id
    }

    pub fn set_prev_id(&mut self, id: PageId) {
        self.prev_id = id;
    }

    pub fn next_id(&self) -> PageId {
        self.next_id
    }

    pub fn set_next_id(&mut self, id: PageId) {
        self.next_id = id;
    }

    pub fn record_count(&self) -> u16 {
        self.count_and_flags % COUNT_FLAG_BASE
    }

    /// Writes a raw record count, clearing the interior and root tags.
    pub fn set_record_count(&mut self, count: u16) {
        debug_assert!(count < COUNT_FLAG_BASE);
        self.count_and_flags = count;
    }

    /// Bumps the raw count without touching the node-kind tags.
    pub fn increment_count(&mut self) {
        self.count_and_flags += 1;
    }

    pub fn is_interior(&self) -> bool {
        self.count_and_flags >= INTERIOR_TAG
    }

    pub fn is_root(&self) -> bool {
        self.count_and_flags >= ROOT_TAG
    }

    pub fn mark_interior(&mut self) {
        debug_assert!(self.count_and_flags < INTERIOR_TAG);
        self.count_and_flags += INTERIOR_TAG;
    }

    pub fn mark_root(&mut self) {
        debug_assert!(self.count_and_flags < ROOT_TAG);
        self.count_and_flags = self.count_and_flags % COUNT_FLAG_BASE + ROOT_TAG;
    }

    /// Height of this node above the leaf level; leaves are 0.
    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn set_level(&mut self, level: u8) {
        self.level = level;
    }

    /// Resets both link fields for a freshly built node.
    pub fn reset_links(&mut self) {
        self.prev_id = NO_PAGE;
        self.next_id = NO_PAGE;
    }
}

/// Quick plausibility check used when scanning raw pages, e.g. during
/// recovery. Erased or never-written regions rarely decode into a header
/// whose raw count, flag range, and level all stay in bounds.
pub fn header_is_plausible(header: &PageHeader, max_records: u16, max_levels: u8) -> bool {
    header.record_count() <= max_records
        && header.count_and_flags < ROOT_TAG + COUNT_FLAG_BASE
        && header.level() < max_levels
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Plain `[u8; N]` locals aren't guaranteed 4-byte aligned on the stack,
    /// but `PageHeader` contains `u32` fields and zerocopy enforces native
    /// alignment when reading through it. Force the alignment here so the
    /// tests exercise the codec instead of incidental stack layout.
    #[repr(align(4))]
    struct AlignedBuf([u8; PAGE_HEADER_SIZE]);

    #[test]
    fn header_size_is_16_bytes() {
        assert_eq!(size_of::<PageHeader>(), PAGE_HEADER_SIZE);
    }

    #[test]
    fn count_codec_round_trips() {
        let mut data = AlignedBuf([0u8; PAGE_HEADER_SIZE]);
        let header = PageHeader::from_bytes_mut(&mut data.0).unwrap();

        header.set_record_count(7);
        assert_eq!(header.record_count(), 7);
        assert!(!header.is_interior());
        assert!(!header.is_root());

        header.mark_interior();
        assert_eq!(header.record_count(), 7);
        assert!(header.is_interior());
        assert!(!header.is_root());
    }

    #[test]
    fn root_tag_implies_interior() {
        let mut data = AlignedBuf([0u8; PAGE_HEADER_SIZE]);
        let header = PageHeader::from_bytes_mut(&mut data.0).unwrap();

        header.set_record_count(3);
        header.mark_root();

        assert_eq!(header.record_count(), 3);
        assert!(header.is_root());
        assert!(header.is_interior());
    }

    #[test]
    fn set_record_count_clears_tags() {
        let mut data = AlignedBuf([0u8; PAGE_HEADER_SIZE]);
        let header = PageHeader::from_bytes_mut(&mut data.0).unwrap();

        header.set_record_count(5);
        header.mark_interior();
        header.set_record_count(6);

        assert!(!header.is_interior());
        assert_eq!(header.record_count(), 6);
    }

    #[test]
    fn increment_preserves_tags() {
        let mut data = AlignedBuf([0u8; PAGE_HEADER_SIZE]);
        let header = PageHeader::from_bytes_mut(&mut data.0).unwrap();

        header.set_record_count(2);
        header.mark_root();
        header.increment_count();

        assert_eq!(header.record_count(), 3);
        assert!(header.is_root());
    }

    #[test]
    fn field_offsets_match_layout() {
        let mut data = AlignedBuf([0u8; PAGE_HEADER_SIZE]);
        {
            let header = PageHeader::from_bytes_mut(&mut data.0).unwrap();
            header.set_logical_id(0x0102_0304);
            header.set_prev_id(0x1112_1314);
            header.set_next_id(0x2122_2324);
            header.set_record_count(9);
            header.set_level(2);
        }

        assert_eq!(
            u32::from_ne_bytes(data.0[0..4].try_into().unwrap()),
            0x0102_0304
        );
        assert_eq!(
            u32::from_ne_bytes(data.0[4..8].try_into().unwrap()),
            0x1112_1314
        );
        assert_eq!(
            u32::from_ne_bytes(data.0[NEXT_ID_OFFSET..NEXT_ID_OFFSET + 4].try_into().unwrap()),
            0x2122_2324
        );
        assert_eq!(u16::from_ne_bytes(data.0[12..14].try_into().unwrap()), 9);
        assert_eq!(data.0[14], 2);
    }

    #[test]
    fn reset_links_uses_sentinel() {
        let mut data = AlignedBuf([0u8; PAGE_HEADER_SIZE]);
        let header = PageHeader::from_bytes_mut(&mut data.0).unwrap();

        header.reset_links();

        assert_eq!(header.prev_id(), NO_PAGE);
        assert_eq!(header.next_id(), NO_PAGE);
    }

    #[test]
    fn plausibility_rejects_wild_counts() {
        let mut data = AlignedBuf([0u8; PAGE_HEADER_SIZE]);
        {
            let header = PageHeader::from_bytes_mut(&mut data.0).unwrap();
            header.set_record_count(31);
            header.mark_root();
            header.set_level(1);
        }
        {
            let header = PageHeader::from_bytes(&data.0).unwrap();
            assert!(header_is_plausible(header, 31, 8));
            assert!(!header_is_plausible(header, 30, 8));
        }

        data.0[12..14].copy_from_slice(&u16::MAX.to_ne_bytes());
        let header = PageHeader::from_bytes(&data.0).unwrap();
        assert!(!header_is_plausible(header, 31, 8));
    }
}
