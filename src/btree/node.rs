//! # Node Views
//!
//! Nodes are typed views over a page-sized byte slice. The views do the
//! bounds-checked arithmetic once so the tree engine never touches raw
//! offsets, and they return plain byte slices for keys and values so the
//! engine stays agnostic of key contents.
//!
//! ## Leaf Layout
//!
//! ```text
//! +---------------------+
//! | Page header (16 B)  |
//! +---------------------+
//! | record 0            |  key (K bytes) | value (V bytes)
//! | record 1            |
//! | ...                 |  count records, sorted ascending by key
//! +---------------------+
//! ```
//!
//! ## Interior Layout
//!
//! ```text
//! +---------------------+
//! | Page header (16 B)  |
//! +---------------------+
//! | keys: K * F bytes   |  n keys used, slots beyond n undefined
//! +---------------------+
//! | children: 4*(F+1) B |  n + 1 child page ids used
//! +---------------------+
//! ```
//!
//! A node holding keys `k1..kn` and children `c0..cn` routes a lookup for
//! `key` to the child `i` with `k_i <= key < k_(i+1)`, ties breaking toward
//! the rightmost child that can hold the key. This matches the split rule:
//! the promoted separator is the smallest key of the right half, and leaf
//! splits keep the separator record in the right half.
//!
//! ## Kind Is Decided by the Caller
//!
//! The views deliberately do not check the interior/root tags: a
//! single-level tree has a root page that is flag-tagged as root (and
//! therefore numerically as interior) yet holds leaf records. The engine
//! picks the view from its descent level.

use core::cmp::Ordering;

use eyre::{ensure, Result};

use crate::config::{IndexConfig, KeyCompare};
use crate::storage::{PageHeader, PageId, PAGE_HEADER_SIZE};

/// Precomputed byte geometry shared by every node of one index.
#[derive(Debug, Clone, Copy)]
pub struct NodeLayout {
    pub page_size: usize,
    pub key_size: usize,
    pub data_size: usize,
    pub record_size: usize,
    pub max_leaf_records: u16,
    pub max_interior_fanout: u16,
}

impl NodeLayout {
    pub fn from_config(config: &IndexConfig) -> Self {
        Self {
            page_size: config.page_size,
            key_size: config.key_size,
            data_size: config.data_size,
            record_size: config.record_size(),
            max_leaf_records: config.max_leaf_records() as u16,
            max_interior_fanout: config.max_interior_fanout() as u16,
        }
    }

    #[inline]
    pub fn record_offset(&self, index: usize) -> usize {
        PAGE_HEADER_SIZE + index * self.record_size
    }

    #[inline]
    pub fn key_offset(&self, index: usize) -> usize {
        PAGE_HEADER_SIZE + index * self.key_size
    }

    #[inline]
    pub fn child_offset(&self, index: usize) -> usize {
        PAGE_HEADER_SIZE + self.max_interior_fanout as usize * self.key_size + index * 4
    }
}

/// Read-only view of a leaf page.
pub struct LeafNode<'a> {
    data: &'a [u8],
    layout: &'a NodeLayout,
}

impl<'a> LeafNode<'a> {
    pub fn new(data: &'a [u8], layout: &'a NodeLayout) -> Result<Self> {
        ensure!(
            data.len() == layout.page_size,
            "invalid page size: {} != {}",
            data.len(),
            layout.page_size
        );
        Ok(Self { data, layout })
    }

    pub fn record_count(&self) -> u16 {
        PageHeader::from_bytes(self.data).unwrap().record_count()
    }

    pub fn key_at(&self, index: usize) -> &'a [u8] {
        let off = self.layout.record_offset(index);
        &self.data[off..off + self.layout.key_size]
    }

    pub fn value_at(&self, index: usize) -> &'a [u8] {
        let off = self.layout.record_offset(index) + self.layout.key_size;
        &self.data[off..off + self.layout.data_size]
    }

    /// Exact-match binary search; `None` when the key is absent.
    pub fn find_exact(&self, key: &[u8], compare: KeyCompare) -> Option<usize> {
        let mut first = 0i32;
        let mut last = self.record_count() as i32 - 1;

        while first <= last {
            let middle = (first + last) / 2;
            match compare(self.key_at(middle as usize), key) {
                Ordering::Less => first = middle + 1,
                Ordering::Equal => return Some(middle as usize),
                Ordering::Greater => last = middle - 1,
            }
        }
        None
    }

    /// Index of the last record with key `<= key`; `None` when every record
    /// is greater.
    pub fn find_floor(&self, key: &[u8], compare: KeyCompare) -> Option<usize> {
        let mut first = 0i32;
        let mut last = self.record_count() as i32 - 1;

        while first <= last {
            let middle = (first + last) / 2;
            match compare(self.key_at(middle as usize), key) {
                Ordering::Less => first = middle + 1,
                Ordering::Equal => return Some(middle as usize),
                Ordering::Greater => last = middle - 1,
            }
        }
        if last < 0 {
            None
        } else {
            Some(last as usize)
        }
    }
}

/// Mutable view of a leaf page.
pub struct LeafNodeMut<'a> {
    data: &'a mut [u8],
    layout: &'a NodeLayout,
}

impl<'a> LeafNodeMut<'a> {
    pub fn new(data: &'a mut [u8], layout: &'a NodeLayout) -> Result<Self> {
        ensure!(
            data.len() == layout.page_size,
            "invalid page size: {} != {}",
            data.len(),
            layout.page_size
        );
        Ok(Self { data, layout })
    }

    pub fn record_count(&self) -> u16 {
        PageHeader::from_bytes(self.data).unwrap().record_count()
    }

    pub fn key_at(&self, index: usize) -> &[u8] {
        let off = self.layout.record_offset(index);
        &self.data[off..off + self.layout.key_size]
    }

    pub fn write_record(&mut self, index: usize, key: &[u8], value: &[u8]) {
        let off = self.layout.record_offset(index);
        self.data[off..off + self.layout.key_size].copy_from_slice(key);
        self.data[off + self.layout.key_size..off + self.layout.record_size]
            .copy_from_slice(value);
    }

    pub fn write_value(&mut self, index: usize, value: &[u8]) {
        let off = self.layout.record_offset(index) + self.layout.key_size;
        self.data[off..off + self.layout.data_size].copy_from_slice(value);
    }

    /// Writes a whole record (key and value contiguous) at `index`.
    pub fn write_record_raw(&mut self, index: usize, record: &[u8]) {
        let off = self.layout.record_offset(index);
        self.data[off..off + self.layout.record_size].copy_from_slice(record);
    }

    pub fn read_record_into(&self, index: usize, out: &mut [u8]) {
        let off = self.layout.record_offset(index);
        out.copy_from_slice(&self.data[off..off + self.layout.record_size]);
    }

    /// Moves records `[src_start, src_end)` to start at `dst_start`.
    /// Ranges may overlap.
    pub fn copy_record_range(&mut self, src_start: usize, src_end: usize, dst_start: usize) {
        let src = self.layout.record_offset(src_start)..self.layout.record_offset(src_end);
        let dst = self.layout.record_offset(dst_start);
        self.data.copy_within(src, dst);
    }

    /// Shifts the tail open and writes a record at `index`, bumping the
    /// count. The caller guarantees room and sorted placement.
    pub fn insert_record_at(&mut self, index: usize, key: &[u8], value: &[u8]) {
        let count = self.record_count() as usize;
        if index < count {
            self.copy_record_range(index, count, index + 1);
        }
        self.write_record(index, key, value);
        PageHeader::from_bytes_mut(self.data).unwrap().increment_count();
    }
}

/// Read-only view of an interior page.
pub struct InteriorNode<'a> {
    data: &'a [u8],
    layout: &'a NodeLayout,
}

impl<'a> InteriorNode<'a> {
    pub fn new(data: &'a [u8], layout: &'a NodeLayout) -> Result<Self> {
        ensure!(
            data.len() == layout.page_size,
            "invalid page size: {} != {}",
            data.len(),
            layout.page_size
        );
        Ok(Self { data, layout })
    }

    pub fn key_count(&self) -> u16 {
        PageHeader::from_bytes(self.data).unwrap().record_count()
    }

    pub fn key_at(&self, index: usize) -> &'a [u8] {
        let off = self.layout.key_offset(index);
        &self.data[off..off + self.layout.key_size]
    }

    pub fn child_at(&self, index: usize) -> PageId {
        let off = self.layout.child_offset(index);
        PageId::from_ne_bytes(self.data[off..off + 4].try_into().unwrap())
    }

    /// Child slot to follow for `key`: the slot `i` such that keys in child
    /// `i` are `<= key` and keys in child `i + 1` are greater, ties breaking
    /// to the rightmost child holding the key.
    pub fn find_child(&self, key: &[u8], compare: KeyCompare) -> usize {
        let count = self.key_count() as usize;
        if count == 0 {
            return 0;
        }
        if count == 1 {
            return if compare(key, self.key_at(0)) == Ordering::Less {
                0
            } else {
                1
            };
        }

        let mut first = 0usize;
        let mut last = count.min(self.layout.max_interior_fanout as usize);
        let mut middle = (first + last) / 2;
        while first < last {
            match compare(key, self.key_at(middle)) {
                Ordering::Greater => first = middle + 1,
                Ordering::Equal => {
                    // Equal keys route to the child just after the separator.
                    last = middle + 1;
                    break;
                }
                Ordering::Less => last = middle,
            }
            middle = (first + last) / 2;
        }
        last
    }
}

/// Mutable view of an interior page.
pub struct InteriorNodeMut<'a> {
    data: &'a mut [u8],
    layout: &'a NodeLayout,
}

impl<'a> InteriorNodeMut<'a> {
    pub fn new(data: &'a mut [u8], layout: &'a NodeLayout) -> Result<Self> {
        ensure!(
            data.len() == layout.page_size,
            "invalid page size: {} != {}",
            data.len(),
            layout.page_size
        );
        Ok(Self { data, layout })
    }

    pub fn key_count(&self) -> u16 {
        PageHeader::from_bytes(self.data).unwrap().record_count()
    }

    pub fn key_at(&self, index: usize) -> &[u8] {
        let off = self.layout.key_offset(index);
        &self.data[off..off + self.layout.key_size]
    }

    pub fn child_at(&self, index: usize) -> PageId {
        let off = self.layout.child_offset(index);
        PageId::from_ne_bytes(self.data[off..off + 4].try_into().unwrap())
    }

    pub fn set_key(&mut self, index: usize, key: &[u8]) {
        let off = self.layout.key_offset(index);
        self.data[off..off + self.layout.key_size].copy_from_slice(key);
    }

    pub fn set_child(&mut self, index: usize, child: PageId) {
        let off = self.layout.child_offset(index);
        self.data[off..off + 4].copy_from_slice(&child.to_ne_bytes());
    }

    /// Moves keys `[src_start, src_end)` to start at `dst_start`.
    pub fn copy_key_range(&mut self, src_start: usize, src_end: usize, dst_start: usize) {
        let src = self.layout.key_offset(src_start)..self.layout.key_offset(src_end);
        let dst = self.layout.key_offset(dst_start);
        self.data.copy_within(src, dst);
    }

    /// Moves child ids `[src_start, src_end)` to start at `dst_start`.
    pub fn copy_child_range(&mut self, src_start: usize, src_end: usize, dst_start: usize) {
        let src = self.layout.child_offset(src_start)..self.layout.child_offset(src_end);
        let dst = self.layout.child_offset(dst_start);
        self.data.copy_within(src, dst);
    }

    /// Inserts a separator at `slot`, replacing the pointer that used to sit
    /// there with the split pair `(left, right)`. Bumps the key count.
    pub fn insert_separator_at(&mut self, slot: usize, key: &[u8], left: PageId, right: PageId) {
        let count = self.key_count() as usize;
        self.copy_key_range(slot, count, slot + 1);
        self.copy_child_range(slot, count + 1, slot + 1);
        self.set_key(slot, key);
        self.set_child(slot, left);
        self.set_child(slot + 1, right);
        PageHeader::from_bytes_mut(self.data).unwrap().increment_count();
    }
}
