//! # Page Store
//!
//! The page store owns the backing medium and presents it as a flat array of
//! fixed-size pages with a tiny pool of in-memory page buffers. It is the
//! log-structured half of the engine: regular writes always append at the
//! write head, overwrites are reserved for the root, and reclaiming space is
//! done a whole erase block at a time.
//!
//! ## Buffer Replacement Policy
//!
//! With `B` buffer slots:
//!
//! - Slot 0 is the scratch buffer. The tree engine pulls any node it intends
//!   to modify into slot 0 via [`PageStore::read_into`]; plain reads never
//!   choose it and it never satisfies a hit.
//! - Slot 1 is reserved for the root page whenever `B >= 3`.
//! - With `B == 2` every non-scratch read lands in slot 1.
//! - With `B == 3` every non-root read lands in slot 2.
//! - With `B >= 4` non-root reads prefer an empty slot among `2..B`, then
//!   round-robin over `2..B`, never evicting the slot that produced the most
//!   recent hit.
//!
//! Physical page 0 exists but can never be a buffer hit: page number 0 doubles
//! as the "empty slot" marker, exactly like the original design this store is
//! derived from.
//!
//! ## Erase-Block Ring
//!
//! The medium is divided into erase blocks of `E` pages. The store keeps one
//! *open* block that the write head moves through and one *pre-erased* block
//! ready to take over. When the head steps past the open block:
//!
//! 1. The pre-erased block becomes the open block.
//! 2. The next block ahead is chosen for erasure. Before the ring has
//!    wrapped, the block is erased outright; once wrapped, every page in the
//!    candidate block is probed through [`RecycleHooks::is_valid`] first.
//! 3. Live pages are re-appended through [`RecycleHooks::move_page`] (which
//!    lets the engine rewrite child pointers from its mapping table), and
//!    their parents are rewritten so the moved page stays reachable.
//! 4. A block that is more than half live is skipped entirely and the next
//!    block is considered, which keeps write amplification bounded in
//!    nearly-full regions.
//!
//! The hooks re-enter this store to read pages and patch mappings. They are
//! only ever invoked from inside [`PageStore::write`], which itself only runs
//! during an insert, and they never touch the scratch slot.

use eyre::{bail, ensure, Result};
use log::{debug, info, trace};
use smallvec::SmallVec;

use super::medium::Medium;
use super::page::{PageHeader, PAGE_HEADER_SIZE};
use super::{PageId, NO_PAGE};
use crate::config::IndexConfig;

/// Slot index of the scratch buffer reserved for the in-flight insert.
pub const SCRATCH_SLOT: usize = 0;

/// Upper bound on on-disk `next_id` chain length; chains are re-patched at
/// their head on every demotion, so anything longer means a corrupt link.
const MAX_CHAIN_HOPS: u32 = 16;

/// Counters for medium and buffer traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub reads: u64,
    pub writes: u64,
    pub overwrites: u64,
    pub buffer_hits: u64,
}

impl core::fmt::Display for StoreStats {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "reads: {}  writes: {}  overwrites: {}  buffer hits: {}",
            self.reads, self.writes, self.overwrites, self.buffer_hits
        )
    }
}

/// Engine's verdict on a page that is about to be erased.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageValidity {
    /// Nothing references the page; it may be erased.
    Garbage,
    /// The page is reachable from the root through `parent`.
    Live { parent: PageId },
    /// The page was superseded and only the mapping table still knows it;
    /// rewriting `parent` absorbs the mapping and retires it.
    Superseded { parent: PageId },
}

/// Capabilities the tree engine lends to the store for block recycling.
pub trait RecycleHooks {
    /// Classifies a page ahead of an erase.
    fn is_valid(&mut self, store: &mut PageStore, pnum: PageId) -> Result<PageValidity>;

    /// Notifies the engine that the page in `slot` is moving from `prev` to
    /// `curr`. The engine refreshes the buffer's child pointers and its own
    /// bookkeeping; the store appends the buffer right afterwards.
    fn move_page(
        &mut self,
        store: &mut PageStore,
        prev: PageId,
        curr: PageId,
        slot: usize,
    ) -> Result<()>;

    /// Translates a possibly stale page id through the mapping table.
    fn resolve_page(&self, pnum: PageId) -> PageId;

    /// Retires the mapping entry for `pnum` after its target was already
    /// rewritten during the current recycling pass.
    fn retire_mapping(&mut self, store: &mut PageStore, pnum: PageId) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
enum JobKind {
    Root,
    Move,
    ParentRewrite,
}

#[derive(Debug, Clone, Copy)]
struct RelocationJob {
    page: PageId,
    parent: PageId,
    kind: JobKind,
}

pub struct PageStore {
    medium: Box<dyn Medium>,
    page_size: usize,
    start_addr: u64,
    num_data_pages: u32,
    erase_block_pages: u32,

    buffers: Vec<u8>,
    slot_pages: Vec<PageId>,
    num_buffers: usize,
    last_hit: PageId,
    next_victim: usize,

    root_page: PageId,
    next_logical_id: u32,
    next_page_write_id: PageId,
    block_end_page: PageId,
    erased_start_page: PageId,
    wrapped_memory: bool,
    erase_in_progress: Option<(PageId, PageId)>,

    stats: StoreStats,
}

impl PageStore {
    /// Builds a store over a fresh medium, erasing the first two blocks and
    /// placing the write head at page 0.
    pub fn new(medium: Box<dyn Medium>, config: &IndexConfig) -> Result<Self> {
        let mut store = Self::build(medium, config)?;
        let block = store.erase_block_pages;
        store.erase_pages(0, 2 * block - 1)?;
        Ok(store)
    }

    /// Builds a store over a previously written medium without erasing
    /// anything. The caller restores the write head afterwards.
    pub fn attach(medium: Box<dyn Medium>, config: &IndexConfig) -> Result<Self> {
        Self::build(medium, config)
    }

    fn build(medium: Box<dyn Medium>, config: &IndexConfig) -> Result<Self> {
        config.validate()?;
        ensure!(
            config.end_addr <= medium.size(),
            "index region ends at {:#x} but the medium holds only {:#x} bytes",
            config.end_addr,
            medium.size()
        );

        let num_buffers = config.num_buffers;
        let page_size = config.page_size;

        debug!(
            "page store: {} buffers of {} bytes, {} data pages, erase block {}",
            num_buffers,
            page_size,
            config.num_data_pages(),
            config.erase_block_pages
        );

        Ok(Self {
            medium,
            page_size,
            start_addr: config.start_addr,
            num_data_pages: config.num_data_pages(),
            erase_block_pages: config.erase_block_pages,
            buffers: vec![0u8; num_buffers * page_size],
            slot_pages: vec![0; num_buffers],
            num_buffers,
            last_hit: 0,
            next_victim: 2,
            root_page: 0,
            next_logical_id: 0,
            next_page_write_id: 0,
            block_end_page: config.erase_block_pages - 1,
            erased_start_page: config.erase_block_pages,
            wrapped_memory: false,
            erase_in_progress: None,
            stats: StoreStats::default(),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn num_data_pages(&self) -> u32 {
        self.num_data_pages
    }

    pub fn end_data_page(&self) -> PageId {
        self.num_data_pages - 1
    }

    pub fn erase_block_pages(&self) -> u32 {
        self.erase_block_pages
    }

    pub fn wrapped_memory(&self) -> bool {
        self.wrapped_memory
    }

    pub fn stats(&self) -> StoreStats {
        self.stats
    }

    pub fn clear_stats(&mut self) {
        self.stats = StoreStats::default();
    }

    /// Physical page currently pinned as the root. The engine keeps this in
    /// sync with its active path so the replacement policy and the recycler
    /// can special-case the root.
    pub fn root_page(&self) -> PageId {
        self.root_page
    }

    pub fn set_root(&mut self, pnum: PageId) {
        self.root_page = pnum;
    }

    /// Next physical page an append will land on.
    pub fn peek_write_id(&self) -> PageId {
        self.next_page_write_id
    }

    fn page_addr(&self, pnum: PageId) -> u64 {
        self.start_addr + pnum as u64 * self.page_size as u64
    }

    fn slot_start(&self, slot: usize) -> usize {
        slot * self.page_size
    }

    /// Borrows the contents of a buffer slot.
    pub fn slot(&self, slot: usize) -> &[u8] {
        let start = self.slot_start(slot);
        &self.buffers[start..start + self.page_size]
    }

    /// Mutably borrows the contents of a buffer slot.
    pub fn slot_mut(&mut self, slot: usize) -> &mut [u8] {
        let start = self.slot_start(slot);
        &mut self.buffers[start..start + self.page_size]
    }

    /// Zeroes a buffer slot and forgets which page it held.
    pub fn init_slot(&mut self, slot: usize) -> &mut [u8] {
        self.slot_pages[slot] = 0;
        let start = self.slot_start(slot);
        let buf = &mut self.buffers[start..start + self.page_size];
        buf.fill(0);
        buf
    }

    /// Reads a page through the buffer pool and returns the slot holding it.
    pub fn read(&mut self, pnum: PageId) -> Result<usize> {
        if pnum != 0 {
            for slot in 1..self.num_buffers {
                if self.slot_pages[slot] == pnum {
                    self.stats.buffer_hits += 1;
                    self.last_hit = pnum;
                    return Ok(slot);
                }
            }
        }

        let slot = self.choose_slot(pnum);
        self.read_into(pnum, slot)
    }

    fn choose_slot(&mut self, pnum: PageId) -> usize {
        if self.num_buffers == 2 {
            return 1;
        }
        if pnum == self.root_page {
            return 1;
        }
        if self.num_buffers == 3 {
            return 2;
        }

        for slot in 2..self.num_buffers {
            if self.slot_pages[slot] == 0 {
                return slot;
            }
        }

        let mut slot = self.next_victim;
        loop {
            if slot >= self.num_buffers {
                slot = 2;
            }
            if self.slot_pages[slot] != self.last_hit {
                break;
            }
            slot += 1;
        }
        self.next_victim = if slot + 1 >= self.num_buffers { 2 } else { slot + 1 };
        slot
    }

    /// Reads a page and follows its on-disk `next_id` chain to the newest
    /// copy. Returns the slot holding the final page.
    pub fn read_chained(&mut self, pnum: PageId) -> Result<usize> {
        let mut slot = self.read(pnum)?;
        let mut hops = 0u32;
        loop {
            let next = PageHeader::from_bytes(self.slot(slot))?.next_id();
            if next == NO_PAGE {
                return Ok(slot);
            }
            ensure!(
                hops < MAX_CHAIN_HOPS,
                "next_id chain from page {} does not terminate",
                pnum
            );
            hops += 1;
            slot = self.read(next)?;
        }
    }

    /// Chain-following read into a specific buffer slot.
    pub fn read_chained_into(&mut self, pnum: PageId, slot: usize) -> Result<usize> {
        let mut slot = self.read_into(pnum, slot)?;
        let mut hops = 0u32;
        loop {
            let next = PageHeader::from_bytes(self.slot(slot))?.next_id();
            if next == NO_PAGE {
                return Ok(slot);
            }
            ensure!(
                hops < MAX_CHAIN_HOPS,
                "next_id chain from page {} does not terminate",
                pnum
            );
            hops += 1;
            slot = self.read_into(next, slot)?;
        }
    }

    /// The block currently being recycled, if any. The engine's mapping
    /// demotion avoids patching chains into pages that are about to be
    /// erased.
    pub fn erase_in_progress(&self) -> Option<(PageId, PageId)> {
        self.erase_in_progress
    }

    /// Reads just the header of a page, bypassing the buffer pool. Chain
    /// walks use this so they cannot evict a slot the caller is holding onto.
    pub fn page_header(&mut self, pnum: PageId) -> Result<PageHeader> {
        ensure!(
            pnum < self.num_data_pages,
            "page {} beyond end of medium ({} pages)",
            pnum,
            self.num_data_pages
        );
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        self.medium.read(self.page_addr(pnum), &mut buf)?;
        Ok(*PageHeader::from_bytes(&buf)?)
    }

    /// Force-loads a page into a specific buffer slot.
    pub fn read_into(&mut self, pnum: PageId, slot: usize) -> Result<usize> {
        ensure!(slot < self.num_buffers, "buffer slot {} out of range", slot);
        ensure!(
            pnum < self.num_data_pages,
            "page {} beyond end of medium ({} pages)",
            pnum,
            self.num_data_pages
        );

        let addr = self.page_addr(pnum);
        let start = self.slot_start(slot);
        self.medium
            .read(addr, &mut self.buffers[start..start + self.page_size])?;
        self.stats.reads += 1;
        if slot != SCRATCH_SLOT {
            self.slot_pages[slot] = pnum;
        }
        Ok(slot)
    }

    /// Append-writes the contents of `slot` at the write head, recycling the
    /// next erase block first if the head stepped out of the open block.
    /// Returns the physical page id of the new page.
    pub fn write(&mut self, slot: usize, hooks: &mut dyn RecycleHooks) -> Result<PageId> {
        if self.next_page_write_id > self.block_end_page {
            self.advance_block(hooks)?;
        }
        self.append_from_slot(slot)
    }

    fn append_from_slot(&mut self, slot: usize) -> Result<PageId> {
        let pnum = self.next_page_write_id;
        ensure!(
            pnum <= self.block_end_page,
            "write head {} overran the open erase block ending at {}",
            pnum,
            self.block_end_page
        );
        self.next_page_write_id += 1;

        {
            let logical = self.next_logical_id;
            let buf = self.slot_mut(slot);
            let header = PageHeader::from_bytes_mut(buf)?;
            header.set_logical_id(logical);
        }
        self.next_logical_id += 1;

        let addr = self.page_addr(pnum);
        let start = self.slot_start(slot);
        self.medium
            .write(addr, &self.buffers[start..start + self.page_size])?;
        self.stats.writes += 1;

        // This physical page has new contents now; stale copies in other
        // slots must not satisfy future hits.
        for other in 1..self.num_buffers {
            if other != slot && self.slot_pages[other] == pnum && pnum != 0 {
                self.slot_pages[other] = 0;
            }
        }
        if slot != SCRATCH_SLOT {
            self.slot_pages[slot] = pnum;
        }

        Ok(pnum)
    }

    /// Rewrites page `pnum` in place and refreshes any buffer caching it.
    pub fn overwrite(&mut self, slot: usize, pnum: PageId) -> Result<PageId> {
        ensure!(
            pnum < self.num_data_pages,
            "page {} beyond end of medium ({} pages)",
            pnum,
            self.num_data_pages
        );

        let addr = self.page_addr(pnum);
        let start = self.slot_start(slot);
        self.medium
            .write(addr, &self.buffers[start..start + self.page_size])?;
        self.stats.overwrites += 1;

        for other in 1..self.num_buffers {
            if other != slot && self.slot_pages[other] == pnum && pnum != 0 {
                let dst = self.slot_start(other);
                self.buffers.copy_within(start..start + self.page_size, dst);
            }
        }
        if slot != SCRATCH_SLOT {
            self.slot_pages[slot] = pnum;
        }

        Ok(pnum)
    }

    /// Patches `bytes` into page `pnum` at `offset` without touching the rest
    /// of the page. Cached copies are patched as well so later hits observe
    /// the change.
    pub fn write_bytes(&mut self, bytes: &[u8], pnum: PageId, offset: usize) -> Result<()> {
        ensure!(
            offset + bytes.len() <= self.page_size,
            "byte patch [{}, {}) beyond page size {}",
            offset,
            offset + bytes.len(),
            self.page_size
        );
        ensure!(
            pnum < self.num_data_pages,
            "page {} beyond end of medium ({} pages)",
            pnum,
            self.num_data_pages
        );

        self.medium.write(self.page_addr(pnum) + offset as u64, bytes)?;

        for slot in 1..self.num_buffers {
            if self.slot_pages[slot] == pnum && pnum != 0 {
                let start = self.slot_start(slot) + offset;
                self.buffers[start..start + bytes.len()].copy_from_slice(bytes);
            }
        }
        Ok(())
    }

    /// Erases the inclusive physical page range and drops cached copies.
    pub fn erase_pages(&mut self, first: PageId, last: PageId) -> Result<()> {
        let len = (last - first + 1) as u64 * self.page_size as u64;
        self.medium.erase(self.page_addr(first), len)?;

        for slot in 1..self.num_buffers {
            let cached = self.slot_pages[slot];
            if cached >= first && cached <= last {
                self.slot_pages[slot] = 0;
            }
        }
        Ok(())
    }

    /// Flushes the medium and reports final statistics.
    pub fn close(mut self) -> Result<StoreStats> {
        self.medium.sync()?;
        info!("page store closed: {}", self.stats);
        Ok(self.stats)
    }

    pub fn sync(&mut self) -> Result<()> {
        self.medium.sync()
    }

    /// Restores the logical-id counter and the write head after recovery.
    /// The head resumes in the block containing `last_written`, right after
    /// it; the ring is marked wrapped so every future erase probes liveness.
    pub(crate) fn restore_write_state(&mut self, next_logical_id: u32, last_written: PageId) {
        let block = self.erase_block_pages;
        self.next_logical_id = next_logical_id;
        self.next_page_write_id = last_written + 1;
        self.block_end_page = (last_written / block) * block + block - 1;
        self.wrapped_memory = true;
    }

    /// Selects and erases the block ahead of the open one. Split out of
    /// `advance_block` so recovery can rebuild the ring with liveness checks.
    /// `reserve` is the number of open-block pages the caller still needs for
    /// its own appends: 1 for the write that triggered the advance, 0 when
    /// rebuilding the ring at recovery.
    pub(crate) fn select_and_erase_next(
        &mut self,
        hooks: &mut dyn RecycleHooks,
        reserve: u32,
    ) -> Result<()> {
        let block = self.erase_block_pages;
        let open_start = self.block_end_page + 1 - block;
        let total_blocks = self.num_data_pages / block;
        let mut start = self.block_end_page + 1;

        for _ in 0..total_blocks {
            if start >= self.num_data_pages {
                start = 0;
                self.wrapped_memory = true;
            }
            ensure!(
                start != open_start,
                "every erase block is above the live-page threshold; cannot recycle"
            );
            let end = start + block - 1;

            if !self.wrapped_memory {
                self.erase_pages(start, end)?;
                self.erased_start_page = start;
                return Ok(());
            }

            if self.recycle_block(start, end, reserve, hooks)? {
                self.erased_start_page = start;
                return Ok(());
            }
            start = end + 1;
        }

        bail!("no erase block below the live-page threshold; storage too full to recycle")
    }

    fn advance_block(&mut self, hooks: &mut dyn RecycleHooks) -> Result<()> {
        trace!(
            "write head {} left block ending at {}; opening block at {}",
            self.next_page_write_id,
            self.block_end_page,
            self.erased_start_page
        );
        self.next_page_write_id = self.erased_start_page;
        self.block_end_page = self.erased_start_page + self.erase_block_pages - 1;
        self.select_and_erase_next(hooks, 1)
    }

    /// Probes every page of the block, relocates whatever is still live, and
    /// erases it. Returns false when the block was skipped for being more
    /// than half live.
    fn recycle_block(
        &mut self,
        first: PageId,
        last: PageId,
        reserve: u32,
        hooks: &mut dyn RecycleHooks,
    ) -> Result<bool> {
        let mut jobs: SmallVec<[RelocationJob; 8]> = SmallVec::new();
        let mut live: u32 = 0;

        for pnum in first..=last {
            if pnum == self.root_page {
                live += 1;
                jobs.push(RelocationJob {
                    page: pnum,
                    parent: NO_PAGE,
                    kind: JobKind::Root,
                });
                continue;
            }
            match hooks.is_valid(self, pnum)? {
                PageValidity::Garbage => {}
                PageValidity::Live { parent } => {
                    live += 1;
                    jobs.push(RelocationJob {
                        page: pnum,
                        parent,
                        kind: JobKind::Move,
                    });
                }
                PageValidity::Superseded { parent } => {
                    jobs.push(RelocationJob {
                        page: pnum,
                        parent,
                        kind: JobKind::ParentRewrite,
                    });
                }
            }
        }

        if live * 2 > self.erase_block_pages {
            debug!(
                "skipping erase block {}..={}: {} of {} pages live",
                first, last, live, self.erase_block_pages
            );
            return Ok(false);
        }

        // Relocation appends land in the open block, alongside whatever the
        // caller reserved for its own pending writes. If the worst case
        // (every live page moved plus one rewrite per distinct parent)
        // cannot fit in the space left, the appends would spill into the
        // very range scheduled for erase; skip the block instead.
        let mut parents: SmallVec<[PageId; 8]> = SmallVec::new();
        for job in &jobs {
            if job.parent != NO_PAGE && !parents.contains(&job.parent) {
                parents.push(job.parent);
            }
        }
        let moves = jobs
            .iter()
            .filter(|job| matches!(job.kind, JobKind::Root | JobKind::Move))
            .count() as u32;
        let remaining = (self.block_end_page + 1).saturating_sub(self.next_page_write_id);
        if moves + parents.len() as u32 + reserve > remaining {
            debug!(
                "skipping erase block {}..={}: relocation needs up to {} appends, {} pages left",
                first,
                last,
                moves + parents.len() as u32,
                remaining
            );
            return Ok(false);
        }

        debug!(
            "recycling erase block {}..={}: {} live, {} scheduled",
            first,
            last,
            live,
            jobs.len()
        );

        self.erase_in_progress = Some((first, last));
        let result = self.relocate_and_erase(first, last, jobs, hooks);
        self.erase_in_progress = None;
        result?;
        Ok(true)
    }

    fn relocate_and_erase(
        &mut self,
        first: PageId,
        last: PageId,
        jobs: SmallVec<[RelocationJob; 8]>,
        hooks: &mut dyn RecycleHooks,
    ) -> Result<()> {
        let mut relocated: SmallVec<[PageId; 8]> = SmallVec::new();
        for job in jobs {
            match job.kind {
                JobKind::Root | JobKind::Move => {
                    if relocated.contains(&job.page) {
                        continue;
                    }
                    // Chain-following read: a live page may have been
                    // superseded through an on-disk chain, and only the
                    // newest copy is worth carrying forward.
                    let slot = self.read_chained(job.page)?;
                    let target = self.next_page_write_id;
                    trace!("moving live page {} -> {}", job.page, target);
                    hooks.move_page(self, job.page, target, slot)?;
                    self.append_from_slot(slot)?;
                    relocated.push(job.page);
                    if let JobKind::Move = job.kind {
                        self.rewrite_parent(job.parent, &mut relocated, hooks)?;
                    }
                }
                JobKind::ParentRewrite => {
                    self.rewrite_parent(job.parent, &mut relocated, hooks)?;
                }
            }
        }

        self.erase_pages(first, last)
    }

    /// Rewrites the parent of a page that moved (or was superseded) so the
    /// child stays reachable after the erase.
    fn rewrite_parent(
        &mut self,
        parent: PageId,
        relocated: &mut SmallVec<[PageId; 8]>,
        hooks: &mut dyn RecycleHooks,
    ) -> Result<()> {
        if relocated.contains(&parent) {
            return Ok(());
        }
        if hooks.resolve_page(parent) != parent {
            // Rewritten earlier in this pass; retire the mapping entry.
            hooks.retire_mapping(self, parent)?;
            return Ok(());
        }

        let slot = self.read_chained(parent)?;
        let target = self.next_page_write_id;
        trace!("rewriting parent {} -> {}", parent, target);
        hooks.move_page(self, parent, target, slot)?;
        self.append_from_slot(slot)?;
        relocated.push(parent);
        Ok(())
    }
}
