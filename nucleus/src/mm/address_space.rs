/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! Address spaces.
//!
//! An address space owns a root translation table plus a per-space virtual
//! region: the same buddy structure as the frame layer, but keyed on
//! virtual addresses with heap-side bookkeeping (virtual pages have no
//! storage of their own to thread a free list through).
//!
//! Lock order within a space is region before root; neither is ever taken
//! while holding the other in reverse.

use {
    super::frame::{FrameAllocator, MAX_ORDER},
    crate::{
        error::{Result, Status},
        sched::wait_queue::WaitQueue,
    },
    alloc::{sync::Arc, vec::Vec},
    core::sync::atomic::{AtomicBool, Ordering},
    machine::{
        memory::{
            mmu::{
                interface::{DirectMap, TlbMaintenance},
                MmuContext, PageFlags, TranslationTable, BLOCK_PAGES, TABLE_LEN,
            },
            Address, PhysAddr, VirtAddr,
        },
        mm::order_for,
        synchronization::{interface::Mutex, IRQSafeSpinLock},
    },
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// A virtual-to-physical mapping domain.
pub struct AddressSpace {
    dmap: &'static dyn DirectMap,
    tlb: &'static dyn TlbMaintenance,
    frames: &'static FrameAllocator,
    region: VirtRegion,
    table: IRQSafeSpinLock<TranslationTable>,
    /// Mirror source for the shared (kernel) half of the root table.
    mirror_from: Option<Arc<AddressSpace>>,
    active: AtomicBool,
    destroy_waitq: WaitQueue,
}

//--------------------------------------------------------------------------------------------------
// Private Definitions
//--------------------------------------------------------------------------------------------------

/// Buddy allocator over a span of virtual pages.
struct VirtRegion {
    base: VirtAddr,
    pages: usize,
    inner: IRQSafeSpinLock<VirtRegionInner>,
}

struct VirtRegionInner {
    free_pages: usize,
    /// 1 = in use (at least reserved, possibly backed).
    bitmap: Vec<u8>,
    buckets: [Vec<VirtAddr>; MAX_ORDER + 1],
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl AddressSpace {
    /// Create a space managing `[span_base, span_base + span_pages)`.
    ///
    /// With `mirror_from`, the upper half of that space's root table is
    /// copied into the new root, so kernel mappings stay visible after a
    /// `swap_in` (and get refreshed on every later `swap_in`).
    pub fn new(
        dmap: &'static dyn DirectMap,
        tlb: &'static dyn TlbMaintenance,
        frames: &'static FrameAllocator,
        span_base: VirtAddr,
        span_pages: usize,
        mirror_from: Option<Arc<AddressSpace>>,
    ) -> Result<Self> {
        assert!(span_base.is_page_aligned());
        let ctx = MmuContext { dmap, tlb };
        let mut table = TranslationTable::new(&ctx, frames)?;
        if let Some(kernel) = &mirror_from {
            kernel
                .table
                .lock(|src| table.copy_root_entries(&ctx, src, TABLE_LEN / 2, TABLE_LEN / 2));
        }

        Ok(Self {
            dmap,
            tlb,
            frames,
            region: VirtRegion::new(span_base, span_pages),
            table: IRQSafeSpinLock::new(table),
            mirror_from,
            active: AtomicBool::new(false),
            destroy_waitq: WaitQueue::new(),
        })
    }

    fn ctx(&self) -> MmuContext {
        MmuContext {
            dmap: self.dmap,
            tlb: self.tlb,
        }
    }

    /// Root table frame, as handed to the hardware on activation.
    pub fn root_phys(&self) -> PhysAddr {
        self.table.lock(|t| t.root_phys())
    }

    /// Whether this space is live on some CPU.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Waiters parked here are woken when the space is torn down.
    pub fn destroy_waitq(&self) -> &WaitQueue {
        &self.destroy_waitq
    }

    /// Allocate virtual pages and install mappings onto existing frames.
    pub fn map_any(&self, phys: PhysAddr, pages: usize, flags: PageFlags) -> Result<VirtAddr> {
        if pages == 0 || !phys.is_page_aligned() {
            return Err(Status::InvalidArgument);
        }
        let virt = self
            .region
            .allocate_pages(pages)
            .ok_or(Status::ResourceExhausted)?;

        match self.install(virt, phys, pages, flags, false) {
            Ok(()) => Ok(virt),
            Err(err) => {
                self.region.release_range(virt, pages);
                Err(err)
            }
        }
    }

    /// Install mappings at a caller-chosen virtual address, overwriting
    /// whatever is there. A range that fully covers an existing block
    /// mapping dissolves and replaces it; partial overlap with a block
    /// mapping is a caller bug and fails with `InvalidArgument` before
    /// anything is touched.
    pub fn map_fixed(
        &self,
        phys: PhysAddr,
        virt: VirtAddr,
        pages: usize,
        flags: PageFlags,
    ) -> Result<()> {
        if pages == 0 || !phys.is_page_aligned() || !virt.is_page_aligned() {
            return Err(Status::InvalidArgument);
        }

        let newly_reserved = self.region.reserve_existing_range(virt, pages);
        match self.install(virt, phys, pages, flags, true) {
            Ok(()) => Ok(()),
            Err(err) => {
                for &page in &newly_reserved {
                    self.region.release_range(page, 1);
                }
                Err(err)
            }
        }
    }

    /// Break mappings and release the virtual range. Holes are tolerated;
    /// backing frames are NOT freed (see [`Self::free`]). A block mapping
    /// only partially covered by the range is a caller bug and fails with
    /// `InvalidArgument` before anything is touched.
    pub fn unmap(&self, virt: VirtAddr, pages: usize) -> Result<()> {
        if pages == 0 || !virt.is_page_aligned() {
            return Err(Status::InvalidArgument);
        }
        let ctx = self.ctx();
        self.table.lock(|t| {
            // Scan first so a partially covered block fails the whole
            // call before any entry changes.
            let mut i = 0;
            while i < pages {
                let page = virt + i * machine::memory::Granule::SIZE;
                match t.covering_block(&ctx, page) {
                    Some(block) => {
                        if !Self::range_covers_block(virt, pages, block) {
                            return Err(Status::InvalidArgument);
                        }
                        i = Self::pages_to_block_end(virt, block);
                    }
                    None => i += 1,
                }
            }

            let mut i = 0;
            while i < pages {
                let page = virt + i * machine::memory::Granule::SIZE;
                if let Some(block) = t.covering_block(&ctx, page) {
                    t.unmap_block(&ctx, self.frames, block)
                        .map_err(Status::from)?;
                    i = Self::pages_to_block_end(virt, block);
                    continue;
                }
                match t.unmap_page(&ctx, self.frames, page) {
                    Ok(_) | Err(machine::memory::mmu::MapError::NotMapped) => {}
                    Err(e) => return Err(Status::from(e)),
                }
                i += 1;
            }
            Ok(())
        })?;
        self.region.release_range(virt, pages);
        Ok(())
    }

    /// Allocate virtual pages backed by freshly allocated frames.
    pub fn allocate(&self, pages: usize, flags: PageFlags) -> Result<VirtAddr> {
        if pages == 0 {
            return Err(Status::InvalidArgument);
        }
        let virt = self
            .region
            .allocate_pages(pages)
            .ok_or(Status::ResourceExhausted)?;

        let ctx = self.ctx();
        let mut backed = 0usize;
        let result = self.table.lock(|t| {
            for i in 0..pages {
                let page = virt + i * machine::memory::Granule::SIZE;
                let frame = match self.frames.allocate(1) {
                    Ok(f) => f,
                    Err(e) => return Err(e),
                };
                if let Err(e) = t.map_page(&ctx, self.frames, page, frame, flags, false) {
                    self.frames.free(frame, 1);
                    return Err(Status::from(e));
                }
                backed += 1;
            }
            Ok(())
        });

        match result {
            Ok(()) => Ok(virt),
            Err(err) => {
                // Roll back partial progress.
                self.table.lock(|t| {
                    for i in 0..backed {
                        let page = virt + i * machine::memory::Granule::SIZE;
                        if let Ok(frame) = t.unmap_page(&ctx, self.frames, page) {
                            self.frames.free(frame, 1);
                        }
                    }
                });
                self.region.release_range(virt, pages);
                Err(err)
            }
        }
    }

    /// Release frames and the virtual range of a prior [`Self::allocate`].
    pub fn free(&self, virt: VirtAddr, pages: usize) -> Result<()> {
        if pages == 0 || !virt.is_page_aligned() {
            return Err(Status::InvalidArgument);
        }
        let ctx = self.ctx();
        self.table.lock(|t| {
            for i in 0..pages {
                let page = virt + i * machine::memory::Granule::SIZE;
                if let Ok(frame) = t.unmap_page(&ctx, self.frames, page) {
                    self.frames.free(frame, 1);
                }
            }
        });
        self.region.release_range(virt, pages);
        Ok(())
    }

    /// Walk the space's tables. `None` when unmapped.
    pub fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        let ctx = self.ctx();
        self.table.lock(|t| t.translate(&ctx, virt))
    }

    /// Make this space current on the executing CPU: refresh the mirrored
    /// kernel half of the root and drop all stale translations.
    pub fn swap_in(&self) {
        let ctx = self.ctx();
        if let Some(kernel) = &self.mirror_from {
            kernel.table.lock(|src| {
                self.table
                    .lock(|dst| dst.copy_root_entries(&ctx, src, TABLE_LEN / 2, TABLE_LEN / 2));
            });
        }
        self.active.store(true, Ordering::Release);
        self.tlb.invalidate_all();
    }

    /// Mark the space off-CPU.
    pub fn swap_out(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Whether `[virt, virt + pages)` contains the whole block based at
    /// `block`.
    fn range_covers_block(virt: VirtAddr, pages: usize, block: VirtAddr) -> bool {
        let block_bytes = BLOCK_PAGES * machine::memory::Granule::SIZE;
        block.as_usize() >= virt.as_usize()
            && block.as_usize() + block_bytes
                <= virt.as_usize() + pages * machine::memory::Granule::SIZE
    }

    /// Page index within a range just past the block based at `block`.
    fn pages_to_block_end(virt: VirtAddr, block: VirtAddr) -> usize {
        (block.as_usize() + BLOCK_PAGES * machine::memory::Granule::SIZE - virt.as_usize())
            / machine::memory::Granule::SIZE
    }

    /// Map the range, taking a 2 MiB block entry wherever a chunk is
    /// block-aligned on both sides and falling back to 4 KiB leaves
    /// elsewhere.
    ///
    /// With `overwrite`, the break-entry rule is enforced up front: a
    /// block mapping already in the range is dissolved only when the
    /// range covers it entirely; partial overlap fails with
    /// `InvalidArgument` before any entry changes. Dissolved and
    /// overwritten mappings are not restored by the rollback path.
    fn install(
        &self,
        virt: VirtAddr,
        phys: PhysAddr,
        pages: usize,
        flags: PageFlags,
        overwrite: bool,
    ) -> Result<()> {
        let block_bytes = BLOCK_PAGES * machine::memory::Granule::SIZE;
        let ctx = self.ctx();
        self.table.lock(|t| {
            if overwrite {
                let mut covered = Vec::new();
                let mut i = 0;
                while i < pages {
                    let page = virt + i * machine::memory::Granule::SIZE;
                    match t.covering_block(&ctx, page) {
                        Some(block) => {
                            if !Self::range_covers_block(virt, pages, block) {
                                return Err(Status::InvalidArgument);
                            }
                            covered.push(block);
                            i = Self::pages_to_block_end(virt, block);
                        }
                        None => i += 1,
                    }
                }
                for block in covered {
                    // Break the entry; the incoming range replaces the
                    // block wholesale.
                    let _ = t.unmap_block(&ctx, self.frames, block);
                }
            }

            let mut installed: Vec<(VirtAddr, bool)> = Vec::new();
            let mut i = 0;
            let result = loop {
                if i >= pages {
                    break Ok(());
                }
                let offset = i * machine::memory::Granule::SIZE;
                let v = virt + offset;
                let p = phys + offset;
                let block_fits = pages - i >= BLOCK_PAGES
                    && v.as_usize() % block_bytes == 0
                    && p.as_usize() % block_bytes == 0;
                let step = if block_fits {
                    match t.map_block(&ctx, self.frames, v, p, flags, overwrite) {
                        Ok(()) => {
                            installed.push((v, true));
                            BLOCK_PAGES
                        }
                        Err(e) => break Err(Status::from(e)),
                    }
                } else {
                    match t.map_page(&ctx, self.frames, v, p, flags, overwrite) {
                        Ok(()) => {
                            installed.push((v, false));
                            1
                        }
                        Err(e) => break Err(Status::from(e)),
                    }
                };
                i += step;
            };

            if result.is_err() {
                // Roll back what this call installed.
                for (v, was_block) in installed {
                    if was_block {
                        let _ = t.unmap_block(&ctx, self.frames, v);
                    } else {
                        let _ = t.unmap_page(&ctx, self.frames, v);
                    }
                }
            }
            result
        })
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.destroy_waitq.wake_all();
        let ctx = MmuContext {
            dmap: self.dmap,
            tlb: self.tlb,
        };
        self.table.lock(|t| t.release(&ctx, self.frames));
    }
}

//--------------------------------------------------------------------------------------------------
// Private Code
//--------------------------------------------------------------------------------------------------

impl VirtRegion {
    fn new(base: VirtAddr, pages: usize) -> Self {
        let region = Self {
            base,
            pages,
            inner: IRQSafeSpinLock::new(VirtRegionInner {
                free_pages: pages,
                bitmap: alloc::vec![0; (pages + 7) / 8],
                buckets: core::array::from_fn(|_| Vec::new()),
            }),
        };

        region.inner.lock(|inner| {
            let end = base.page_index() + pages;
            let mut page = base.page_index();
            while page < end {
                let align = if page == 0 { MAX_ORDER } else { page.trailing_zeros() as usize };
                let fit = (usize::BITS - 1 - (end - page).leading_zeros()) as usize;
                let order = align.min(fit).min(MAX_ORDER);
                inner.buckets[order].push(Address::new(page << machine::memory::Granule::SHIFT));
                page += 1 << order;
            }
        });
        region
    }

    fn page_bit(&self, page: VirtAddr) -> usize {
        page.page_index() - self.base.page_index()
    }

    fn contains(&self, virt: VirtAddr, pages: usize) -> bool {
        let first = virt.page_index();
        let base = self.base.page_index();
        first >= base && first + pages <= base + self.pages
    }

    /// Allocate exactly `count` pages: take a covering buddy block, then
    /// hand the surplus tail straight back, so the bitmap records precisely
    /// the pages the caller owns.
    fn allocate_pages(&self, count: usize) -> Option<VirtAddr> {
        let order = order_for(count);
        if order > MAX_ORDER {
            return None;
        }
        self.inner.lock(|inner| {
            let found = (order..=MAX_ORDER).find(|&o| !inner.buckets[o].is_empty())?;
            let block = inner.buckets[found].pop().unwrap();

            let mut peel = found;
            while peel > order {
                peel -= 1;
                let high =
                    Address::new(block.as_usize() + ((1 << peel) * machine::memory::Granule::SIZE));
                inner.buckets[peel].push(high);
            }

            let bit0 = self.page_bit(block);
            for bit in bit0..bit0 + count {
                inner.bitmap[bit / 8] |= 1 << (bit % 8);
            }
            inner.free_pages -= count;

            // Return the unused tail of the power-of-two block.
            for extra in count..(1 << order) {
                let page = Address::new(
                    block.as_usize() + extra * machine::memory::Granule::SIZE,
                );
                self.insert_free(inner, page);
            }
            Some(block)
        })
    }

    /// Reserve whichever pages of the range are currently free, returning
    /// the ones newly taken. Used by `map_fixed`, which is allowed to
    /// overwrite existing reservations.
    fn reserve_existing_range(&self, virt: VirtAddr, pages: usize) -> Vec<VirtAddr> {
        if !self.contains(virt, pages) {
            return Vec::new();
        }
        self.inner.lock(|inner| {
            let mut taken = Vec::new();
            for i in 0..pages {
                let page = virt + i * machine::memory::Granule::SIZE;
                let bit = self.page_bit(page);
                if inner.bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
                    continue;
                }
                self.carve_page(inner, page);
                taken.push(page);
            }
            taken
        })
    }

    /// Release every in-use page of the range, merging buddies as far as
    /// they go. Pages outside the span or already free are skipped.
    fn release_range(&self, virt: VirtAddr, pages: usize) {
        self.inner.lock(|inner| {
            for i in 0..pages {
                let page = virt + i * machine::memory::Granule::SIZE;
                if !self.contains(page, 1) {
                    continue;
                }
                let bit = self.page_bit(page);
                if inner.bitmap[bit / 8] & (1 << (bit % 8)) == 0 {
                    continue;
                }
                inner.bitmap[bit / 8] &= !(1 << (bit % 8));
                inner.free_pages += 1;
                self.insert_free(inner, page);
            }
        });
    }

    /// Put a single free page back, cascading buddy merges.
    fn insert_free(&self, inner: &mut VirtRegionInner, page: VirtAddr) {
        let mut page_index = page.page_index();
        let mut order = 0;
        while order < MAX_ORDER {
            let buddy_index = page_index ^ (1 << order);
            let buddy = Address::new(buddy_index << machine::memory::Granule::SHIFT);
            if !self.contains(buddy, 1 << order) {
                break;
            }
            let bucket = &mut inner.buckets[order];
            match bucket.iter().position(|&b| b == buddy) {
                Some(at) => {
                    bucket.swap_remove(at);
                }
                None => break,
            }
            page_index = page_index.min(buddy_index);
            order += 1;
        }
        inner.buckets[order].push(Address::new(page_index << machine::memory::Granule::SHIFT));
    }

    /// Split free blocks until `page` stands alone, then mark it used.
    /// The caller has verified the page is currently free.
    fn carve_page(&self, inner: &mut VirtRegionInner, page: VirtAddr) {
        let target = page.page_index();
        let mut found = None;
        'search: for order in 0..=MAX_ORDER {
            for (at, &candidate) in inner.buckets[order].iter().enumerate() {
                let first = candidate.page_index();
                if target >= first && target < first + (1 << order) {
                    found = Some((order, at));
                    break 'search;
                }
            }
        }
        let (mut order, at) = found.expect("free page missing from every bucket");
        let mut block = inner.buckets[order].swap_remove(at);

        while order > 0 {
            order -= 1;
            let half = 1usize << order;
            let high = Address::new(
                block.as_usize() + half * machine::memory::Granule::SIZE,
            );
            if target >= high.page_index() {
                inner.buckets[order].push(block);
                block = high;
            } else {
                inner.buckets[order].push(high);
            }
        }

        let bit = self.page_bit(block);
        inner.bitmap[bit / 8] |= 1 << (bit % 8);
        inner.free_pages -= 1;
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------
