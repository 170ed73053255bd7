/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! Translation tables.
//!
//! Four translation levels, 512 entries each, 4 KiB granule, with 2 MiB
//! block entries at the next-to-last level. The walker reaches table memory
//! through the fixed-offset direct map ([`interface::DirectMap`]) instead of
//! a recursive self-mapping entry, so the same code runs against real RAM
//! and against the `hosted` in-memory model.

use {
    super::{Address, Granule, PhysAddr, VirtAddr},
    bit_field::BitField,
    bitflags::bitflags,
    snafu::Snafu,
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Entries per translation table.
pub const TABLE_LEN: usize = 512;

/// Translation levels. Level 0 is the root; level 3 holds 4 KiB leaves.
pub const LEVEL_COUNT: usize = 4;

/// Pages covered by one block entry at level 2.
pub const BLOCK_PAGES: usize = TABLE_LEN;

bitflags! {
    /// Caller-visible attributes of a leaf mapping.
    ///
    /// Entries are writable by default; table frames themselves are always
    /// installed privileged and cacheable.
    pub struct PageFlags: u32 {
        /// Disable caching for this mapping (device or DMA memory).
        const UNCACHEABLE  = 1 << 0;
        /// Accessible from unprivileged (user) mode.
        const UNPRIVILEGED = 1 << 1;
    }
}

/// One translation-table entry.
///
/// Layout: bit 0 valid, bit 1 writable, bit 2 unprivileged, bit 3
/// uncacheable, bit 7 block (2 MiB leaf at level 2), bits 12..52 the output
/// frame number.
#[derive(Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct Entry(u64);

/// Seam interfaces implemented by the per-architecture shims (or the hosted
/// model).
pub mod interface {
    pub use super::super::{Physical, Virtual};
    use super::Address;

    /// Access to physical memory through the fixed-offset direct map.
    ///
    /// # Safety
    ///
    /// Implementations must hand out pointers that stay valid for the life
    /// of the kernel and must cover every frame the allocators own.
    pub unsafe trait DirectMap: Send + Sync {
        /// Kernel-virtual pointer at which `phys` is addressable.
        fn ptr_of(&self, phys: Address<Physical>) -> *mut u8;

        /// Whether `[phys, phys + bytes)` lies inside the mapped range.
        fn covers(&self, phys: Address<Physical>, bytes: usize) -> bool;
    }

    /// TLB maintenance for the current CPU set.
    pub trait TlbMaintenance: Send + Sync {
        /// Invalidate the translation for `pages` pages starting at `virt`.
        fn invalidate_range(&self, virt: Address<Virtual>, pages: usize);

        /// Invalidate everything (root table switch).
        fn invalidate_all(&self);
    }

    /// Source of single zeroed frames used as translation tables.
    ///
    /// Implemented by the nucleus frame allocator; kept as a trait so this
    /// crate stays below it in the dependency order.
    pub trait TableFrameSource {
        /// Allocate one frame for a translation table, or `None` when
        /// physical memory is exhausted.
        fn allocate_table_frame(&self) -> Option<Address<Physical>>;

        /// Return a frame previously obtained from
        /// [`Self::allocate_table_frame`].
        fn free_table_frame(&self, frame: Address<Physical>);
    }
}

/// Everything a walk needs from the machine, bundled to keep signatures flat.
#[derive(Copy, Clone)]
pub struct MmuContext<'a> {
    pub dmap: &'a dyn interface::DirectMap,
    pub tlb: &'a dyn interface::TlbMaintenance,
}

/// Errors from table manipulation.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// A frame for an intermediate table could not be allocated.
    TableExhausted,
    /// The target is already mapped and overwrite was not requested.
    AlreadyMapped,
    /// The operation partially overlaps a block mapping.
    BlockOverlap,
    /// Nothing is mapped at the given address.
    NotMapped,
}

/// A four-level translation table identified by its root frame.
pub struct TranslationTable {
    root: PhysAddr,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl Entry {
    const VALID: usize = 0;
    const WRITABLE: usize = 1;
    const UNPRIVILEGED: usize = 2;
    const UNCACHEABLE: usize = 3;
    const BLOCK: usize = 7;
    const FRAME: core::ops::Range<usize> = 12..52;

    /// The invalid (empty) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// A next-level table reference. Table frames are privileged and cached.
    pub fn table(frame: PhysAddr) -> Self {
        let mut raw = 0u64;
        raw.set_bit(Self::VALID, true);
        raw.set_bit(Self::WRITABLE, true);
        raw.set_bits(Self::FRAME, frame.page_index() as u64);
        Self(raw)
    }

    /// A leaf mapping of one page (or one block when `block` is set).
    pub fn leaf(frame: PhysAddr, flags: PageFlags, block: bool) -> Self {
        let mut raw = 0u64;
        raw.set_bit(Self::VALID, true);
        raw.set_bit(Self::WRITABLE, true);
        raw.set_bit(Self::UNPRIVILEGED, flags.contains(PageFlags::UNPRIVILEGED));
        raw.set_bit(Self::UNCACHEABLE, flags.contains(PageFlags::UNCACHEABLE));
        raw.set_bit(Self::BLOCK, block);
        raw.set_bits(Self::FRAME, frame.page_index() as u64);
        Self(raw)
    }

    pub fn is_valid(self) -> bool {
        self.0.get_bit(Self::VALID)
    }

    pub fn is_block(self) -> bool {
        self.0.get_bit(Self::BLOCK)
    }

    /// Output address of this entry (frame of the next table, or of the leaf).
    pub fn frame(self) -> PhysAddr {
        Address::new((self.0.get_bits(Self::FRAME) as usize) << Granule::SHIFT)
    }

    /// Caller-visible flags of a leaf entry.
    pub fn flags(self) -> PageFlags {
        let mut flags = PageFlags::empty();
        if self.0.get_bit(Self::UNPRIVILEGED) {
            flags |= PageFlags::UNPRIVILEGED;
        }
        if self.0.get_bit(Self::UNCACHEABLE) {
            flags |= PageFlags::UNCACHEABLE;
        }
        flags
    }
}

impl core::fmt::Debug for Entry {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        if !self.is_valid() {
            return write!(f, "Entry(invalid)");
        }
        write!(
            f,
            "Entry({}, block={}, flags={:?})",
            self.frame(),
            self.is_block(),
            self.flags()
        )
    }
}

/// Index into the table at `level` (0 = root) for a virtual address.
pub const fn table_index(virt: VirtAddr, level: usize) -> usize {
    (virt.as_usize() >> (Granule::SHIFT + 9 * (LEVEL_COUNT - 1 - level))) & (TABLE_LEN - 1)
}

/// Borrow the 512-entry table stored in `frame` through the direct map.
///
/// # Safety
///
/// `frame` must hold a live translation table covered by `dmap`, and the
/// caller must not alias the returned table.
unsafe fn table_mut<'a>(dmap: &dyn interface::DirectMap, frame: PhysAddr) -> &'a mut [Entry; TABLE_LEN] {
    debug_assert!(dmap.covers(frame, Granule::SIZE));
    &mut *(dmap.ptr_of(frame) as *mut [Entry; TABLE_LEN])
}

impl TranslationTable {
    /// Allocate a zeroed root table.
    pub fn new(
        ctx: &MmuContext,
        frames: &dyn interface::TableFrameSource,
    ) -> Result<Self, MapError> {
        let root = Self::fresh_table(ctx, frames)?;
        Ok(Self { root })
    }

    /// Adopt an existing root frame (boot tables).
    pub const fn from_root(root: PhysAddr) -> Self {
        Self { root }
    }

    /// Physical address of the root table, as loaded into the hardware base
    /// register.
    pub const fn root_phys(&self) -> PhysAddr {
        self.root
    }

    fn fresh_table(
        ctx: &MmuContext,
        frames: &dyn interface::TableFrameSource,
    ) -> Result<PhysAddr, MapError> {
        let frame = frames.allocate_table_frame().ok_or(MapError::TableExhausted)?;
        unsafe {
            core::ptr::write_bytes(ctx.dmap.ptr_of(frame), 0, Granule::SIZE);
        }
        Ok(frame)
    }

    /// Install a 4 KiB mapping.
    ///
    /// With `overwrite`, an existing leaf is replaced (invalidated, shot
    /// from the TLB, reinstalled). A block entry anywhere on the walk
    /// fails with [`MapError::BlockOverlap`] regardless of `overwrite`:
    /// one page can never cover a block, so whoever owns the range must
    /// check coverage and dissolve the block via [`Self::unmap_block`]
    /// first.
    pub fn map_page(
        &mut self,
        ctx: &MmuContext,
        frames: &dyn interface::TableFrameSource,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageFlags,
        overwrite: bool,
    ) -> Result<(), MapError> {
        debug_assert!(virt.is_page_aligned() && phys.is_page_aligned());

        let mut table = self.root;
        for level in 0..LEVEL_COUNT - 1 {
            let index = table_index(virt, level);
            let entries = unsafe { table_mut(ctx.dmap, table) };
            let entry = entries[index];

            table = if !entry.is_valid() {
                let fresh = Self::fresh_table(ctx, frames)?;
                entries[index] = Entry::table(fresh);
                fresh
            } else if entry.is_block() {
                // One page can never cover a block mapping; breaking one
                // is a range-level decision made by the address space.
                return Err(MapError::BlockOverlap);
            } else {
                entry.frame()
            };
        }

        let leaf_index = table_index(virt, LEVEL_COUNT - 1);
        let entries = unsafe { table_mut(ctx.dmap, table) };
        if entries[leaf_index].is_valid() {
            if !overwrite {
                return Err(MapError::AlreadyMapped);
            }
            entries[leaf_index] = Entry::empty();
            ctx.tlb.invalidate_range(virt, 1);
        }
        entries[leaf_index] = Entry::leaf(phys, flags, false);
        Ok(())
    }

    /// Install a 2 MiB block mapping at level 2.
    ///
    /// Overwriting a finer-grained table is the inverse break-entry case:
    /// the table entry is invalidated, the range shot, the subtable frame
    /// released, and the block installed.
    pub fn map_block(
        &mut self,
        ctx: &MmuContext,
        frames: &dyn interface::TableFrameSource,
        virt: VirtAddr,
        phys: PhysAddr,
        flags: PageFlags,
        overwrite: bool,
    ) -> Result<(), MapError> {
        let block_bytes = BLOCK_PAGES * Granule::SIZE;
        assert!(
            virt.as_usize() % block_bytes == 0 && phys.as_usize() % block_bytes == 0,
            "block mappings must be block-aligned"
        );

        let mut table = self.root;
        for level in 0..LEVEL_COUNT - 2 {
            let index = table_index(virt, level);
            let entries = unsafe { table_mut(ctx.dmap, table) };
            let entry = entries[index];

            table = if !entry.is_valid() {
                let fresh = Self::fresh_table(ctx, frames)?;
                entries[index] = Entry::table(fresh);
                fresh
            } else if entry.is_block() {
                return Err(MapError::BlockOverlap);
            } else {
                entry.frame()
            };
        }

        let index = table_index(virt, LEVEL_COUNT - 2);
        let entries = unsafe { table_mut(ctx.dmap, table) };
        let entry = entries[index];
        if entry.is_valid() {
            if !overwrite {
                return Err(MapError::AlreadyMapped);
            }
            entries[index] = Entry::empty();
            ctx.tlb.invalidate_range(virt, BLOCK_PAGES);
            if !entry.is_block() {
                frames.free_table_frame(entry.frame());
            }
        }
        entries[index] = Entry::leaf(phys, flags, true);
        Ok(())
    }

    /// Remove the 4 KiB mapping at `virt`, returning the frame it pointed
    /// to. Intermediate tables left empty are released.
    pub fn unmap_page(
        &mut self,
        ctx: &MmuContext,
        frames: &dyn interface::TableFrameSource,
        virt: VirtAddr,
    ) -> Result<PhysAddr, MapError> {
        debug_assert!(virt.is_page_aligned());
        let mut path = [Address::zero(); LEVEL_COUNT];

        let mut table = self.root;
        for level in 0..LEVEL_COUNT - 1 {
            path[level] = table;
            let entry = unsafe { table_mut(ctx.dmap, table) }[table_index(virt, level)];
            if !entry.is_valid() {
                return Err(MapError::NotMapped);
            }
            if entry.is_block() {
                // 4 KiB unmap inside a block mapping is a caller bug.
                return Err(MapError::BlockOverlap);
            }
            table = entry.frame();
        }
        path[LEVEL_COUNT - 1] = table;

        let entries = unsafe { table_mut(ctx.dmap, table) };
        let leaf = entries[table_index(virt, LEVEL_COUNT - 1)];
        if !leaf.is_valid() {
            return Err(MapError::NotMapped);
        }
        entries[table_index(virt, LEVEL_COUNT - 1)] = Entry::empty();
        ctx.tlb.invalidate_range(virt, 1);

        // Walk back up releasing tables that just became empty. The root is
        // never released.
        for level in (1..LEVEL_COUNT).rev() {
            let entries = unsafe { table_mut(ctx.dmap, path[level]) };
            if entries.iter().any(|e| e.is_valid()) {
                break;
            }
            let parent = unsafe { table_mut(ctx.dmap, path[level - 1]) };
            parent[table_index(virt, level - 1)] = Entry::empty();
            frames.free_table_frame(path[level]);
        }

        Ok(leaf.frame())
    }

    /// Remove a 2 MiB block mapping, returning its base frame.
    pub fn unmap_block(
        &mut self,
        ctx: &MmuContext,
        frames: &dyn interface::TableFrameSource,
        virt: VirtAddr,
    ) -> Result<PhysAddr, MapError> {
        let block_bytes = BLOCK_PAGES * Granule::SIZE;
        assert!(virt.as_usize() % block_bytes == 0);

        let mut path = [Address::zero(); LEVEL_COUNT - 1];
        let mut table = self.root;
        for level in 0..LEVEL_COUNT - 2 {
            path[level] = table;
            let entry = unsafe { table_mut(ctx.dmap, table) }[table_index(virt, level)];
            if !entry.is_valid() || entry.is_block() {
                return Err(MapError::NotMapped);
            }
            table = entry.frame();
        }
        path[LEVEL_COUNT - 2] = table;

        let entries = unsafe { table_mut(ctx.dmap, table) };
        let entry = entries[table_index(virt, LEVEL_COUNT - 2)];
        if !entry.is_valid() || !entry.is_block() {
            return Err(MapError::NotMapped);
        }
        entries[table_index(virt, LEVEL_COUNT - 2)] = Entry::empty();
        ctx.tlb.invalidate_range(virt, BLOCK_PAGES);

        for level in (1..LEVEL_COUNT - 1).rev() {
            let entries = unsafe { table_mut(ctx.dmap, path[level]) };
            if entries.iter().any(|e| e.is_valid()) {
                break;
            }
            let parent = unsafe { table_mut(ctx.dmap, path[level - 1]) };
            parent[table_index(virt, level - 1)] = Entry::empty();
            frames.free_table_frame(path[level]);
        }

        Ok(entry.frame())
    }

    /// Walk the tables for `virt`. Returns the physical address (page or
    /// block granularity, plus offset) or `None` if unmapped.
    pub fn translate(&self, ctx: &MmuContext, virt: VirtAddr) -> Option<PhysAddr> {
        let mut table = self.root;
        for level in 0..LEVEL_COUNT {
            let entry = unsafe { table_mut(ctx.dmap, table) }[table_index(virt, level)];
            if !entry.is_valid() {
                return None;
            }
            if level == LEVEL_COUNT - 1 {
                return Some(entry.frame() + virt.offset_into_page());
            }
            if entry.is_block() {
                let block_mask = BLOCK_PAGES * Granule::SIZE - 1;
                return Some(entry.frame() + (virt.as_usize() & block_mask));
            }
            table = entry.frame();
        }
        None
    }

    /// Base virtual address of the block mapping whose range contains
    /// `virt`, or `None` when the walk ends at a leaf, a hole, or never
    /// meets a block entry. Range owners use this to decide whether an
    /// overwrite or unmap covers a block entirely before dissolving it.
    pub fn covering_block(&self, ctx: &MmuContext, virt: VirtAddr) -> Option<VirtAddr> {
        let mut table = self.root;
        for level in 0..LEVEL_COUNT - 1 {
            let entry = unsafe { table_mut(ctx.dmap, table) }[table_index(virt, level)];
            if !entry.is_valid() {
                return None;
            }
            if entry.is_block() {
                return Some(Address::new(crate::mm::align_down(
                    virt.as_usize(),
                    BLOCK_PAGES * Granule::SIZE,
                )));
            }
            table = entry.frame();
        }
        None
    }

    /// Copy `count` root entries starting at `start` from another table.
    ///
    /// This is how a space mirrors the kernel half of the address space on
    /// `swap_in`: the shared upper-half tables are referenced, not cloned.
    pub fn copy_root_entries(
        &mut self,
        ctx: &MmuContext,
        from: &TranslationTable,
        start: usize,
        count: usize,
    ) {
        assert!(start + count <= TABLE_LEN);
        let src = unsafe { table_mut(ctx.dmap, from.root) };
        let dst = unsafe { table_mut(ctx.dmap, self.root) };
        dst[start..start + count].copy_from_slice(&src[start..start + count]);
    }

    /// Release every table frame reachable from the root, including the
    /// root itself. Leaf target frames are untouched; they belong to their
    /// owners. The table must not be used afterwards.
    pub fn release(&self, ctx: &MmuContext, frames: &dyn interface::TableFrameSource) {
        fn release_level(
            ctx: &MmuContext,
            frames: &dyn interface::TableFrameSource,
            table: PhysAddr,
            level: usize,
        ) {
            if level < LEVEL_COUNT - 1 {
                let entries = unsafe { table_mut(ctx.dmap, table) };
                for entry in entries.iter() {
                    if entry.is_valid() && !entry.is_block() {
                        release_level(ctx, frames, entry.frame(), level + 1);
                    }
                }
            }
            frames.free_table_frame(table);
        }
        release_level(ctx, frames, self.root, 0);
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------
