/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! Sub-page kernel object allocator.
//!
//! A size-class free-list allocator layered over an address space. Classes
//! are powers of two from 16 bytes up to half a page; anything larger is
//! backed by whole pages straight from the space. Class blocks are carved
//! from pool pages on demand and stay with the pool once carved; a free
//! returns the block to its class list and restores the exact accounting
//! of the matching allocate.

use {
    super::{address_space::AddressSpace, frame::FrameAllocator},
    crate::error::{Result, Status},
    alloc::{collections::BTreeMap, sync::Arc, vec::Vec},
    bitflags::bitflags,
    machine::{
        memory::{mmu::interface::DirectMap, mmu::PageFlags, Address, Granule, VirtAddr},
        synchronization::{interface::Mutex, IRQSafeSpinLock},
    },
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

bitflags! {
    /// Allocation behavior flags.
    pub struct PoolFlags: u32 {
        /// Back the allocation with physically contiguous frames.
        const PHYSICALLY_CONTIGUOUS = 1 << 0;
        /// Bind backing frames eagerly; the allocation must never take a
        /// demand fault.
        const PREBOUND = 1 << 1;
    }
}

/// A successful pool allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Allocation {
    pub addr: VirtAddr,
    /// Actual usable bytes, >= the requested count.
    pub actual: usize,
}

/// The kernel object heap.
pub struct MemoryPool {
    space: Arc<AddressSpace>,
    frames: &'static FrameAllocator,
    dmap: &'static dyn DirectMap,
    inner: IRQSafeSpinLock<PoolInner>,
}

//--------------------------------------------------------------------------------------------------
// Private Definitions
//--------------------------------------------------------------------------------------------------

/// Smallest class: 16 bytes.
const MIN_CLASS_SHIFT: usize = 4;
/// Largest sub-page class: 2048 bytes.
const MAX_CLASS_SHIFT: usize = Granule::SHIFT - 1;
const CLASS_COUNT: usize = MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1;

struct PoolInner {
    /// Free blocks per class, by address value.
    classes: [Vec<usize>; CLASS_COUNT],
    /// Live allocations, by address value.
    live: BTreeMap<usize, Backing>,
}

#[derive(Copy, Clone, Debug)]
enum Backing {
    /// A class block of 2^shift bytes.
    Class { shift: usize },
    /// Whole pages allocated from the space.
    Pages { pages: usize },
    /// Whole pages over one contiguous physical run.
    ContiguousPages { pages: usize },
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl MemoryPool {
    pub fn new(
        space: Arc<AddressSpace>,
        frames: &'static FrameAllocator,
        dmap: &'static dyn DirectMap,
    ) -> Self {
        Self {
            space,
            frames,
            dmap,
            inner: IRQSafeSpinLock::new(PoolInner {
                classes: core::array::from_fn(|_| Vec::new()),
                live: BTreeMap::new(),
            }),
        }
    }

    /// Allocate at least `nbytes`, aligned to 2^`align_power`, not crossing
    /// any address divisible by 2^`boundary_align_power` (values above 63
    /// mean unconstrained; zero imposes the always-satisfied one-byte
    /// boundary).
    pub fn allocate(
        &self,
        nbytes: usize,
        align_power: u8,
        boundary_align_power: u8,
        flags: PoolFlags,
    ) -> Result<Allocation> {
        if nbytes == 0 || align_power > 63 {
            return Err(Status::InvalidArgument);
        }
        if flags.contains(PoolFlags::PHYSICALLY_CONTIGUOUS | PoolFlags::PREBOUND) {
            return Err(Status::InvalidArgument);
        }

        let want = nbytes.max(1usize << align_power);
        let allocation = if want > 1 << MAX_CLASS_SHIFT || flags.contains(PoolFlags::PHYSICALLY_CONTIGUOUS)
        {
            self.allocate_pages(want, flags)?
        } else {
            self.allocate_class(class_shift_for(want))?
        };

        if !boundary_satisfied(allocation.actual, boundary_align_power) {
            self.free(allocation.addr)?;
            return Err(Status::InvalidArgument);
        }
        debug_assert_eq!(allocation.addr.as_usize() & ((1usize << align_power) - 1), 0);
        Ok(allocation)
    }

    /// Resize an allocation, possibly moving it. `old = None` behaves as
    /// [`Self::allocate`].
    pub fn reallocate(
        &self,
        old: Option<VirtAddr>,
        new_nbytes: usize,
        align_power: u8,
        boundary_align_power: u8,
        flags: PoolFlags,
    ) -> Result<Allocation> {
        let old = match old {
            None => return self.allocate(new_nbytes, align_power, boundary_align_power, flags),
            Some(old) => old,
        };

        let backing = self
            .inner
            .lock(|inner| inner.live.get(&old.as_usize()).copied())
            .ok_or(Status::InvalidArgument)?;
        let old_actual = backing.actual_bytes();
        if new_nbytes <= old_actual && new_nbytes > old_actual / 2 {
            return Ok(Allocation {
                addr: old,
                actual: old_actual,
            });
        }

        let fresh = self.allocate(new_nbytes, align_power, boundary_align_power, flags)?;
        self.copy_between(old, fresh.addr, old_actual.min(new_nbytes));
        self.free(old)?;
        Ok(fresh)
    }

    /// Release an allocation. The address must come from a prior allocate
    /// on this pool.
    pub fn free(&self, addr: VirtAddr) -> Result<()> {
        let backing = self
            .inner
            .lock(|inner| {
                let backing = inner.live.remove(&addr.as_usize())?;
                if let Backing::Class { shift } = backing {
                    inner.classes[shift - MIN_CLASS_SHIFT].push(addr.as_usize());
                }
                Some(backing)
            })
            .ok_or(Status::InvalidArgument)?;

        match backing {
            Backing::Class { .. } => {}
            Backing::Pages { pages } => self.space.free(addr, pages)?,
            Backing::ContiguousPages { pages } => {
                let phys = self.space.translate(addr).ok_or(Status::InvalidArgument)?;
                self.space.unmap(addr, pages)?;
                self.frames.free(phys, pages);
            }
        }
        Ok(())
    }

    /// Bytes currently handed out.
    pub fn live_bytes(&self) -> usize {
        self.inner
            .lock(|inner| inner.live.values().map(|b| b.actual_bytes()).sum())
    }

    //----------------------------------------------------------------------------------------------
    // Private Code
    //----------------------------------------------------------------------------------------------

    fn allocate_class(&self, shift: usize) -> Result<Allocation> {
        let index = shift - MIN_CLASS_SHIFT;
        loop {
            let grabbed = self.inner.lock(|inner| {
                let block = inner.classes[index].pop()?;
                inner.live.insert(block, Backing::Class { shift });
                Some(block)
            });
            if let Some(block) = grabbed {
                return Ok(Allocation {
                    addr: Address::new(block),
                    actual: 1 << shift,
                });
            }

            // Class exhausted: pull one page from the space and carve it.
            // Growth happens outside the pool lock; a racing grower just
            // donates extra blocks.
            let page = self.space.allocate(1, PageFlags::empty())?;
            self.inner.lock(|inner| {
                let mut offset = 0;
                while offset < Granule::SIZE {
                    inner.classes[index].push(page.as_usize() + offset);
                    offset += 1 << shift;
                }
            });
        }
    }

    fn allocate_pages(&self, want: usize, flags: PoolFlags) -> Result<Allocation> {
        let pages = (want + Granule::SIZE - 1) / Granule::SIZE;
        let (addr, backing) = if flags.contains(PoolFlags::PHYSICALLY_CONTIGUOUS) {
            let phys = self.frames.allocate(pages)?;
            let addr = match self.space.map_any(phys, pages, PageFlags::empty()) {
                Ok(addr) => addr,
                Err(err) => {
                    self.frames.free(phys, pages);
                    return Err(err);
                }
            };
            (addr, Backing::ContiguousPages { pages })
        } else {
            (
                self.space.allocate(pages, PageFlags::empty())?,
                Backing::Pages { pages },
            )
        };

        self.inner
            .lock(|inner| inner.live.insert(addr.as_usize(), backing));
        Ok(Allocation {
            addr,
            actual: pages * Granule::SIZE,
        })
    }

    fn copy_between(&self, from: VirtAddr, to: VirtAddr, mut bytes: usize) {
        let mut src = from;
        let mut dst = to;
        while bytes > 0 {
            let src_chunk = Granule::SIZE - src.offset_into_page();
            let dst_chunk = Granule::SIZE - dst.offset_into_page();
            let chunk = bytes.min(src_chunk).min(dst_chunk);
            let src_phys = self.space.translate(src).expect("pool memory unbacked");
            let dst_phys = self.space.translate(dst).expect("pool memory unbacked");
            unsafe {
                core::ptr::copy_nonoverlapping(
                    self.dmap.ptr_of(src_phys),
                    self.dmap.ptr_of(dst_phys),
                    chunk,
                );
            }
            src = src + chunk;
            dst = dst + chunk;
            bytes -= chunk;
        }
    }
}

impl Backing {
    fn actual_bytes(self) -> usize {
        match self {
            Backing::Class { shift } => 1 << shift,
            Backing::Pages { pages } | Backing::ContiguousPages { pages } => pages * Granule::SIZE,
        }
    }
}

/// Natural class for a byte count within the sub-page range.
fn class_shift_for(bytes: usize) -> usize {
    let shift = bytes.next_power_of_two().trailing_zeros() as usize;
    shift.max(MIN_CLASS_SHIFT)
}

/// Whether an aligned block of `actual` bytes avoids crossing 2^`power`
/// boundaries.
fn boundary_satisfied(actual: usize, power: u8) -> bool {
    if power == 0 || power > 63 {
        return true;
    }
    actual <= 1usize << power
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use {
        super::*,
        machine::{hosted::HostedMemory, memory::Virtual},
    };

    fn pool() -> MemoryPool {
        let mem = HostedMemory::leak(256);
        let (base, pages) = mem.boot_region();
        let frames: &'static FrameAllocator =
            Box::leak(Box::new(FrameAllocator::new(mem, &[(base, pages)])));
        let space = Arc::new(
            AddressSpace::new(
                mem,
                mem,
                frames,
                Address::<Virtual>::new(0x5000_0000),
                128,
                None,
            )
            .unwrap(),
        );
        MemoryPool::new(space, frames, mem)
    }

    #[test]
    fn small_allocations_are_naturally_aligned() {
        let pool = pool();
        let a = pool.allocate(24, 5, 64, PoolFlags::empty()).unwrap();
        assert!(a.actual >= 24);
        assert_eq!(a.addr.as_usize() % 32, 0);

        let b = pool.allocate(24, 5, 64, PoolFlags::empty()).unwrap();
        assert_ne!(a.addr, b.addr);

        pool.free(a.addr).unwrap();
        pool.free(b.addr).unwrap();
        assert_eq!(pool.live_bytes(), 0);
    }

    #[test]
    fn free_restores_exact_accounting() {
        let pool = pool();
        let a = pool.allocate(100, 0, 64, PoolFlags::empty()).unwrap();
        assert_eq!(a.actual, 128);
        assert_eq!(pool.live_bytes(), 128);
        pool.free(a.addr).unwrap();
        assert_eq!(pool.live_bytes(), 0);

        // The block comes straight back for the next same-class request.
        let b = pool.allocate(100, 0, 64, PoolFlags::empty()).unwrap();
        assert_eq!(a.addr, b.addr);
        pool.free(b.addr).unwrap();
    }

    #[test]
    fn large_requests_take_whole_pages() {
        let pool = pool();
        let a = pool.allocate(3 * Granule::SIZE + 1, 0, 64, PoolFlags::empty()).unwrap();
        assert_eq!(a.actual, 4 * Granule::SIZE);
        assert!(a.addr.is_page_aligned());
        pool.free(a.addr).unwrap();
    }

    #[test]
    fn boundary_and_flag_validation() {
        let pool = pool();
        // 48 bytes cannot avoid crossing 32-byte boundaries.
        assert_eq!(
            pool.allocate(48, 0, 5, PoolFlags::empty()),
            Err(Status::InvalidArgument)
        );
        // Zero boundary is the always-satisfied one-byte boundary.
        assert!(pool.allocate(48, 0, 0, PoolFlags::empty()).is_ok());
        // The two flags are mutually exclusive.
        assert_eq!(
            pool.allocate(
                64,
                0,
                64,
                PoolFlags::PHYSICALLY_CONTIGUOUS | PoolFlags::PREBOUND
            ),
            Err(Status::InvalidArgument)
        );
        assert_eq!(pool.allocate(0, 0, 64, PoolFlags::empty()), Err(Status::InvalidArgument));
    }

    #[test]
    fn contiguous_allocations_are_contiguous() {
        let pool = pool();
        let a = pool
            .allocate(2 * Granule::SIZE, 0, 64, PoolFlags::PHYSICALLY_CONTIGUOUS)
            .unwrap();
        let p0 = pool.space.translate(a.addr).unwrap();
        let p1 = pool.space.translate(a.addr + Granule::SIZE).unwrap();
        assert_eq!(p1, p0 + Granule::SIZE);
        pool.free(a.addr).unwrap();
    }

    #[test]
    fn reallocate_preserves_contents() {
        let pool = pool();
        let a = pool.allocate(64, 0, 64, PoolFlags::empty()).unwrap();

        // Scribble through the direct map, then grow.
        let phys = pool.space.translate(a.addr).unwrap();
        unsafe {
            core::ptr::write_bytes(pool.dmap.ptr_of(phys), 0x5a, 64);
        }
        let b = pool
            .reallocate(Some(a.addr), 4096, 0, 64, PoolFlags::empty())
            .unwrap();
        assert!(b.actual >= 4096);

        let moved = pool.space.translate(b.addr).unwrap();
        let seen = unsafe { *pool.dmap.ptr_of(moved).add(63) };
        assert_eq!(seen, 0x5a);
        pool.free(b.addr).unwrap();

        // A reallocate of None is an allocate.
        let c = pool.reallocate(None, 16, 0, 64, PoolFlags::empty()).unwrap();
        pool.free(c.addr).unwrap();
    }
}
