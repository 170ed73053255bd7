/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! In-memory machine model for exercising the nucleus on a development
//! host.
//!
//! "Physical" memory is one aligned heap allocation; the direct map is the
//! identity between a fake physical window and that allocation. The clock
//! only moves when a test advances it, which makes timeout behavior exactly
//! reproducible.

use {
    crate::{
        cpu::{interface::CpuOps, CpuId, ExecutionContext, InterruptFrame},
        exception::asynchronous::{interface::IrqMask, IrqState},
        memory::{
            mmu::interface::{DirectMap, TlbMaintenance},
            Address, Granule, PhysAddr,
        },
        time::{interface::MonotonicClock, Instant},
    },
    core::{
        cell::Cell,
        sync::atomic::{AtomicU64, AtomicUsize, Ordering},
        time::Duration,
    },
    std::alloc::{alloc_zeroed, dealloc, Layout},
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Where the fake physical window starts. Far from zero so that arithmetic
/// slips are loud.
pub const PHYS_BASE: usize = 0x8000_0000;

/// A block of host memory standing in for machine RAM.
pub struct HostedMemory {
    base: *mut u8,
    bytes: usize,
    invalidations: AtomicUsize,
}

/// Manually advanced monotonic clock.
#[derive(Default)]
pub struct HostedClock {
    now_nanos: AtomicU64,
}

/// Per-host-thread IRQ mask depth counter. Masking has no effect on a
/// host, but the discipline (nesting, restore pairing) is still checked.
pub struct HostedIrqMask;

/// Single-CPU stand-in whose switch paths only count invocations.
#[derive(Default)]
pub struct HostedCpu {
    pub immediate_switches: AtomicUsize,
    pub deferred_switches: AtomicUsize,
    pub bootstrap_switches: AtomicUsize,
    pub timer_arms: AtomicUsize,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

unsafe impl Send for HostedMemory {}
unsafe impl Sync for HostedMemory {}

impl HostedMemory {
    /// Allocate `pages` pages of zeroed fake RAM.
    pub fn new(pages: usize) -> Self {
        let bytes = pages * Granule::SIZE;
        let layout = Layout::from_size_align(bytes, Granule::SIZE).unwrap();
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "host allocation failed");
        log::trace!("hosted RAM: {} pages at {:#x}", pages, PHYS_BASE);
        Self {
            base,
            bytes,
            invalidations: AtomicUsize::new(0),
        }
    }

    /// Leak into a `'static` reference, as the seams expect.
    pub fn leak(pages: usize) -> &'static Self {
        Box::leak(Box::new(Self::new(pages)))
    }

    /// The single "firmware" RAM region backing this model.
    pub fn boot_region(&self) -> (PhysAddr, usize) {
        (Address::new(PHYS_BASE), self.bytes / Granule::SIZE)
    }

    /// TLB invalidations observed so far.
    pub fn invalidation_count(&self) -> usize {
        self.invalidations.load(Ordering::Relaxed)
    }
}

impl Drop for HostedMemory {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.bytes, Granule::SIZE).unwrap();
        unsafe { dealloc(self.base, layout) };
    }
}

unsafe impl DirectMap for HostedMemory {
    fn ptr_of(&self, phys: PhysAddr) -> *mut u8 {
        assert!(
            self.covers(phys, 1),
            "direct-map access outside hosted RAM: {}",
            phys
        );
        unsafe { self.base.add(phys.as_usize() - PHYS_BASE) }
    }

    fn covers(&self, phys: PhysAddr, bytes: usize) -> bool {
        let p = phys.as_usize();
        p >= PHYS_BASE && p + bytes <= PHYS_BASE + self.bytes
    }
}

impl TlbMaintenance for HostedMemory {
    fn invalidate_range(&self, _virt: Address<crate::memory::Virtual>, _pages: usize) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    fn invalidate_all(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }
}

impl HostedClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leak into a `'static` reference, as the seams expect.
    pub fn leak() -> &'static Self {
        Box::leak(Box::new(Self::new()))
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        self.now_nanos
            .fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl MonotonicClock for HostedClock {
    fn now(&self) -> Instant {
        Instant::from_nanos(self.now_nanos.load(Ordering::SeqCst))
    }
}

std::thread_local! {
    static IRQ_DEPTH: Cell<u64> = const { Cell::new(0) };
}

impl IrqMask for HostedIrqMask {
    fn is_masked(&self) -> bool {
        IRQ_DEPTH.with(|d| d.get()) > 0
    }

    fn mask_save(&self) -> IrqState {
        IRQ_DEPTH.with(|d| {
            let prev = d.get();
            d.set(prev + 1);
            prev
        })
    }

    fn restore(&self, saved: IrqState) {
        IRQ_DEPTH.with(|d| d.set(saved));
    }
}

unsafe impl CpuOps for HostedCpu {
    fn current(&self) -> CpuId {
        CpuId::new(0)
    }

    fn count(&self) -> usize {
        1
    }

    unsafe fn switch_immediate(&self, _from: *mut ExecutionContext, _to: *const ExecutionContext) {
        self.immediate_switches.fetch_add(1, Ordering::Relaxed);
    }

    unsafe fn switch_deferred(
        &self,
        _frame: *mut InterruptFrame,
        _from: *mut ExecutionContext,
        _to: *const ExecutionContext,
    ) {
        self.deferred_switches.fetch_add(1, Ordering::Relaxed);
    }

    unsafe fn switch_bootstrap(&self, _frame: *mut InterruptFrame, _to: *const ExecutionContext) {
        self.bootstrap_switches.fetch_add(1, Ordering::Relaxed);
    }

    fn arm_preemption_timer(&self, _after: Duration) {
        self.timer_arms.fetch_add(1, Ordering::Relaxed);
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_map_roundtrip() {
        let mem = HostedMemory::new(4);
        let (base, pages) = mem.boot_region();
        assert_eq!(pages, 4);

        let p = base + Granule::SIZE;
        unsafe {
            *mem.ptr_of(p) = 0xa5;
            assert_eq!(*mem.ptr_of(p), 0xa5);
        }
        assert!(mem.covers(base, 4 * Granule::SIZE));
        assert!(!mem.covers(base, 5 * Granule::SIZE));
    }

    #[test]
    fn clock_only_moves_forward_when_told() {
        let clock = HostedClock::new();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);
        clock.advance(Duration::from_millis(5));
        assert_eq!(
            clock.now().saturating_duration_since(t0),
            Duration::from_millis(5)
        );
    }
}
