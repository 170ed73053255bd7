/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! Channel monitors and futexes.
//!
//! A monitor receives level- or edge-triggered notifications for the four
//! channel conditions and can additionally be armed for a one-shot futex
//! wake, which is how the user-space event loop suspends cooperative work
//! items. Futex queues are keyed by physical address, so processes sharing
//! a mapping contend on the same queue.

use {
    crate::{
        error::{Result, Status},
        mm::AddressSpace,
        sched::{
            thread::{Thread, Timeout},
            wait_queue::WaitQueue,
        },
    },
    alloc::{collections::BTreeMap, sync::Arc},
    bitflags::bitflags,
    machine::{
        memory::{mmu::interface::DirectMap, PhysAddr, VirtAddr},
        synchronization::{interface::Mutex, IRQSafeSpinLock},
    },
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

bitflags! {
    /// Channel conditions a monitor can watch.
    pub struct ChannelEvents: u32 {
        const PEER_CLOSED           = 1 << 0;
        const MESSAGE_ARRIVED       = 1 << 1;
        const QUEUE_SPACE_AVAILABLE = 1 << 2;
        const ITEM_DELETED          = 1 << 3;
    }
}

/// How a monitor reports.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TriggerMode {
    /// Conditions stay visible until acknowledged.
    Level,
    /// Only 0->1 transitions are reported; polling drains.
    Edge,
}

/// An event sink associated with a channel endpoint.
pub struct Monitor {
    mode: TriggerMode,
    inner: IRQSafeSpinLock<MonitorInner>,
    waitq: WaitQueue,
}

/// Futex wait queues, keyed by physical address.
pub struct FutexTable {
    dmap: &'static dyn DirectMap,
    queues: IRQSafeSpinLock<BTreeMap<usize, Arc<WaitQueue>>>,
}

//--------------------------------------------------------------------------------------------------
// Private Definitions
//--------------------------------------------------------------------------------------------------

struct MonitorInner {
    interest: ChannelEvents,
    pending: ChannelEvents,
    /// Armed one-shot futex wake.
    futex_wake: Option<(&'static FutexTable, PhysAddr)>,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl Monitor {
    pub fn new(mode: TriggerMode, interest: ChannelEvents) -> Arc<Self> {
        Arc::new(Self {
            mode,
            inner: IRQSafeSpinLock::new(MonitorInner {
                interest,
                pending: ChannelEvents::empty(),
                futex_wake: None,
            }),
            waitq: WaitQueue::new(),
        })
    }

    pub fn mode(&self) -> TriggerMode {
        self.mode
    }

    /// Change the monitored-events bitmap.
    pub fn set_interest(&self, interest: ChannelEvents) {
        self.inner.lock(|i| i.interest = interest);
    }

    /// Deliver conditions from the channel side. Uninteresting bits are
    /// dropped; in edge mode only fresh bits wake anyone.
    pub fn notify(&self, events: ChannelEvents) {
        let (wake, futex) = self.inner.lock(|i| {
            let masked = events & i.interest;
            if masked.is_empty() {
                return (false, None);
            }
            let fresh = masked - i.pending;
            i.pending |= masked;
            let wake = match self.mode {
                TriggerMode::Level => true,
                TriggerMode::Edge => !fresh.is_empty(),
            };
            let futex = if wake { i.futex_wake.take() } else { None };
            (wake, futex)
        });

        if wake {
            self.waitq.wake_all();
        }
        if let Some((table, addr)) = futex {
            table.wake_phys(addr, 1);
        }
    }

    /// Read pending conditions. Edge mode drains them; level mode leaves
    /// them for [`Self::acknowledge`].
    pub fn poll(&self) -> ChannelEvents {
        self.inner.lock(|i| match self.mode {
            TriggerMode::Level => i.pending,
            TriggerMode::Edge => core::mem::replace(&mut i.pending, ChannelEvents::empty()),
        })
    }

    /// Clear level-triggered conditions the consumer has dealt with.
    pub fn acknowledge(&self, events: ChannelEvents) {
        self.inner.lock(|i| i.pending -= events);
    }

    /// Arm a single futex wake for the next delivered event.
    pub fn arm_futex_wake(&self, table: &'static FutexTable, addr: PhysAddr) {
        self.inner.lock(|i| i.futex_wake = Some((table, addr)));
    }

    /// Threads parked here wake on every delivery.
    pub fn waitq(&self) -> &WaitQueue {
        &self.waitq
    }
}

impl FutexTable {
    pub fn new(dmap: &'static dyn DirectMap) -> Self {
        Self {
            dmap,
            queues: IRQSafeSpinLock::new(BTreeMap::new()),
        }
    }

    fn queue_for(&self, phys: PhysAddr) -> Arc<WaitQueue> {
        self.queues.lock(|queues| {
            Arc::clone(
                queues
                    .entry(phys.as_usize())
                    .or_insert_with(|| Arc::new(WaitQueue::new())),
            )
        })
    }

    fn read_word(&self, phys: PhysAddr) -> u64 {
        // The word is naturally aligned by contract; cross-page reads are
        // rejected before we get here.
        unsafe { (self.dmap.ptr_of(phys) as *const u64).read_volatile() }
    }

    /// Park `current` until the futex at `addr` (in `space`) is woken,
    /// unless the word no longer holds `expected`.
    pub fn wait(
        &self,
        current: &Arc<Thread>,
        space: &AddressSpace,
        addr: VirtAddr,
        expected: u64,
        timeout: Timeout,
    ) -> Result<()> {
        if addr.as_usize() % 8 != 0 {
            return Err(Status::InvalidArgument);
        }
        let phys = space.translate(addr).ok_or(Status::InvalidArgument)?;
        if self.read_word(phys) != expected {
            return Err(Status::WouldBlock);
        }

        let queue = self.queue_for(phys);
        current.prepare_wait(&queue, timeout)?;
        // Re-check: a racing waker may have changed the word and drained
        // the queue before our waiter was registered.
        if self.read_word(phys) != expected {
            current.cancel_wait();
            return Err(Status::WouldBlock);
        }
        current.commit_wait()
    }

    /// Wake up to `count` waiters of the futex at `addr` in `space`.
    pub fn wake(&self, space: &AddressSpace, addr: VirtAddr, count: usize) -> Result<usize> {
        let phys = space.translate(addr).ok_or(Status::InvalidArgument)?;
        Ok(self.wake_phys(phys, count))
    }

    /// Wake by physical key (monitor one-shot path).
    pub fn wake_phys(&self, phys: PhysAddr, count: usize) -> usize {
        let queue = self.queues.lock(|queues| queues.get(&phys.as_usize()).cloned());
        match queue {
            Some(queue) => queue.wake_many(count),
            None => 0,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------
