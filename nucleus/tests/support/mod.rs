/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! Hosted scenario harness.
//!
//! Kernel threads are backed by std threads. The harness claims hook slot
//! 0 of every thread it spawns (exactly the seam the production scheduler
//! occupies) and implements suspend as a condvar park of the backing
//! thread, resume/unblock/kill as a notify. Channel, wait-queue
//! and timeout semantics are therefore exercised end to end with real
//! concurrency, while the manually advanced clock keeps timeouts
//! deterministic.

use {
    machine::{
        cpu::ExecutionContext,
        hosted::{HostedClock, HostedCpu, HostedMemory},
        memory::Address,
    },
    nucleus::{
        kernel::{BootLayout, Kernel, Machine},
        sched::thread::{ExecState, HookResult, HookSlot, Thread, ThreadFlags},
    },
    std::{
        sync::{Arc, Condvar, Mutex, OnceLock},
        time::{Duration, Instant},
    },
};

/// Hook owner id used by the harness (it stands in for the scheduler).
pub const HARNESS_OWNER_ID: u64 = 0x484f_5354;

pub struct Host {
    pub kernel: &'static Kernel,
    pub clock: &'static HostedClock,
    pub mem: &'static HostedMemory,
}

/// A kernel thread driven by a std thread.
pub struct HostThread {
    pub thread: Arc<Thread>,
    join: std::thread::JoinHandle<()>,
}

#[derive(Default)]
struct ParkState {
    lock: Mutex<()>,
    cv: Condvar,
    backing: OnceLock<std::thread::ThreadId>,
}

impl ParkState {
    fn is_self(&self) -> bool {
        self.backing.get().copied() == Some(std::thread::current().id())
    }

    fn notify(&self) {
        let _guard = self.lock.lock().unwrap();
        self.cv.notify_all();
    }
}

/// Build a hosted kernel over `phys_pages` of fake RAM.
pub fn host(phys_pages: usize) -> Host {
    let mem = HostedMemory::leak(phys_pages);
    let clock = HostedClock::leak();
    let machine = Machine {
        dmap: mem,
        tlb: mem,
        clock,
        cpu: Box::leak(Box::new(HostedCpu::default())),
    };
    let (base, pages) = mem.boot_region();
    let kernel = Kernel::new(
        machine,
        BootLayout {
            memory_map: vec![(base, pages)],
            kernel_virt_base: Address::new(0xffff_9000_0000_0000),
            kernel_virt_pages: 256,
            user_virt_base: Address::new(0x0000_2000_0000),
            user_virt_pages: 256,
            quantum: Duration::from_millis(1),
        },
    );
    Host { kernel, clock, mem }
}

/// Spawn a kernel thread whose body runs on a dedicated std thread once
/// the thread is first resumed.
pub fn spawn(kernel: &'static Kernel, body: impl FnOnce(&Arc<Thread>) + Send + 'static) -> HostThread {
    let thread = kernel
        .threads
        .create(ExecutionContext::default(), Address::new(0), 0, false);
    let park = Arc::new(ParkState::default());

    let suspend_park = Arc::clone(&park);
    let block_park = Arc::clone(&park);
    let notify_park = Arc::clone(&park);
    let slot = thread.register_hooks(HookSlot {
        owner_id: HARNESS_OWNER_ID,
        suspend: Some(Arc::new(move |t: &Thread| {
            if suspend_park.is_self() {
                let mut guard = suspend_park.lock.lock().unwrap();
                while t.execution_state() == ExecState::Suspended {
                    guard = suspend_park.cv.wait(guard).unwrap();
                }
            }
            HookResult::Handled
        })),
        block: Some(Arc::new(move |t: &Thread| {
            if block_park.is_self() {
                let mut guard = block_park.lock.lock().unwrap();
                while t.flags().contains(ThreadFlags::BLOCKED)
                    && t.execution_state() != ExecState::Dead
                {
                    guard = block_park.cv.wait(guard).unwrap();
                }
            }
            HookResult::Handled
        })),
        resume: Some(Arc::new({
            let park = Arc::clone(&notify_park);
            move |_: &Thread| {
                park.notify();
                HookResult::Handled
            }
        })),
        unblock: Some(Arc::new({
            let park = Arc::clone(&notify_park);
            move |_: &Thread| {
                park.notify();
                HookResult::Handled
            }
        })),
        kill: Some(Arc::new({
            let park = Arc::clone(&notify_park);
            move |_: &Thread| {
                park.notify();
                HookResult::Handled
            }
        })),
        ..Default::default()
    });
    assert_eq!(slot, Some(0), "harness must own hook slot 0");

    let join = std::thread::spawn({
        let thread = Arc::clone(&thread);
        let park = Arc::clone(&park);
        move || {
            park.backing.set(std::thread::current().id()).unwrap();
            // Threads are created suspended; wait for the first resume.
            {
                let mut guard = park.lock.lock().unwrap();
                while thread.execution_state() == ExecState::Suspended {
                    guard = park.cv.wait(guard).unwrap();
                }
            }
            if thread.execution_state() == ExecState::Running {
                body(&thread);
            }
        }
    });

    HostThread { thread, join }
}

impl HostThread {
    /// Resume (start) the thread.
    pub fn start(&self) {
        self.thread.resume().unwrap();
    }

    pub fn join(self) {
        self.join.join().unwrap();
    }
}

/// Spawn a plain "current thread" for calling kernel ops from the test
/// body itself (it never parks; use no-wait operations only).
pub fn foreground(kernel: &'static Kernel) -> Arc<Thread> {
    let t = kernel
        .threads
        .create(ExecutionContext::default(), Address::new(0), 0, false);
    t.resume().unwrap();
    t
}

/// Busy-poll a condition with a real-time deadline.
pub fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for: {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// True once `thread` is parked on some wait queue.
pub fn is_parked(thread: &Arc<Thread>) -> bool {
    thread.execution_state() == ExecState::Suspended && thread.parked_on().is_some()
}
