/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! Per-CPU run queues and the three switch paths.
//!
//! Preemption is cooperative-within-interrupts: a thread leaves the CPU at
//! interrupt boundaries (the delayed path) or at explicit suspension
//! points (the immediate path); the bootstrap path synthesizes the very
//! first frame of a CPU. Each path re-arms the preemption timer before
//! control moves.
//!
//! The scheduler owns hook slot 0 of every thread it adopts; suspension,
//! resumption, blocking and death reach the run queues exclusively through
//! those hooks.

use {
    super::thread::{HookResult, HookSlot, Thread},
    alloc::{collections::VecDeque, sync::Arc, vec::Vec},
    core::time::Duration,
    machine::{
        cpu::{interface::CpuOps, CpuId, InterruptFrame},
        synchronization::{interface::Mutex, IRQSafeSpinLock},
    },
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Hook owner identifier used by the scheduler in every thread.
pub const SCHEDULER_OWNER_ID: u64 = 0x5343_4845_4455_4c52; // "SCHEDULR"

/// The kernel scheduler.
pub struct Scheduler {
    cpu_ops: &'static dyn CpuOps,
    quantum: Duration,
    cpus: Vec<CpuBlock>,
}

//--------------------------------------------------------------------------------------------------
// Private Definitions
//--------------------------------------------------------------------------------------------------

struct CpuBlock {
    inner: IRQSafeSpinLock<CpuSched>,
}

struct CpuSched {
    current: Option<Arc<Thread>>,
    idle: Option<Arc<Thread>>,
    run_queue: VecDeque<Arc<Thread>>,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl Scheduler {
    pub fn new(cpu_ops: &'static dyn CpuOps, quantum: Duration) -> Self {
        let cpus = (0..cpu_ops.count())
            .map(|_| CpuBlock {
                inner: IRQSafeSpinLock::new(CpuSched {
                    current: None,
                    idle: None,
                    run_queue: VecDeque::new(),
                }),
            })
            .collect();
        Self {
            cpu_ops,
            quantum,
            cpus,
        }
    }

    fn block(&self, cpu: CpuId) -> &CpuBlock {
        &self.cpus[cpu.as_usize()]
    }

    /// Install the per-CPU idle thread. It never enters the run queue.
    pub fn set_idle(&self, cpu: CpuId, idle: Arc<Thread>) {
        self.block(cpu).inner.lock(|s| s.idle = Some(idle));
    }

    /// Thread currently on `cpu`.
    pub fn current(&self, cpu: CpuId) -> Option<Arc<Thread>> {
        self.block(cpu).inner.lock(|s| s.current.clone())
    }

    /// Thread currently on the executing CPU.
    pub fn current_here(&self) -> Option<Arc<Thread>> {
        self.current(self.cpu_ops.current())
    }

    /// Runnable backlog of `cpu` (excluding current and idle).
    pub fn queued(&self, cpu: CpuId) -> usize {
        self.block(cpu).inner.lock(|s| s.run_queue.len())
    }

    /// Take responsibility for a thread's scheduling: claims hook slot 0.
    ///
    /// Must be called before anything else can register hooks, at thread
    /// creation.
    pub fn adopt(&'static self, thread: &Arc<Thread>) {
        let on_resume = {
            let sched: &'static Scheduler = self;
            let thread = Arc::downgrade(thread);
            move |_: &Thread| {
                if let Some(thread) = thread.upgrade() {
                    sched.make_runnable(thread);
                }
                HookResult::Handled
            }
        };
        let on_offline = {
            let sched: &'static Scheduler = self;
            let thread = Arc::downgrade(thread);
            move |_: &Thread| {
                if let Some(thread) = thread.upgrade() {
                    sched.take_offline(&thread);
                }
                HookResult::Handled
            }
        };

        let slot = thread.register_hooks(HookSlot {
            owner_id: SCHEDULER_OWNER_ID,
            resume: Some(Arc::new(on_resume)),
            unblock: Some({
                let sched: &'static Scheduler = self;
                let thread = Arc::downgrade(thread);
                Arc::new(move |_: &Thread| {
                    if let Some(thread) = thread.upgrade() {
                        if thread.should_run() {
                            sched.make_runnable(thread);
                        }
                    }
                    HookResult::Handled
                })
            }),
            suspend: Some(Arc::new(on_offline.clone())),
            block: Some(Arc::new(on_offline.clone())),
            kill: Some(Arc::new(on_offline)),
            ..Default::default()
        });
        assert_eq!(slot, Some(0), "scheduler must own hook slot 0");
    }

    /// Queue a runnable thread on its last CPU (or the caller's).
    pub fn make_runnable(&self, thread: Arc<Thread>) {
        let cpu = thread.last_cpu().unwrap_or_else(|| self.cpu_ops.current());
        let cpu = if cpu.as_usize() < self.cpus.len() {
            cpu
        } else {
            self.cpu_ops.current()
        };
        self.block(cpu).inner.lock(|s| {
            if s.run_queue.iter().any(|t| t.id() == thread.id()) {
                return;
            }
            log::trace!("{:?} runnable on cpu {}", thread.id(), cpu.as_usize());
            s.run_queue.push_back(thread);
        });
    }

    /// Drop a thread from every queue it might sit on.
    fn take_offline(&self, thread: &Arc<Thread>) {
        for block in &self.cpus {
            block.inner.lock(|s| {
                s.run_queue.retain(|t| t.id() != thread.id());
            });
        }
    }

    /// Immediate (voluntary) switch: the current thread reached a
    /// suspension point. Saves into its context, loads the next, re-arms
    /// the timer.
    pub fn switch_now(&self) {
        let cpu = self.cpu_ops.current();
        let (from, from_is_idle, to) = self.block(cpu).inner.lock(|s| {
            let from = s.current.clone();
            let from_is_idle =
                s.idle.as_ref().map(|i| i.id()) == from.as_ref().map(|t| t.id());
            let next = Self::pick_locked(s);
            s.current = Some(Arc::clone(&next));
            next.set_last_cpu(cpu);
            (from, from_is_idle, next)
        });

        self.cpu_ops.arm_preemption_timer(self.quantum);
        if let Some(from) = from {
            if from.id() == to.id() {
                return;
            }
            if from.should_run() && !from_is_idle {
                self.make_runnable(Arc::clone(&from));
            }
            unsafe {
                self.cpu_ops.switch_immediate(from.context_ptr(), to.context_ptr());
            }
        } else {
            let mut frame = InterruptFrame::default();
            unsafe {
                self.cpu_ops.switch_bootstrap(&mut frame, to.context_ptr());
            }
        }
    }

    /// Delayed switch from the preemption tick: patch the live interrupt
    /// frame to resume the next thread.
    pub fn preempt(&self, frame: &mut InterruptFrame) {
        let cpu = self.cpu_ops.current();
        let (from, from_is_idle, to) = self.block(cpu).inner.lock(|s| {
            let from = s.current.clone();
            let from_is_idle =
                s.idle.as_ref().map(|i| i.id()) == from.as_ref().map(|t| t.id());
            let next = Self::pick_locked(s);
            s.current = Some(Arc::clone(&next));
            next.set_last_cpu(cpu);
            (from, from_is_idle, next)
        });

        self.cpu_ops.arm_preemption_timer(self.quantum);
        match from {
            Some(from) if from.id() == to.id() => {}
            Some(from) => {
                if from.should_run() && !from_is_idle {
                    self.make_runnable(Arc::clone(&from));
                }
                unsafe {
                    self.cpu_ops
                        .switch_deferred(frame, from.context_ptr(), to.context_ptr());
                }
            }
            None => unsafe {
                self.cpu_ops.switch_bootstrap(frame, to.context_ptr());
            },
        }
    }

    /// First entry on a CPU: no current thread, synthesized frame.
    pub fn bootstrap(&self, frame: &mut InterruptFrame) {
        let cpu = self.cpu_ops.current();
        let to = self.block(cpu).inner.lock(|s| {
            debug_assert!(s.current.is_none());
            let next = Self::pick_locked(s);
            s.current = Some(Arc::clone(&next));
            next.set_last_cpu(cpu);
            next
        });
        self.cpu_ops.arm_preemption_timer(self.quantum);
        unsafe {
            self.cpu_ops.switch_bootstrap(frame, to.context_ptr());
        }
    }

    //----------------------------------------------------------------------------------------------
    // Private Code
    //----------------------------------------------------------------------------------------------

    /// Next runnable thread, or the idle thread. Stale entries (suspended,
    /// blocked or dead while queued) are discarded on the way.
    fn pick_locked(s: &mut CpuSched) -> Arc<Thread> {
        while let Some(candidate) = s.run_queue.pop_front() {
            if candidate.should_run() {
                return candidate;
            }
        }
        Arc::clone(s.idle.as_ref().expect("cpu has no idle thread"))
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------
