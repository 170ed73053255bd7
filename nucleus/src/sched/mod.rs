/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! Threading and scheduling.
//!
//! [`wait_queue`] is the universal suspension primitive; [`thread`] holds
//! the lifecycle state machine and hook vector; [`scheduler`] owns the
//! per-CPU run queues and the switch paths; [`timer`] delivers timeouts;
//! [`deferred`] reclaims dead threads once nothing can still point at
//! them.

pub mod counter;
pub mod deferred;
pub mod scheduler;
pub mod thread;
pub mod timer;
pub mod wait_queue;

pub use {
    counter::Counter,
    deferred::DeferredReaper,
    scheduler::Scheduler,
    thread::{
        ExecState, HookKind, HookResult, HookSlot, Thread, ThreadFlags, ThreadId, ThreadTable,
        Timeout, WakeOutcome,
    },
    timer::{TimerId, TimerQueue},
    wait_queue::{WaitQueue, Waiter, WaiterToken},
};
