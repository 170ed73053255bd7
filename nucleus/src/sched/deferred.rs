/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! Deferred thread reclamation.
//!
//! A thread whose reference count reaches zero is not freed on the spot:
//! the scheduler (or an interrupt frame) may still hold a transient
//! pointer to it. Instead its handle is queued here and the worker runs at
//! a quiet point: the idle loop in production, explicitly in tests.

use {
    super::thread::{ThreadId, ThreadTable},
    alloc::vec::Vec,
    machine::synchronization::{interface::Mutex, IRQSafeSpinLock},
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// The queue of threads awaiting reclamation.
pub struct DeferredReaper {
    pending: IRQSafeSpinLock<Vec<ThreadId>>,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl DeferredReaper {
    pub const fn new() -> Self {
        Self {
            pending: IRQSafeSpinLock::new(Vec::new()),
        }
    }

    /// Queue a zero-reference thread for reclamation.
    pub fn schedule(&self, id: ThreadId) {
        log::trace!("{:?} queued for reclamation", id);
        self.pending.lock(|p| p.push(id));
    }

    /// Reclaim everything queued so far. Returns how many threads were
    /// torn out of the arena; destroy waiters are woken as part of
    /// removal.
    pub fn run_pending(&self, table: &ThreadTable) -> usize {
        let batch: Vec<ThreadId> = self.pending.lock(core::mem::take);
        let mut reaped = 0;
        for id in batch {
            if table.remove(id).is_some() {
                reaped += 1;
            }
        }
        reaped
    }

    /// Whether anything is queued.
    pub fn is_idle(&self) -> bool {
        self.pending.lock(|p| p.is_empty())
    }
}

impl Default for DeferredReaper {
    fn default() -> Self {
        Self::new()
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------
