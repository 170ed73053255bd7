/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! Counting events.
//!
//! A counter is the semaphore-shaped client of the wait queue: `wait`
//! consumes one unit or parks, `post` adds one and hands it to the oldest
//! waiter.

use {
    super::{
        thread::{Thread, Timeout},
        wait_queue::WaitQueue,
    },
    crate::error::{Result, Status},
    alloc::sync::Arc,
    machine::synchronization::{interface::Mutex, IRQSafeSpinLock},
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// A counting event source.
pub struct Counter {
    count: IRQSafeSpinLock<u64>,
    waitq: Arc<WaitQueue>,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl Counter {
    pub fn new(initial: u64) -> Self {
        Self {
            count: IRQSafeSpinLock::new(initial),
            waitq: Arc::new(WaitQueue::new()),
        }
    }

    /// Consume one unit, parking until one is posted. `no_wait` turns the
    /// empty case into `WouldBlock`.
    pub fn wait(&self, current: &Arc<Thread>, no_wait: bool, timeout: Timeout) -> Result<()> {
        loop {
            let took = self.count.lock(|c| {
                if *c > 0 {
                    *c -= 1;
                    true
                } else {
                    false
                }
            });
            if took {
                return Ok(());
            }
            if no_wait {
                return Err(Status::WouldBlock);
            }

            current.prepare_wait(&self.waitq, timeout)?;
            let still_empty = self.count.lock(|c| *c == 0);
            if still_empty {
                current.commit_wait()?;
            } else {
                current.cancel_wait();
            }
        }
    }

    /// Add one unit and wake the oldest waiter.
    pub fn post(&self) {
        self.count.lock(|c| *c += 1);
        self.waitq.wake_one();
    }

    /// Current unit count (racy; diagnostics only).
    pub fn value(&self) -> u64 {
        self.count.lock(|c| *c)
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::sched::{thread::ThreadTable, timer::TimerQueue},
        machine::{cpu::ExecutionContext, hosted::HostedClock, memory::Address},
    };

    fn current() -> Arc<Thread> {
        let clock = HostedClock::leak();
        let timers: &'static TimerQueue = Box::leak(Box::new(TimerQueue::new(clock)));
        let table = ThreadTable::new(timers);
        let t = table.create(ExecutionContext::default(), Address::new(0), 0, false);
        t.resume().unwrap();
        core::mem::forget(table);
        t
    }

    #[test]
    fn wait_consumes_posted_units() {
        let t = current();
        let counter = Counter::new(2);
        counter.wait(&t, true, Timeout::None).unwrap();
        counter.wait(&t, true, Timeout::None).unwrap();
        assert_eq!(
            counter.wait(&t, true, Timeout::None).unwrap_err(),
            Status::WouldBlock
        );
        counter.post();
        counter.wait(&t, true, Timeout::None).unwrap();
        assert_eq!(counter.value(), 0);
    }
}
