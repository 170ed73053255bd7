/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! Deadline-ordered timer queue.
//!
//! Armed callbacks fire from [`TimerQueue::fire_due`], which the tick
//! interrupt (or a test) calls with the clock at its current reading.
//! Cancellation and firing race cleanly: whichever side removes the entry
//! under the lock wins, so a callback is either run exactly once or
//! swallowed exactly once, never both.

use {
    alloc::{boxed::Box, collections::BTreeMap, vec::Vec},
    core::time::Duration,
    machine::{
        synchronization::{interface::Mutex, IRQSafeSpinLock},
        time::{interface::MonotonicClock, Instant},
    },
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Handle for cancelling an armed timer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TimerId(u64);

/// The pending-timeout queue.
pub struct TimerQueue {
    clock: &'static dyn MonotonicClock,
    inner: IRQSafeSpinLock<TimerQueueInner>,
}

//--------------------------------------------------------------------------------------------------
// Private Definitions
//--------------------------------------------------------------------------------------------------

type TimerCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TimerQueueInner {
    next_id: u64,
    /// Keyed by (deadline, id) so equal deadlines stay ordered by arming
    /// order.
    due: BTreeMap<(Instant, u64), TimerCallback>,
    deadlines: BTreeMap<u64, Instant>,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl TimerQueue {
    pub fn new(clock: &'static dyn MonotonicClock) -> Self {
        Self {
            clock,
            inner: IRQSafeSpinLock::new(TimerQueueInner::default()),
        }
    }

    /// The clock this queue runs on.
    pub fn clock(&self) -> &'static dyn MonotonicClock {
        self.clock
    }

    /// Arm `callback` to fire once `deadline` is reached.
    pub fn arm(&self, deadline: Instant, callback: impl FnOnce() + Send + 'static) -> TimerId {
        self.inner.lock(|inner| {
            let id = inner.next_id;
            inner.next_id += 1;
            inner.due.insert((deadline, id), Box::new(callback));
            inner.deadlines.insert(id, deadline);
            TimerId(id)
        })
    }

    /// Arm relative to now.
    pub fn arm_after(&self, after: Duration, callback: impl FnOnce() + Send + 'static) -> TimerId {
        self.arm(self.clock.now() + after, callback)
    }

    /// Disarm. Returns `true` when the callback was still pending (and is
    /// now swallowed), `false` when it has already fired or was cancelled.
    pub fn cancel(&self, id: TimerId) -> bool {
        self.inner.lock(|inner| {
            match inner.deadlines.remove(&id.0) {
                None => false,
                Some(deadline) => inner.due.remove(&(deadline, id.0)).is_some(),
            }
        })
    }

    /// Run every callback whose deadline has passed. Returns how many
    /// fired. Callbacks run outside the queue lock, in deadline order.
    pub fn fire_due(&self) -> usize {
        let now = self.clock.now();
        let ready: Vec<TimerCallback> = self.inner.lock(|inner| {
            let mut ready = Vec::new();
            while let Some((&(deadline, id), _)) = inner.due.iter().next() {
                if deadline > now {
                    break;
                }
                ready.push(inner.due.remove(&(deadline, id)).unwrap());
                inner.deadlines.remove(&id);
            }
            ready
        });
        let count = ready.len();
        for callback in ready {
            callback();
        }
        count
    }

    /// Earliest pending deadline, for re-arming the hardware timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner
            .lock(|inner| inner.due.keys().next().map(|&(deadline, _)| deadline))
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use {
        super::*,
        core::sync::atomic::{AtomicUsize, Ordering},
        machine::hosted::HostedClock,
        std::sync::Arc,
    };

    fn queue() -> (&'static HostedClock, TimerQueue) {
        let clock = HostedClock::leak();
        (clock, TimerQueue::new(clock))
    }

    #[test]
    fn fires_only_once_time_arrives() {
        let (clock, timers) = queue();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        timers.arm_after(Duration::from_millis(10), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(timers.fire_due(), 0);
        clock.advance(Duration::from_millis(9));
        assert_eq!(timers.fire_due(), 0);
        clock.advance(Duration::from_millis(1));
        assert_eq!(timers.fire_due(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // Spent timers never fire twice.
        clock.advance(Duration::from_secs(1));
        assert_eq!(timers.fire_due(), 0);
    }

    #[test]
    fn cancel_swallows_exactly_once() {
        let (clock, timers) = queue();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let id = timers.arm_after(Duration::from_millis(5), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(timers.cancel(id));
        assert!(!timers.cancel(id));
        clock.advance(Duration::from_millis(10));
        assert_eq!(timers.fire_due(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_after_fire_reports_fired() {
        let (clock, timers) = queue();
        let id = timers.arm_after(Duration::from_millis(1), || {});
        clock.advance(Duration::from_millis(2));
        assert_eq!(timers.fire_due(), 1);
        assert!(!timers.cancel(id));
    }

    #[test]
    fn equal_deadlines_fire_in_arming_order() {
        let (clock, timers) = queue();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = Arc::clone(&order);
            timers.arm(Instant::from_nanos(100), move || {
                order.lock().unwrap().push(n);
            });
        }
        clock.advance(Duration::from_nanos(100));
        assert_eq!(timers.fire_due(), 3);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }
}
