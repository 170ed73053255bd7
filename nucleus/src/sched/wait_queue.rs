/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! The universal suspension primitive.
//!
//! A wait queue is an unbounded list of waiters, each carrying a callback.
//! Waking N waiters invokes each callback exactly once, in enqueue order,
//! and removes them from the queue. Adding the same waiter token twice is
//! not allowed.
//!
//! Callbacks run after the queue's lock has been dropped (so a callback may
//! resume a thread, which takes the thread's lock, without inverting the
//! thread -> wait-queue lock order) but still in enqueue order and still
//! exactly once: a waiter is either in the queue or its callback has been
//! handed off, never both.

use {
    alloc::{boxed::Box, collections::VecDeque, vec::Vec},
    machine::synchronization::{interface::Mutex, IRQSafeSpinLock},
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Identifies a waiter within one queue; typically a thread handle's raw
/// value. Must be unique among concurrently enqueued waiters.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WaiterToken(pub u64);

/// One parked entity.
pub struct Waiter {
    token: WaiterToken,
    callback: Box<dyn FnOnce() + Send>,
}

/// A list of waiters awakened by key events.
pub struct WaitQueue {
    inner: IRQSafeSpinLock<WaitQueueInner>,
}

/// The locked state, exposed so callers can compose "check condition and
/// park" atomically under a single lock hold.
#[derive(Default)]
pub struct WaitQueueInner {
    waiters: VecDeque<Waiter>,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

impl Waiter {
    pub fn new(token: WaiterToken, callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            token,
            callback: Box::new(callback),
        }
    }

    pub fn token(&self) -> WaiterToken {
        self.token
    }
}

impl WaitQueueInner {
    /// Append a waiter. The caller owns uniqueness of the token.
    pub fn add_locked(&mut self, waiter: Waiter) {
        debug_assert!(
            !self.waiters.iter().any(|w| w.token == waiter.token),
            "waiter enqueued twice"
        );
        self.waiters.push_back(waiter);
    }

    /// Remove a waiter by token without invoking its callback.
    pub fn remove_locked(&mut self, token: WaiterToken) -> Option<Waiter> {
        let at = self.waiters.iter().position(|w| w.token == token)?;
        self.waiters.remove(at)
    }

    /// Number of parked waiters.
    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            inner: IRQSafeSpinLock::new(WaitQueueInner {
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Run `f` with the queue locked.
    pub fn with_locked<R>(&self, f: impl FnOnce(&mut WaitQueueInner) -> R) -> R {
        self.inner.lock(f)
    }

    /// Lock, append, unlock.
    pub fn add(&self, waiter: Waiter) {
        self.with_locked(|q| q.add_locked(waiter));
    }

    /// Lock, remove by token, unlock. Returns whether the waiter was still
    /// parked (if not, its callback has already been invoked or handed
    /// off).
    pub fn remove(&self, token: WaiterToken) -> bool {
        self.with_locked(|q| q.remove_locked(token)).is_some()
    }

    /// Wake up to `n` waiters in enqueue order. Returns how many were
    /// woken.
    pub fn wake_many(&self, n: usize) -> usize {
        let woken: Vec<Waiter> = self.with_locked(|q| {
            let take = n.min(q.waiters.len());
            q.waiters.drain(..take).collect()
        });
        let count = woken.len();
        for waiter in woken {
            (waiter.callback)();
        }
        count
    }

    /// Wake the first waiter, if any.
    pub fn wake_one(&self) -> usize {
        self.wake_many(1)
    }

    /// Wake everyone.
    pub fn wake_all(&self) -> usize {
        self.wake_many(usize::MAX)
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
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
        std::sync::Arc,
    };

    fn counting_waiter(token: u64, hits: &Arc<AtomicUsize>) -> Waiter {
        let hits = Arc::clone(hits);
        Waiter::new(WaiterToken(token), move || {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn wake_invokes_each_callback_exactly_once() {
        let q = WaitQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for t in 0..3 {
            q.add(counting_waiter(t, &hits));
        }

        assert_eq!(q.wake_many(2), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(q.wake_all(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(q.wake_all(), 0);
    }

    #[test]
    fn wakeups_run_in_enqueue_order() {
        let q = WaitQueue::new();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for t in [7u64, 3, 9] {
            let order = Arc::clone(&order);
            q.add(Waiter::new(WaiterToken(t), move || {
                order.lock().unwrap().push(t);
            }));
        }
        q.wake_all();
        assert_eq!(*order.lock().unwrap(), vec![7, 3, 9]);
    }

    #[test]
    fn removed_waiter_never_fires() {
        let q = WaitQueue::new();
        let hits = Arc::new(AtomicUsize::new(0));
        q.add(counting_waiter(1, &hits));
        q.add(counting_waiter(2, &hits));

        assert!(q.remove(WaiterToken(1)));
        assert!(!q.remove(WaiterToken(1)));
        q.wake_all();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    /// A waiter may re-arm itself on a different queue from within its
    /// callback.
    #[test]
    fn callback_may_rearm_on_another_queue() {
        let first = WaitQueue::new();
        let second = Arc::new(WaitQueue::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let rearm_target = Arc::clone(&second);
        let rearm_hits = Arc::clone(&hits);
        first.add(Waiter::new(WaiterToken(1), move || {
            rearm_target.add(counting_waiter(1, &rearm_hits));
        }));

        first.wake_all();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        second.wake_all();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
