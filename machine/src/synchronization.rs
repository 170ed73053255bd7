/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 * Copyright (c) Anillo OS authors
 */

//! Synchronization primitives.
//!
//! Kernel data is guarded by [`IRQSafeSpinLock`]: a spinlock that masks
//! local interrupts for the critical section, so an IRQ handler on the same
//! CPU can never deadlock against the interrupted holder. Access is
//! closure-scoped through [`interface::Mutex`], which makes it impossible
//! to forget an unlock on any return path.

use {
    crate::exception,
    core::{
        cell::UnsafeCell,
        sync::atomic::{AtomicBool, Ordering},
    },
};

//--------------------------------------------------------------------------------------------------
// Public Definitions
//--------------------------------------------------------------------------------------------------

/// Synchronization interfaces.
pub mod interface {

    /// Any object implementing this trait guarantees exclusive access to the data wrapped within
    /// the Mutex for the duration of the provided closure.
    pub trait Mutex {
        /// The type of the data that is wrapped by this mutex.
        type Data;

        /// Locks the mutex and grants the closure temporary mutable access to the wrapped data.
        fn lock<R>(&self, f: impl FnOnce(&mut Self::Data) -> R) -> R;

        /// Attempts the lock without spinning; returns `None` if it is held
        /// elsewhere.
        fn try_lock<R>(&self, f: impl FnOnce(&mut Self::Data) -> R) -> Option<R>;
    }
}

/// A spinlock that masks local IRQs for the duration of the critical
/// section.
pub struct IRQSafeSpinLock<T>
where
    T: ?Sized,
{
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

//--------------------------------------------------------------------------------------------------
// Public Code
//--------------------------------------------------------------------------------------------------

unsafe impl<T> Send for IRQSafeSpinLock<T> where T: ?Sized + Send {}
unsafe impl<T> Sync for IRQSafeSpinLock<T> where T: ?Sized + Send {}

impl<T> IRQSafeSpinLock<T> {
    /// Create an instance.
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    fn acquire(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Exponential PAUSE backoff keeps the cache line from bouncing
            // under contention.
            let mut backoff: u32 = 1;
            while self.locked.load(Ordering::Relaxed) {
                for _ in 0..backoff {
                    core::hint::spin_loop();
                }
                if backoff < 64 {
                    backoff <<= 1;
                }
            }
        }
    }

    fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

impl<T> interface::Mutex for IRQSafeSpinLock<T> {
    type Data = T;

    fn lock<R>(&self, f: impl FnOnce(&mut Self::Data) -> R) -> R {
        exception::asynchronous::exec_with_irq_masked(|| {
            self.acquire();
            let ret = f(unsafe { &mut *self.data.get() });
            self.release();
            ret
        })
    }

    fn try_lock<R>(&self, f: impl FnOnce(&mut Self::Data) -> R) -> Option<R> {
        exception::asynchronous::exec_with_irq_masked(|| {
            if self
                .locked
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                return None;
            }
            let ret = f(unsafe { &mut *self.data.get() });
            self.release();
            Some(ret)
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Testing
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use {super::*, interface::Mutex};

    /// The lock must be transparent.
    #[test]
    fn spinlock_is_word_sized_plus_data() {
        use core::mem::size_of;

        assert!(size_of::<IRQSafeSpinLock<u64>>() <= 2 * size_of::<u64>());
    }

    #[test]
    fn lock_grants_exclusive_mutation() {
        let lock = IRQSafeSpinLock::new(0u32);
        lock.lock(|v| *v += 1);
        let seen = lock.lock(|v| *v);
        assert_eq!(seen, 1);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = IRQSafeSpinLock::new(());
        lock.lock(|_| {
            assert!(lock.try_lock(|_| ()).is_none());
        });
        assert!(lock.try_lock(|_| ()).is_some());
    }
}
