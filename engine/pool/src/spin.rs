//! Test-and-set spin lock for sub-microsecond critical sections.
//!
//! Used to guard pool free lists and worker queues. The lock is not
//! reentrant and must never be held across a blocking syscall.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

/// Upper bound on the exponential backoff between acquisition attempts.
/// Past this the waiter yields the CPU instead of spinning harder.
const MAX_SPIN: u32 = 64;

/// A busy-wait mutual exclusion lock.
///
/// Waiters back off exponentially with `spin_loop` hints, then fall back
/// to `yield_now` so a descheduled holder can run.
pub struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// Safety: the lock serializes all access to `value`.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, busy-waiting until it is free.
    pub fn lock(&self) -> SpinGuard<'_, T> {
        let mut spin = 1u32;
        loop {
            if !self.locked.swap(true, Ordering::Acquire) {
                return SpinGuard { lock: self };
            }

            // Wait for the holder with a read-only loop so the cache line
            // is not bounced by failed swaps.
            while self.locked.load(Ordering::Relaxed) {
                if spin <= MAX_SPIN {
                    for _ in 0..spin {
                        std::hint::spin_loop();
                    }
                    spin <<= 1;
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Acquire the lock only if it is immediately available.
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        if self.locked.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(SpinGuard { lock: self })
        }
    }

    /// Consume the lock and return the inner value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Default> Default for SpinLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// RAII guard; the lock is released on drop.
pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard holds the lock.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock exclusively.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
