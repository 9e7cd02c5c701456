//! Sleep-locks: long-term mutual exclusion for disk-speed critical sections
//!
//! A sleep-lock is a locked flag behind a spinlock. Contended acquirers go
//! to sleep on the lock's address instead of spinning, so a holder may keep
//! the lock across disk I/O and its own sleeps. Buffers and inodes are
//! guarded this way.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use super::spinlock::SpinLock;
use crate::process;

pub struct SleepLock<T> {
    inner: SpinLock<bool>,
    data: UnsafeCell<T>,
}

// SAFETY: the sleep-lock protocol serializes access to the inner value.
unsafe impl<T: Send> Sync for SleepLock<T> {}
unsafe impl<T: Send> Send for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            inner: SpinLock::new(name, false),
            data: UnsafeCell::new(data),
        }
    }

    /// Rendezvous tag used for this lock's sleepers and release wakeups.
    pub fn chan(&self) -> usize {
        self as *const Self as usize
    }

    /// Acquire, sleeping while another holder is inside.
    pub fn acquire(&self) -> SleepGuard<'_, T> {
        let mut locked = self.inner.lock();
        while *locked {
            locked = process::sleep(self.chan(), locked);
        }
        *locked = true;
        drop(locked);
        SleepGuard { lock: self }
    }

    /// Acquire only if the lock is free right now.
    pub fn try_acquire(&self) -> Option<SleepGuard<'_, T>> {
        let mut locked = self.inner.lock();
        if *locked {
            return None;
        }
        *locked = true;
        drop(locked);
        Some(SleepGuard { lock: self })
    }

    /// Is some holder currently inside?
    pub fn is_locked(&self) -> bool {
        *self.inner.lock()
    }

    /// Raw pointer to the protected value, bypassing the lock.
    ///
    /// # Safety
    ///
    /// Only sound when the caller can prove no holder exists and none can
    /// appear, e.g. a buffer whose lock transitions all happen under the
    /// cache control lock the caller holds, or an inode whose reference
    /// count the caller knows to be one (its own).
    pub unsafe fn data_ptr(&self) -> *mut T {
        self.data.get()
    }
}

/// RAII witness that the sleep-lock is held.
pub struct SleepGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

impl<T> Deref for SleepGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the sleep-lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the sleep-lock is held exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepGuard<'_, T> {
    fn drop(&mut self) {
        let mut locked = self.lock.inner.lock();
        *locked = false;
        drop(locked);
        process::wakeup(self.lock.chan());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_acquire_release() {
        let lock = SleepLock::new("sltest", 7u32);
        {
            let mut g = lock.acquire();
            assert_eq!(*g, 7);
            *g = 8;
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        assert_eq!(*lock.acquire(), 8);
    }

    #[test]
    fn try_acquire_fails_while_held() {
        let lock = SleepLock::new("sltest", ());
        let g = lock.acquire();
        assert!(lock.try_acquire().is_none());
        drop(g);
        assert!(lock.try_acquire().is_some());
    }
}
