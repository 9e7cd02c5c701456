//! Spinlocks with per-CPU interrupt discipline
//!
//! A CPU disables interrupts before taking its first spinlock and re-enables
//! them only when the outermost lock is released; the depth and the saved
//! enable state live in the per-CPU block. An interrupt taken while a
//! spinlock is held could otherwise try to take the same lock and spin
//! forever on its own CPU.

use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

const NO_OWNER: usize = usize::MAX;

/// Identity of the executing control flow, for hold-detection.
///
/// On hardware that is the core index; on the host (multi-threaded unit
/// tests) it is a per-thread token so two test threads on "CPU 0" are not
/// mistaken for one another.
#[cfg(target_os = "none")]
fn owner_token() -> usize {
    crate::arch::cpu_id()
}

#[cfg(not(target_os = "none"))]
fn owner_token() -> usize {
    std::thread_local! {
        static TOKEN: u8 = const { 0u8 };
    }
    TOKEN.with(|t| t as *const u8 as usize)
}

/// Raise the interrupt-disable depth on this CPU.
pub(crate) fn push_off() {
    #[cfg(target_os = "none")]
    {
        let was_enabled = crate::arch::intr_get();
        crate::arch::intr_off();
        let cpu = crate::process::my_cpu();
        if cpu.ncli == 0 {
            cpu.int_ena = was_enabled;
        }
        cpu.ncli += 1;
    }
}

/// Drop the interrupt-disable depth; re-enable at the outermost release.
pub(crate) fn pop_off() {
    #[cfg(target_os = "none")]
    {
        if crate::arch::intr_get() {
            panic!("pop_off: interrupts enabled");
        }
        let cpu = crate::process::my_cpu();
        if cpu.ncli < 1 {
            panic!("pop_off: unbalanced");
        }
        cpu.ncli -= 1;
        if cpu.ncli == 0 && cpu.int_ena {
            crate::arch::intr_on();
        }
    }
}

/// A test-and-set mutual-exclusion lock guarding a value.
pub struct SpinLock<T> {
    locked: AtomicBool,
    owner: AtomicUsize,
    name: &'static str,
    data: UnsafeCell<T>,
}

// SAFETY: the lock serializes all access to the inner value.
unsafe impl<T: Send> Sync for SpinLock<T> {}
unsafe impl<T: Send> Send for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(NO_OWNER),
            name,
            data: UnsafeCell::new(data),
        }
    }

    /// Is this lock held by the current CPU (or test thread)?
    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.owner.load(Ordering::Relaxed) == owner_token()
    }

    /// Acquire the lock, spinning until it is free.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        push_off();
        if self.holding() {
            panic!("acquire {}: already holding", self.name);
        }
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
        self.owner.store(owner_token(), Ordering::Relaxed);
        SpinLockGuard { lock: self }
    }

    /// Raw pointer to the protected value, bypassing the lock.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no other CPU can be mutating the
    /// value, e.g. because a reference count it controls pins the slot.
    pub unsafe fn raw(&self) -> *mut T {
        self.data.get()
    }
}

/// RAII guard; releasing it unlocks and unwinds the interrupt depth.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// The lock this guard came from; used by `sleep` to reacquire it.
    pub fn spinlock(&self) -> &'a SpinLock<T> {
        self.lock
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held exclusively.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        if !self.lock.holding() {
            panic!("release {}: not holding", self.lock.name);
        }
        self.lock.owner.store(NO_OWNER, Ordering::Relaxed);
        self.lock.locked.store(false, Ordering::Release);
        pop_off();
    }
}

/// A spinlock with no protected value and manual acquire/release.
///
/// The process table needs this shape: the lock is taken on one side of a
/// context switch and released on the other, which no RAII guard can
/// express.
pub struct RawSpinLock {
    locked: AtomicBool,
    owner: AtomicUsize,
    name: &'static str,
}

impl RawSpinLock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(NO_OWNER),
            name,
        }
    }

    pub fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed) && self.owner.load(Ordering::Relaxed) == owner_token()
    }

    pub fn acquire(&self) {
        push_off();
        if self.holding() {
            panic!("acquire {}: already holding", self.name);
        }
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
        self.owner.store(owner_token(), Ordering::Relaxed);
    }

    pub fn release(&self) {
        if !self.holding() {
            panic!("release {}: not holding", self.name);
        }
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        pop_off();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    #[test]
    fn guard_gives_exclusive_access() {
        let lock = SpinLock::new("test", 0u32);
        {
            let mut g = lock.lock();
            *g += 1;
        }
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn contended_increments_are_not_lost() {
        let lock = Arc::new(SpinLock::new("count", 0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40_000);
    }

    #[test]
    fn holding_tracks_the_owner() {
        let lock = RawSpinLock::new("raw");
        assert!(!lock.holding());
        lock.acquire();
        assert!(lock.holding());
        lock.release();
        assert!(!lock.holding());
    }

    #[test]
    #[should_panic(expected = "already holding")]
    fn reacquire_panics() {
        let lock = RawSpinLock::new("raw");
        lock.acquire();
        lock.acquire();
    }
}
