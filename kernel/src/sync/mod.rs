//! Kernel synchronization primitives
//!
//! Two layers: spinlocks (busy-wait, interrupts disabled on the holding
//! CPU) and sleep-locks (waiters park in the scheduler). The lock order for
//! filesystem paths is ftable → icache → bcache → log; scheduling paths
//! take the process-table lock before any sleep-lock innards.

pub mod sleeplock;
pub mod spinlock;

pub use sleeplock::{SleepGuard, SleepLock};
pub use spinlock::{RawSpinLock, SpinLock, SpinLockGuard};
