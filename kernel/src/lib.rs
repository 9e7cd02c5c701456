//! ferrite kernel library
//!
//! The core of a small multiprocessor teaching kernel for 64-bit ARM:
//! physical frame allocator, four-level user virtual memory, a slot-table
//! scheduler with sleep/wakeup, a buffer cache with a crash-consistent redo
//! log, an inode file system, and an ELF exec loader.
//!
//! The library builds for `aarch64-unknown-none` (the real kernel) and for
//! the host triple, where the lock, VM and file-system logic is exercised by
//! ordinary `cargo test` against an arena-backed frame pool and a RAM disk.

#![no_std]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Host target: pull in std so unit tests can spawn threads and allocate
// through the system allocator.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod console;
pub mod error;
pub mod fs;
pub mod klog;
pub mod mm;
pub mod process;
pub mod sync;
pub mod syscall;
pub mod trap;

pub use error::{FsError, KernelError, KernelResult};

/// Heap allocation failure in a no_std kernel is unrecoverable.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted: {:?}", layout);
}
