//! Processes and scheduling
//!
//! A fixed table of process slots, one scheduler loop per CPU, strict
//! round-robin in slot order. Kernel control flows suspend only through
//! `sched` (from `yield_cpu`, `sleep` or `exit`); user preemption rides the
//! per-core timer interrupt.

pub mod exec;
pub mod table;

pub use exec::execve;
pub use table::{
    exit, fork, growproc, my_proc, proc_alloc, procdump, scheduler, sleep, user_init, wait,
    wakeup, yield_cpu, PTABLE,
};

use core::cell::UnsafeCell;

use crate::arch::{self, Context};
use crate::fs::file::FileRef;
use crate::fs::inode::InodeRef;
use crate::mm::page_table::PageTable;
use crate::mm::PGSIZE;
use crate::trap::TrapFrame;

pub const NPROC: usize = 64;
pub const NCPU: usize = 4;
pub const NOFILE: usize = 16;
pub const KSTACKSIZE: usize = PGSIZE;
/// Max arguments accepted by `execve`.
pub const MAXARG: usize = 32;

/// Lifecycle of a process slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Embryo,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

/// One process-table slot.
///
/// `parent` is a bare pid: pids are allocated monotonically and never
/// reused, so a stale parent pid simply matches no live slot instead of
/// aliasing a recycled one.
pub struct Proc {
    pub state: ProcState,
    pub pid: i32,
    pub parent: i32,
    pub killed: bool,
    /// Rendezvous tag this process sleeps on; 0 when awake.
    pub chan: usize,
    /// Kernel stack (one frame), 0 when unallocated.
    pub kstack: usize,
    /// Trap frame at the top of the kernel stack.
    pub tf: *mut TrapFrame,
    /// Saved callee-saved registers for `swtch`.
    pub context: Context,
    /// Address-space root, null until set.
    pub pgdir: *mut PageTable,
    /// User-space size in bytes.
    pub sz: usize,
    pub cwd: Option<InodeRef>,
    pub ofile: [Option<FileRef>; NOFILE],
}

impl Proc {
    pub const fn new() -> Self {
        Self {
            state: ProcState::Unused,
            pid: 0,
            parent: 0,
            killed: false,
            chan: 0,
            kstack: 0,
            tf: core::ptr::null_mut(),
            context: Context::zero(),
            pgdir: core::ptr::null_mut(),
            sz: 0,
            cwd: None,
            ofile: [const { None }; NOFILE],
        }
    }
}

/// Per-CPU state: the scheduler context, the slot of the running process,
/// and the spinlock interrupt-disable bookkeeping.
pub struct Cpu {
    pub scheduler: Context,
    pub proc: Option<usize>,
    pub ncli: i32,
    pub int_ena: bool,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            scheduler: Context::zero(),
            proc: None,
            ncli: 0,
            int_ena: false,
        }
    }
}

struct CpuTable(UnsafeCell<[Cpu; NCPU]>);

// SAFETY: each CPU only ever touches its own entry, selected by cpu_id.
unsafe impl Sync for CpuTable {}

static CPUS: CpuTable = CpuTable(UnsafeCell::new([const { Cpu::new() }; NCPU]));

/// This CPU's entry. Exclusive by construction: index is the executing
/// core, and interrupts are disabled whenever the entry is mutated.
#[allow(clippy::mut_from_ref)]
pub fn my_cpu() -> &'static mut Cpu {
    // SAFETY: see above.
    unsafe { &mut (*CPUS.0.get())[arch::cpu_id()] }
}
