//! Process table, scheduler, sleep/wakeup and the process lifecycle
//!
//! One spinlock (`PTABLE.lock`) is the ordering authority for every state
//! transition. It is deliberately a raw lock: `sleep` and the scheduler
//! hand it across a context switch, which no RAII guard can express.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::arch::{self, swtch, trapret};
use crate::error::{KernelError, KernelResult};
use crate::fs;
use crate::mm::{vm, KMEM, PGSIZE};
use crate::sync::{RawSpinLock, SpinLock, SpinLockGuard};
use crate::trap::TrapFrame;

use super::{my_cpu, Proc, ProcState, KSTACKSIZE, NOFILE, NPROC};

pub struct ProcTable {
    pub lock: RawSpinLock,
    procs: [UnsafeCell<Proc>; NPROC],
}

// SAFETY: slot mutation happens under `lock` (or on a slot the current
// control flow owns exclusively, e.g. an EMBRYO it just allocated).
unsafe impl Sync for ProcTable {}

pub static PTABLE: ProcTable = ProcTable {
    lock: RawSpinLock::new("ptable"),
    procs: [const { UnsafeCell::new(Proc::new()) }; NPROC],
};

static NEXT_PID: SpinLock<i32> = SpinLock::new("nextpid", 1);

/// Pid of the init process; children of exiting processes are reparented
/// onto it.
static INIT_PID: AtomicI32 = AtomicI32::new(0);

static FIRST_PROC: AtomicBool = AtomicBool::new(true);

impl ProcTable {
    /// Mutable access to slot `idx`.
    ///
    /// # Safety
    ///
    /// Caller must hold `lock`, or otherwise own the slot exclusively.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slot(&self, idx: usize) -> &'static mut Proc {
        unsafe { &mut *self.procs[idx].get() }
    }

    fn slot_chan(&self, idx: usize) -> usize {
        self.procs[idx].get() as usize
    }
}

/// The process currently running on this CPU.
pub fn my_proc() -> Option<&'static mut Proc> {
    let idx = my_cpu().proc?;
    // SAFETY: the slot of a RUNNING process belongs to the CPU running it.
    Some(unsafe { PTABLE.slot(idx) })
}

/// Draw a fresh pid. Monotonic, never reused.
fn alloc_pid() -> i32 {
    let mut next = NEXT_PID.lock();
    let pid = *next;
    *next += 1;
    pid
}

/// Find an UNUSED slot and prepare it to run in the kernel: kernel stack,
/// trap frame at the stack top, and a saved context that resumes in
/// `forkret`. Returns the slot index, now in EMBRYO state.
pub fn proc_alloc() -> Option<usize> {
    PTABLE.lock.acquire();
    let mut found = None;
    for i in 0..NPROC {
        // SAFETY: lock held.
        let p = unsafe { PTABLE.slot(i) };
        if p.state == ProcState::Unused {
            found = Some(i);
            break;
        }
    }
    let Some(idx) = found else {
        PTABLE.lock.release();
        return None;
    };
    // SAFETY: lock held.
    let p = unsafe { PTABLE.slot(idx) };

    let kstack = match KMEM.alloc() {
        Ok(k) => k as usize,
        Err(_) => {
            PTABLE.lock.release();
            log::warn!("proc_alloc: no frame for kernel stack");
            return None;
        }
    };
    p.kstack = kstack;
    let tf = (kstack + KSTACKSIZE - core::mem::size_of::<TrapFrame>()) as *mut TrapFrame;
    // SAFETY: the frame is fresh and owned by this slot.
    unsafe { *tf = TrapFrame::zero() };
    p.tf = tf;

    // First switch lands in forkret with the stack just below the frame.
    p.context = arch::Context::zero();
    p.context.lr = forkret as usize as u64;
    p.context.sp = tf as u64;

    p.pid = alloc_pid();
    p.parent = 0;
    p.killed = false;
    p.chan = 0;
    p.sz = 0;
    p.state = ProcState::Embryo;

    PTABLE.lock.release();
    Some(idx)
}

/// Build the first user process from the embedded initcode image and mark
/// it runnable. Called once at boot.
pub fn user_init(initcode: &[u8]) {
    let idx = proc_alloc().expect("user_init: no process slot");
    // SAFETY: an EMBRYO slot belongs to its creator.
    let p = unsafe { PTABLE.slot(idx) };

    let pgdir = vm::pgdir_init().expect("user_init: no page table");
    p.pgdir = pgdir;
    // SAFETY: fresh address space.
    unsafe { vm::uvm_init(pgdir, initcode) };

    INIT_PID.store(p.pid, Ordering::Release);

    // SAFETY: tf points into the slot's own kernel stack.
    let tf = unsafe { &mut *p.tf };
    *tf = TrapFrame::zero();
    tf.spsr = 0;
    tf.sp = PGSIZE as u64;
    tf.elr = 0;

    p.sz = PGSIZE;
    p.cwd = fs::dir::namei("/");

    PTABLE.lock.acquire();
    p.state = ProcState::Runnable;
    PTABLE.lock.release();
    log::info!("init process ready (pid {})", p.pid);
}

/// Per-CPU scheduler loop. Never returns: pick the next RUNNABLE slot in
/// order, switch to it, take the lock back when it yields.
pub fn scheduler() -> ! {
    let cpu = my_cpu();
    cpu.proc = None;
    loop {
        arch::intr_on();

        PTABLE.lock.acquire();
        for i in 0..NPROC {
            // SAFETY: lock held.
            let p = unsafe { PTABLE.slot(i) };
            if p.state != ProcState::Runnable {
                continue;
            }
            vm::uvm_switch(p.pgdir);
            cpu.proc = Some(i);
            p.state = ProcState::Running;
            // SAFETY: both contexts are live; lock is held across the swap.
            unsafe { swtch(&mut cpu.scheduler, &p.context) };
            cpu.proc = None;
        }
        PTABLE.lock.release();
    }
}

/// Swap back into the scheduler. Must hold the process-table lock, and the
/// process must already have left the RUNNING state.
fn sched() {
    if !PTABLE.lock.holding() {
        panic!("sched: ptable lock not held");
    }
    let p = my_proc().expect("sched: no process");
    if p.state == ProcState::Running {
        panic!("sched: process still running");
    }
    // SAFETY: scheduler context was saved by this CPU's scheduler loop.
    unsafe { swtch(&mut p.context, &my_cpu().scheduler) };
}

/// Give up the CPU for one scheduling round.
pub fn yield_cpu() {
    PTABLE.lock.acquire();
    my_proc().expect("yield: no process").state = ProcState::Runnable;
    sched();
    PTABLE.lock.release();
}

/// First landing point of a new process; the scheduler handed us the table
/// lock across the context switch. The very first process brings up the
/// logging layer of the filesystem (it may sleep, which boot cannot).
extern "C" fn forkret() -> ! {
    PTABLE.lock.release();

    if FIRST_PROC.swap(false, Ordering::AcqRel) {
        fs::init(fs::ROOTDEV);
    }

    let p = my_proc().expect("forkret: no process");
    // SAFETY: the trap frame was fully initialized by user_init/fork/exec.
    unsafe { trapret(p.tf) }
}

/// Atomically release `guard` and sleep on `chan`; reacquires the lock
/// before returning. Callers loop on their condition: wakeups are shared.
pub fn sleep<'a, T>(chan: usize, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
    let lock = guard.spinlock();

    // Take the table lock before letting go of the condition lock so a
    // wakeup between the two cannot be lost.
    PTABLE.lock.acquire();
    drop(guard);

    let p = my_proc().expect("sleep: no process");
    p.chan = chan;
    p.state = ProcState::Sleeping;
    sched();
    p.chan = 0;

    PTABLE.lock.release();
    lock.lock()
}

/// Sleep variant for callers that already hold the process-table lock
/// (`wait`); the lock stays held around the switch.
fn sleep_on_ptable(chan: usize) {
    let p = my_proc().expect("sleep: no process");
    p.chan = chan;
    p.state = ProcState::Sleeping;
    sched();
    p.chan = 0;
}

fn wakeup0(chan: usize) {
    for i in 0..NPROC {
        // SAFETY: lock held by callers.
        let p = unsafe { PTABLE.slot(i) };
        if p.state == ProcState::Sleeping && p.chan == chan {
            p.state = ProcState::Runnable;
        }
    }
}

/// Wake every process sleeping on `chan`.
pub fn wakeup(chan: usize) {
    PTABLE.lock.acquire();
    wakeup0(chan);
    PTABLE.lock.release();
}

/// Create a child: copied address space, duplicated trap frame with a zero
/// return value, shared files and cwd. Returns the child pid.
pub fn fork() -> KernelResult<i32> {
    let parent = my_proc().expect("fork: no process");
    let idx = proc_alloc().ok_or(KernelError::ResourceExhausted {
        resource: "process slots",
    })?;
    // SAFETY: EMBRYO slot belongs to us until marked runnable.
    let child = unsafe { PTABLE.slot(idx) };

    // SAFETY: parent space is stable while the parent executes fork.
    child.pgdir = match unsafe { vm::copyuvm(parent.pgdir, parent.sz) } {
        Ok(pgdir) => pgdir,
        Err(e) => {
            // SAFETY: the kstack frame came from proc_alloc above.
            unsafe { KMEM.free(child.kstack as *mut u8) };
            child.kstack = 0;
            PTABLE.lock.acquire();
            child.pid = 0;
            child.state = ProcState::Unused;
            PTABLE.lock.release();
            return Err(e);
        }
    };
    child.sz = parent.sz;
    // SAFETY: both frames live on their own kernel stacks.
    unsafe {
        *child.tf = *parent.tf;
        (*child.tf).x[0] = 0;
    }
    child.parent = parent.pid;

    for fd in 0..NOFILE {
        if let Some(f) = parent.ofile[fd].as_ref() {
            child.ofile[fd] = Some(fs::file::dup(f));
        }
    }
    child.cwd = parent.cwd.as_ref().map(fs::inode::idup);

    let pid = child.pid;
    PTABLE.lock.acquire();
    child.state = ProcState::Runnable;
    PTABLE.lock.release();
    Ok(pid)
}

/// Terminate the calling process. Open files and the cwd reference are
/// released, children are handed to init, the parent is woken, and the
/// slot parks in ZOMBIE until `wait` reaps it. Never returns.
pub fn exit() -> ! {
    let p = my_proc().expect("exit: no process");
    if p.pid == INIT_PID.load(Ordering::Acquire) {
        panic!("exit: init exiting");
    }

    for fd in 0..NOFILE {
        if let Some(f) = p.ofile[fd].take() {
            fs::file::close(f);
        }
    }
    if let Some(cwd) = p.cwd.take() {
        fs::log::begin_op();
        fs::inode::iput(cwd);
        fs::log::end_op();
    }

    PTABLE.lock.acquire();

    // Wake the parent, then pass our children to init.
    let init_pid = INIT_PID.load(Ordering::Acquire);
    let mut init_chan = 0;
    let mut parent_chan = 0;
    for i in 0..NPROC {
        // SAFETY: lock held.
        let q = unsafe { PTABLE.slot(i) };
        if q.pid == p.parent && q.state != ProcState::Unused {
            parent_chan = PTABLE.slot_chan(i);
        }
        if q.pid == init_pid && q.state != ProcState::Unused {
            init_chan = PTABLE.slot_chan(i);
        }
    }
    if parent_chan != 0 {
        wakeup0(parent_chan);
    }
    for i in 0..NPROC {
        // SAFETY: lock held.
        let q = unsafe { PTABLE.slot(i) };
        if q.state != ProcState::Unused && q.parent == p.pid {
            q.parent = init_pid;
            if q.state == ProcState::Zombie && init_chan != 0 {
                wakeup0(init_chan);
            }
        }
    }

    p.state = ProcState::Zombie;
    sched();
    panic!("exit: zombie resumed");
}

/// Wait for a child to exit; reaps its slot and returns its pid, or an
/// error when the caller has no children (or was killed).
pub fn wait() -> KernelResult<i32> {
    let me = my_proc().expect("wait: no process");
    let my_chan = me as *const Proc as usize;
    PTABLE.lock.acquire();
    loop {
        let mut have_kids = false;
        for i in 0..NPROC {
            // SAFETY: lock held.
            let p = unsafe { PTABLE.slot(i) };
            if p.state == ProcState::Unused || p.parent != me.pid {
                continue;
            }
            have_kids = true;
            if p.state == ProcState::Zombie {
                let pid = p.pid;
                p.killed = false;
                p.pid = 0;
                p.parent = 0;
                // SAFETY: a zombie's address space and stack are quiescent.
                unsafe {
                    vm::vm_free(p.pgdir);
                    KMEM.free(p.kstack as *mut u8);
                }
                p.pgdir = core::ptr::null_mut();
                p.kstack = 0;
                p.sz = 0;
                p.state = ProcState::Unused;
                PTABLE.lock.release();
                return Ok(pid);
            }
        }
        if !have_kids || me.killed {
            PTABLE.lock.release();
            return Err(KernelError::ResourceExhausted {
                resource: "children",
            });
        }
        sleep_on_ptable(my_chan);
    }
}

/// Grow (or shrink, for negative `n`) the user address space of the
/// calling process and reinstall it.
pub fn growproc(n: i64) -> KernelResult<()> {
    let p = my_proc().expect("growproc: no process");
    let sz = p.sz;
    if n > 0 {
        // SAFETY: we own our own address space.
        p.sz = unsafe { vm::allocuvm(p.pgdir, sz, sz + n as usize) }?;
    } else if n < 0 {
        let target = sz
            .checked_add_signed(n as isize)
            .ok_or(KernelError::InvalidArgument { name: "n" })?;
        // SAFETY: we own our own address space.
        p.sz = unsafe { vm::deallocuvm(p.pgdir, sz, target) };
    }
    vm::uvm_switch(p.pgdir);
    Ok(())
}

/// Console listing of the process table. No lock on purpose: this runs
/// from the console interrupt to inspect a possibly wedged machine.
pub fn procdump() {
    for i in 0..NPROC {
        // SAFETY: racy read-only snapshot, tolerated for debugging.
        let p = unsafe { PTABLE.slot(i) };
        if p.state == ProcState::Unused {
            continue;
        }
        println!("pid {:>3} state {:?} sz {:#x}", p.pid, p.state, p.sz);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pids_are_monotonic_and_unique() {
        let a = alloc_pid();
        let b = alloc_pid();
        let c = alloc_pid();
        assert!(a < b && b < c);
    }
}
