//! Trap dispatch
//!
//! The boot package installs a vector table whose every entry saves the
//! interrupted register state into a [`TrapFrame`] on the per-CPU kernel
//! stack and calls [`trap`]. Here the exception syndrome picks the path:
//! interrupts, system calls, or a fatal fault.

use crate::arch::{self, ESR_EC_SHIFT, ESR_ISS_MASK};
use crate::console;
use crate::fs;
use crate::process;
use crate::syscall;

/// Saved user register state, at the top of the kernel stack on entry from
/// EL0. Restored by `trapret`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    /// Exception link register: resume PC.
    pub elr: u64,
    /// Saved program status.
    pub spsr: u64,
    /// User stack pointer (SP_EL0).
    pub sp: u64,
    /// General registers x0..x30.
    pub x: [u64; 31],
}

impl TrapFrame {
    pub const fn zero() -> Self {
        Self {
            elr: 0,
            spsr: 0,
            sp: 0,
            x: [0; 31],
        }
    }
}

/// Exception classes this kernel understands (ESR_EL1.EC).
pub const EC_UNKNOWN: u64 = 0x00;
pub const EC_SVC64: u64 = 0x15;
pub const EC_DABORT_LOWER: u64 = 0x24;
pub const EC_DABORT_SAME: u64 = 0x25;

/// Exception class field of a syndrome value.
#[inline]
pub fn syndrome_class(esr: u64) -> u64 {
    esr >> ESR_EC_SHIFT
}

/// Instruction-specific syndrome field.
#[inline]
pub fn syndrome_iss(esr: u64) -> u64 {
    esr & ESR_ISS_MASK
}

/// Exception entry, called by the vector stubs with the fresh trap frame.
#[no_mangle]
pub extern "C" fn trap(tf: &mut TrapFrame) {
    let esr = arch::read_esr();
    arch::clear_esr();
    match syndrome_class(esr) {
        EC_UNKNOWN => interrupt(tf),
        EC_SVC64 => {
            let iss = syndrome_iss(esr);
            if iss == 0 {
                syscall::dispatch(tf);
            } else {
                log::warn!("svc with unexpected iss {:#x}", iss);
            }
        }
        EC_DABORT_LOWER | EC_DABORT_SAME => {
            panic!(
                "data abort: instruction {:#x}, fault address {:#x}",
                tf.elr,
                arch::read_far()
            );
        }
        ec => panic!("trap: unexpected exception class {:#x}", ec),
    }
}

/// Interrupt path: read this core's pending sources and dispatch.
fn interrupt(_tf: &mut TrapFrame) {
    let core = arch::cpu_id();
    let src = arch::irq_source(core);
    if src & arch::SRC_CNTPNSIRQ != 0 {
        arch::timer_reset();
        process::yield_cpu();
    } else if src & arch::SRC_LOCAL_TIMER != 0 {
        arch::clock_reset();
    } else if src & arch::SRC_GPU != 0 {
        let (p1, p2) = arch::gpu_pending();
        if p1 & arch::AUX_INT != 0 {
            console::uart_intr();
        } else if p2 & arch::SDIO_INT != 0 {
            fs::device::sd_intr();
        } else {
            log::warn!("unclaimed gpu interrupt p1={:#x} p2={:#x}", p1, p2);
        }
    } else {
        log::warn!("unexpected interrupt source {:#x} on cpu {}", src, core);
    }
}

/// Route interrupt lines and arm the preemption timer for this core.
pub fn init() {
    arch::irq_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syndrome_fields_split_class_and_iss() {
        let esr = (EC_SVC64 << ESR_EC_SHIFT) | 0x0000_0000;
        assert_eq!(syndrome_class(esr), EC_SVC64);
        assert_eq!(syndrome_iss(esr), 0);

        let esr = (EC_DABORT_LOWER << ESR_EC_SHIFT) | 0x47;
        assert_eq!(syndrome_class(esr), EC_DABORT_LOWER);
        assert_eq!(syndrome_iss(esr), 0x47);
    }

    #[test]
    fn trap_frame_layout_matches_the_restore_path() {
        // trapret hard-codes these offsets.
        assert_eq!(core::mem::size_of::<TrapFrame>(), 272);
        assert_eq!(core::mem::offset_of!(TrapFrame, sp), 16);
        assert_eq!(core::mem::offset_of!(TrapFrame, x), 24);
    }
}
