//! Per-core preemption timer (ARM generic timer, CNTP)
//!
//! Each core arms its own non-secure physical timer; the interrupt arrives
//! on the local controller as `SRC_CNTPNSIRQ` and forces the running
//! process to yield.

use core::arch::asm;

use super::mmio_write;
use crate::mm::phys_to_virt;

/// Local-controller timer routing registers, one per core.
const CORE_TIMER_IRQCNTL: usize = 0x4000_0040;

/// Timer interval in counter ticks (~10ms at the 62.5MHz crystal-derived
/// rate QEMU and the Pi 3 expose).
const TIMER_INTERVAL: u64 = 625_000;

/// Route CNTPNSIRQ to this core and arm the first tick.
pub fn init() {
    let core = super::cpu_id();
    unsafe {
        // nCNTPNSIRQ IRQ enable is bit 1 of the per-core control word.
        mmio_write(phys_to_virt(CORE_TIMER_IRQCNTL + 4 * core), 1 << 1);
        asm!("msr cntp_ctl_el0, {}", in(reg) 1u64, options(nomem, nostack));
    }
    reset();
}

/// Rearm the timer for the next tick. Called from the interrupt path.
pub fn reset() {
    unsafe {
        asm!("msr cntp_tval_el0, {}", in(reg) TIMER_INTERVAL, options(nomem, nostack));
    }
}

/// Acknowledge a housekeeping clock tick. The Pi's system timer is owned by
/// the external platform package; the core only needs the rearm hook.
pub fn clock_reset() {}
