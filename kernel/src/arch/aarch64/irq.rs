//! BCM2837 interrupt routing (Raspberry Pi 3)
//!
//! Two blocks are involved: the legacy "GPU" interrupt controller that fans
//! peripheral lines (mini-UART, SD host) into one pending word pair, and the
//! per-core local controller that carries the generic-timer lines and the
//! GPU summary bit.

use crate::mm::phys_to_virt;

use super::{mmio_read, mmio_write};

/// Peripheral interrupt controller (legacy block).
const IRQ_BASE: usize = 0x3F00_B000;
const ENABLE_IRQS_1: usize = IRQ_BASE + 0x210;
const ENABLE_IRQS_2: usize = IRQ_BASE + 0x214;
const IRQ_PENDING_1: usize = IRQ_BASE + 0x204;
const IRQ_PENDING_2: usize = IRQ_BASE + 0x208;

/// Per-core local controller.
const LOCAL_BASE: usize = 0x4000_0000;
const GPU_INT_ROUTE: usize = LOCAL_BASE + 0x0C;
const IRQ_SRC_CORE: usize = LOCAL_BASE + 0x60;

/// Mini-UART line in pending/enable word 1.
pub const AUX_INT: u32 = 1 << 29;
/// Arasan SD host line in pending/enable word 2.
pub const SDIO_INT: u32 = 1 << 30;

/// Bits of the per-core interrupt source word.
pub const SRC_CNTPNSIRQ: u32 = 1 << 1;
pub const SRC_GPU: u32 = 1 << 8;
pub const SRC_LOCAL_TIMER: u32 = 1 << 11;

fn reg(phys: usize) -> usize {
    phys_to_virt(phys)
}

/// Enable the peripheral lines the kernel consumes and route the GPU
/// summary interrupt to core 0.
pub fn init() {
    unsafe {
        mmio_write(reg(ENABLE_IRQS_1), AUX_INT);
        mmio_write(reg(ENABLE_IRQS_2), SDIO_INT);
        mmio_write(reg(GPU_INT_ROUTE), 0);
    }
    log::info!("interrupt routing enabled");
}

/// Pending interrupt sources for one core.
pub fn source(core: usize) -> u32 {
    unsafe { mmio_read(reg(IRQ_SRC_CORE + 4 * core)) }
}

/// Pending words of the peripheral controller, consulted when the GPU
/// summary bit is set.
pub fn gpu_pending() -> (u32, u32) {
    unsafe { (mmio_read(reg(IRQ_PENDING_1)), mmio_read(reg(IRQ_PENDING_2))) }
}
