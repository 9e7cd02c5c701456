//! Memory management
//!
//! Physical frames come from a free-list allocator seeded with everything
//! between the kernel image and the peripheral window. User address spaces
//! are four-level ARMv8 page tables; the kernel itself runs on a direct map
//! at `KERNBASE` installed by the boot package, so a physical frame is
//! reachable at `KERNBASE + pa`.

pub mod frame_allocator;
pub mod heap;
pub mod page_table;
pub mod vm;

pub use frame_allocator::KMEM;

/// Size of a page and a physical frame.
pub const PGSIZE: usize = 4096;

/// Top of usable RAM: the Raspberry Pi 3 peripheral window starts here.
pub const PHYSTOP: usize = 0x3F00_0000;

/// Ceiling of a user address space.
pub const UADDR_SZ: usize = 1 << 30;

/// Base of the kernel direct map. The host build uses an identity map so
/// the same page-table code runs inside unit tests.
#[cfg(target_os = "none")]
pub const KERNBASE: usize = 0xFFFF_0000_0000_0000;
#[cfg(not(target_os = "none"))]
pub const KERNBASE: usize = 0;

/// Kernel virtual address of a physical address.
#[inline]
pub const fn phys_to_virt(pa: usize) -> usize {
    KERNBASE + pa
}

/// Physical address behind a direct-mapped kernel virtual address.
#[inline]
pub const fn virt_to_phys(va: usize) -> usize {
    va - KERNBASE
}

#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PGSIZE - 1) & !(PGSIZE - 1)
}

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PGSIZE - 1)
}

/// Hand all frames in `[start, end)` (kernel virtual addresses) to the
/// frame allocator and bring up the kernel heap.
///
/// # Safety
///
/// The range must be unused RAM; called once, before any allocation.
pub unsafe fn init(start: usize, end: usize) {
    unsafe {
        KMEM.init(start, end);
        heap::init();
    }
    log::info!(
        "memory: {} free frames in [{:#x}, {:#x})",
        KMEM.free_frames(),
        page_round_up(start),
        page_round_down(end)
    );
}
