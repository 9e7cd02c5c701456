//! Kernel image entry
//!
//! The boot package (assembly, vector table, MMU bring-up) calls `kmain`
//! on every core with the direct map installed. Core 0 initializes the
//! kernel proper and seeds the first process; secondaries wait, then all
//! cores fall into their scheduler loop and never return.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
mod boot {
    use core::panic::PanicInfo;
    use core::sync::atomic::{AtomicBool, Ordering};

    use ferrite_kernel::{arch, klog, mm, println, process, trap};

    extern "C" {
        /// End of the kernel image, from the linker script.
        static _kernel_end: u8;
        /// Embedded initcode image, from the boot package.
        static _binary_initcode_start: u8;
        static _binary_initcode_size: u8;
    }

    static STARTED: AtomicBool = AtomicBool::new(false);

    #[no_mangle]
    pub extern "C" fn kmain() -> ! {
        if arch::cpu_id() == 0 {
            klog::init(log::LevelFilter::Info);
            log::info!("ferrite {} booting", env!("CARGO_PKG_VERSION"));

            // SAFETY: the linker script defines the symbol.
            let start = unsafe { core::ptr::addr_of!(_kernel_end) } as usize;
            // SAFETY: everything between the image end and the peripheral
            // window is ours.
            unsafe { mm::init(start, mm::phys_to_virt(mm::PHYSTOP)) };

            trap::init();
            process::user_init(initcode());
            STARTED.store(true, Ordering::Release);
        } else {
            while !STARTED.load(Ordering::Acquire) {
                core::hint::spin_loop();
            }
            trap::init();
        }
        log::info!("core {} scheduling", arch::cpu_id());
        process::scheduler()
    }

    fn initcode() -> &'static [u8] {
        // SAFETY: the boot package links the initcode blob and exports its
        // bounds under these names.
        unsafe {
            let start = core::ptr::addr_of!(_binary_initcode_start);
            let size = core::ptr::addr_of!(_binary_initcode_size) as usize;
            core::slice::from_raw_parts(start, size)
        }
    }

    #[panic_handler]
    fn panic(info: &PanicInfo) -> ! {
        println!("KERNEL PANIC on core {}: {}", arch::cpu_id(), info);
        arch::halt()
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    eprintln!("ferrite-kernel is a bare-metal image; build it for aarch64-unknown-none");
}
