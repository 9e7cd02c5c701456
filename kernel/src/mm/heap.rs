//! Kernel heap
//!
//! A fixed in-image region handed to `linked_list_allocator`. The heap
//! backs short-lived `alloc` use (exec argument staging); everything
//! long-lived sits in statically sized tables. Host builds use the system
//! allocator instead (see `lib.rs`).

#[cfg(target_os = "none")]
mod imp {
    use linked_list_allocator::LockedHeap;

    const HEAP_SIZE: usize = 1024 * 1024;

    #[global_allocator]
    static HEAP: LockedHeap = LockedHeap::empty();

    static mut HEAP_SPACE: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

    /// # Safety
    ///
    /// Called once during `mm::init`.
    pub unsafe fn init() {
        unsafe {
            HEAP.lock()
                .init(core::ptr::addr_of_mut!(HEAP_SPACE) as *mut u8, HEAP_SIZE);
        }
    }
}

#[cfg(not(target_os = "none"))]
mod imp {
    /// Host builds allocate through std's system allocator.
    ///
    /// # Safety
    ///
    /// Trivially safe; present for signature parity.
    pub unsafe fn init() {}
}

pub use imp::init;
