//! Physical frame allocator
//!
//! Free frames form a singly linked list threaded through the frames
//! themselves; allocation is LIFO so a just-freed (still cache-warm) frame
//! is handed out first. A freed frame is filled with a junk pattern to make
//! use-after-free visible, an allocated frame is returned zeroed.

use core::ptr;

use crate::error::{KernelError, KernelResult};
use crate::mm::{page_round_down, page_round_up, PGSIZE};
use crate::sync::SpinLock;

/// Byte written over a frame on free.
const JUNK: u8 = 0x11;

struct FreeList {
    /// Address of the first free frame; 0 when empty.
    head: usize,
    /// Managed range, page-aligned, recorded at init.
    start: usize,
    end: usize,
    free: usize,
}

/// The allocator. One global instance (`KMEM`) owns all of RAM; tests
/// build private instances over leaked arenas.
pub struct FrameAllocator {
    inner: SpinLock<FreeList>,
}

/// Global frame allocator, seeded by `mm::init`.
pub static KMEM: FrameAllocator = FrameAllocator::new("kmem");

impl FrameAllocator {
    pub const fn new(name: &'static str) -> Self {
        Self {
            inner: SpinLock::new(
                name,
                FreeList {
                    head: 0,
                    start: 0,
                    end: 0,
                    free: 0,
                },
            ),
        }
    }

    /// Accept ownership of `[start, end)` and push every whole frame in it.
    ///
    /// # Safety
    ///
    /// The range must be unused memory, exclusively owned by this
    /// allocator from now on.
    pub unsafe fn init(&self, start: usize, end: usize) {
        let start = page_round_up(start);
        let end = page_round_down(end);
        {
            let mut list = self.inner.lock();
            list.head = 0;
            list.start = start;
            list.end = end;
            list.free = 0;
        }
        let mut page = start;
        while page + PGSIZE <= end {
            unsafe { self.free(page as *mut u8) };
            page += PGSIZE;
        }
    }

    /// Allocate one zeroed frame.
    pub fn alloc(&self) -> KernelResult<*mut u8> {
        let page = {
            let mut list = self.inner.lock();
            let page = list.head;
            if page == 0 {
                return Err(KernelError::OutOfMemory);
            }
            // SAFETY: every list node is a free frame we own.
            list.head = unsafe { *(page as *const usize) };
            list.free -= 1;
            page
        };
        // SAFETY: the frame just left the free list; nobody else sees it.
        unsafe { ptr::write_bytes(page as *mut u8, 0, PGSIZE) };
        Ok(page as *mut u8)
    }

    /// Return a frame to the free list.
    ///
    /// # Safety
    ///
    /// `page` must have come from `alloc` on this allocator and must not be
    /// used afterwards.
    pub unsafe fn free(&self, page: *mut u8) {
        let addr = page as usize;
        let mut list = self.inner.lock();
        if addr % PGSIZE != 0 || addr < list.start || addr >= list.end {
            panic!("kfree: bad frame {:#x}", addr);
        }
        // Junk-fill to catch dangling references.
        // SAFETY: the caller relinquished the frame.
        unsafe {
            ptr::write_bytes(page, JUNK, PGSIZE);
            *(addr as *mut usize) = list.head;
        }
        list.head = addr;
        list.free += 1;
    }

    /// Number of frames currently on the free list.
    pub fn free_frames(&self) -> usize {
        self.inner.lock().free
    }

    /// Debug check: every node of the free list lies inside the managed
    /// range and is page-aligned.
    pub fn audit(&self) -> bool {
        let list = self.inner.lock();
        let mut node = list.head;
        while node != 0 {
            if node % PGSIZE != 0 || node < list.start || node >= list.end {
                return false;
            }
            // SAFETY: validated node within our range.
            node = unsafe { *(node as *const usize) };
        }
        true
    }
}
