//! User virtual memory
//!
//! Builds, copies, mutates and frees per-process address spaces. All
//! functions take the root table of the address space they operate on; the
//! caller owns that space (the process is not runnable, or the scheduler
//! lock is held), so no lock lives here.

use core::ptr;

use crate::arch;
use crate::error::{FsError, KernelError, KernelResult};
use crate::mm::page_table::{leaf_flags, walk, Entry, PageFlags, PageTable, ENTRIES};
use crate::mm::{page_round_down, page_round_up, phys_to_virt, virt_to_phys, KMEM, PGSIZE, UADDR_SZ};

/// Span covered by one missing level-2 entry; `deallocuvm` skips holes at
/// this granularity.
const L2_SPAN: usize = 1 << 21;

/// Allocate an empty root page table.
pub fn pgdir_init() -> KernelResult<*mut PageTable> {
    let frame = KMEM.alloc()?;
    Ok(frame as *mut PageTable)
}

/// Map `[va, va+size)` to `[pa, pa+size)` with `perm` leaf permissions.
/// Neither end needs to be page-aligned; both are aligned down. Remapping
/// an already-present leaf is a fatal kernel bug.
///
/// # Safety
///
/// `root` must be a live, exclusively held address space; `pa` must
/// reference memory the new mapping may expose.
pub unsafe fn map_region(
    root: *mut PageTable,
    va: usize,
    size: usize,
    pa: usize,
    perm: PageFlags,
) -> KernelResult<()> {
    let mut a = page_round_down(va);
    let last = page_round_down(va + size - 1);
    let mut pa = pa;
    loop {
        // SAFETY: live table per contract.
        let entry = unsafe { walk(root, a, true) }.ok_or(KernelError::OutOfMemory)?;
        // SAFETY: walk returned a live level-3 entry.
        let entry = unsafe { &mut *entry };
        if entry.is_valid() {
            panic!("map_region: remap at {:#x}", a);
        }
        entry.set(pa, leaf_flags(perm));
        if a == last {
            break;
        }
        a += PGSIZE;
        pa += PGSIZE;
    }
    Ok(())
}

/// Install one page of executable content at user address 0. Used once, for
/// the embedded initcode of the first process.
///
/// # Safety
///
/// `root` must be a fresh, exclusively held address space.
pub unsafe fn uvm_init(root: *mut PageTable, code: &[u8]) {
    if code.len() >= PGSIZE {
        panic!("uvm_init: initcode larger than a page");
    }
    let mem = KMEM.alloc().expect("uvm_init: out of memory");
    // SAFETY: fresh space, fresh frame.
    unsafe {
        map_region(
            root,
            0,
            PGSIZE,
            virt_to_phys(mem as usize),
            PageFlags::USER | PageFlags::RW,
        )
        .expect("uvm_init: map failed");
        ptr::copy_nonoverlapping(code.as_ptr(), mem, code.len());
    }
}

/// Grow the user range from `oldsz` to `newsz` with zeroed user pages.
/// Rolls the space back to `oldsz` when memory runs out mid-way.
///
/// # Safety
///
/// `root` must be a live, exclusively held address space whose user size
/// is `oldsz`.
pub unsafe fn allocuvm(root: *mut PageTable, oldsz: usize, newsz: usize) -> KernelResult<usize> {
    if newsz >= UADDR_SZ {
        return Err(KernelError::InvalidArgument { name: "newsz" });
    }
    if newsz < oldsz {
        return Ok(oldsz);
    }
    let mut a = page_round_up(oldsz);
    while a < newsz {
        let mem = match KMEM.alloc() {
            Ok(m) => m,
            Err(e) => {
                log::warn!("allocuvm: out of memory");
                // SAFETY: unwinding our own partial growth.
                unsafe { deallocuvm(root, newsz, oldsz) };
                return Err(e);
            }
        };
        // SAFETY: fresh frame; remap impossible below the recorded size.
        if let Err(e) = unsafe {
            map_region(root, a, PGSIZE, virt_to_phys(mem as usize), PageFlags::USER)
        } {
            // SAFETY: `mem` was never mapped.
            unsafe {
                KMEM.free(mem);
                deallocuvm(root, newsz, oldsz);
            }
            return Err(e);
        }
        a += PGSIZE;
    }
    Ok(newsz)
}

/// Shrink the user range from `oldsz` to `newsz`, unmapping and freeing
/// pages in `[newsz, oldsz)`. `newsz >= oldsz` is a no-op returning
/// `oldsz`: shrinking is the `newsz < oldsz` direction, the caller picks
/// the order of the two sizes.
///
/// # Safety
///
/// `root` must be a live, exclusively held address space.
pub unsafe fn deallocuvm(root: *mut PageTable, oldsz: usize, newsz: usize) -> usize {
    if newsz >= oldsz {
        return oldsz;
    }
    let mut a = page_round_up(newsz);
    while a < oldsz {
        // SAFETY: live table per contract.
        match unsafe { walk(root, a, false) } {
            None => {
                // No level-3 table here; skip to the next 2 MiB boundary.
                a = (a + L2_SPAN) & !(L2_SPAN - 1);
            }
            Some(entry) => {
                // SAFETY: walk returned a live entry.
                let entry = unsafe { &mut *entry };
                if entry.is_valid() {
                    let pa = entry.addr();
                    if pa == 0 {
                        panic!("deallocuvm: zero frame");
                    }
                    // SAFETY: the frame was owned by this mapping.
                    unsafe { KMEM.free(phys_to_virt(pa) as *mut u8) };
                    entry.clear();
                }
                a += PGSIZE;
            }
        }
    }
    newsz
}

/// Clone the first `sz` bytes of `root` into a fresh address space. This is
/// the fork primitive: a byte-wise copy, no copy-on-write. On failure the
/// partially built space is freed entirely.
///
/// # Safety
///
/// `root` must be a live address space of at least `sz` mapped bytes,
/// exclusively held for the duration.
pub unsafe fn copyuvm(root: *mut PageTable, sz: usize) -> KernelResult<*mut PageTable> {
    let new_root = pgdir_init()?;
    let mut va = 0;
    while va < sz {
        // SAFETY: live table per contract.
        let entry = unsafe { walk(root, va, false) }.unwrap_or_else(|| {
            panic!("copyuvm: hole at {:#x}", va);
        });
        // SAFETY: walk returned a live entry.
        let entry = unsafe { *entry };
        if !entry.flags_contain(PageFlags::VALID | PageFlags::PAGE) {
            panic!("copyuvm: page not present at {:#x}", va);
        }
        let perm = entry.perm(PageFlags::USER | PageFlags::RO);
        let mem = match KMEM.alloc() {
            Ok(m) => m,
            Err(e) => {
                // SAFETY: freeing the partial copy we own.
                unsafe { vm_free(new_root) };
                return Err(e);
            }
        };
        // SAFETY: source page is mapped; destination frame is fresh.
        unsafe {
            ptr::copy_nonoverlapping(phys_to_virt(entry.addr()) as *const u8, mem, PGSIZE);
        }
        // SAFETY: fresh space, fresh frame.
        if let Err(e) =
            unsafe { map_region(new_root, va, PGSIZE, virt_to_phys(mem as usize), perm) }
        {
            // SAFETY: `mem` was never mapped; the partial copy is ours.
            unsafe {
                KMEM.free(mem);
                vm_free(new_root);
            }
            return Err(e);
        }
        va += PGSIZE;
    }
    Ok(new_root)
}

/// Copy `sz` bytes at file offset `offset` into pages already mapped at
/// `va`. `va` and `offset` must be congruent modulo the page size so every
/// page can be filled with one offset-coherent read.
///
/// # Safety
///
/// `root` must be a live address space with `[va, va+sz)` mapped.
pub unsafe fn loaduvm<R>(
    root: *mut PageTable,
    va: usize,
    read: &mut R,
    offset: u32,
    sz: u32,
) -> KernelResult<()>
where
    R: FnMut(&mut [u8], u32) -> KernelResult<usize>,
{
    if (va.wrapping_sub(offset as usize)) % PGSIZE != 0 {
        panic!("loaduvm: va {:#x} not aligned with offset {:#x}", va, offset);
    }
    let mut va = va;
    let mut offset = offset;
    let mut left = sz;
    while left > 0 {
        let page = page_round_down(va);
        // SAFETY: live table per contract.
        let entry = unsafe { walk(root, page, false) }
            .unwrap_or_else(|| panic!("loaduvm: {:#x} should be mapped", page));
        // SAFETY: walk returned a live entry.
        let entry = unsafe { *entry };
        if !entry.is_valid() {
            panic!("loaduvm: {:#x} should be mapped", page);
        }
        let start = va - page;
        let n = core::cmp::min(left as usize, PGSIZE - start);
        // SAFETY: the mapped frame is PGSIZE long and ours to fill.
        let dst = unsafe {
            core::slice::from_raw_parts_mut(phys_to_virt(entry.addr() + start) as *mut u8, n)
        };
        if read(dst, offset)? != n {
            return Err(KernelError::Fs(FsError::IoError));
        }
        va += n;
        offset += n as u32;
        left -= n as u32;
    }
    Ok(())
}

/// Revoke user access to the page at `va`; used to plant the guard page
/// below the user stack.
///
/// # Safety
///
/// `root` must be a live, exclusively held address space with `va` mapped.
pub unsafe fn clearpteu(root: *mut PageTable, va: usize) {
    // SAFETY: live table per contract.
    let entry = unsafe { walk(root, va, false) }
        .unwrap_or_else(|| panic!("clearpteu: {:#x} not mapped", va));
    // SAFETY: walk returned a live entry.
    let entry = unsafe { &mut *entry };
    let cleared = entry.raw() & !(PageFlags::USER.bits() | PageFlags::RO.bits());
    entry.set_raw(cleared | PageFlags::RW.bits());
}

/// Kernel alias of the user page backing `va`, or `None` when the page is
/// absent, kernel-only or read-only.
///
/// # Safety
///
/// `root` must be a live address space.
pub unsafe fn uva2ka(root: *mut PageTable, va: usize) -> Option<*mut u8> {
    // SAFETY: live table per contract.
    let entry = unsafe { walk(root, va, false) }?;
    // SAFETY: walk returned a live entry.
    let entry = unsafe { *entry };
    if !entry.flags_contain(PageFlags::VALID | PageFlags::PAGE) {
        return None;
    }
    if !entry.flags_contain(PageFlags::USER) || entry.flags_contain(PageFlags::RO) {
        return None;
    }
    Some(phys_to_virt(entry.addr()) as *mut u8)
}

/// Copy `src` into the user address space at `va`, resolving each page
/// through its kernel alias.
///
/// # Safety
///
/// `root` must be a live address space.
pub unsafe fn copyout(root: *mut PageTable, va: usize, src: &[u8]) -> KernelResult<()> {
    let mut va = va;
    let mut src = src;
    while !src.is_empty() {
        let va0 = page_round_down(va);
        // SAFETY: live table per contract.
        let pa0 = unsafe { uva2ka(root, va0) }.ok_or(KernelError::BadAddress { addr: va })?;
        let n = core::cmp::min(src.len(), PGSIZE - (va - va0));
        // SAFETY: uva2ka guarantees a writable user frame.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), pa0.add(va - va0), n);
        }
        src = &src[n..];
        va = va0 + PGSIZE;
    }
    Ok(())
}

/// Free an entire address-space tree: leaves drop the backing user frames,
/// inner levels drop their child tables, the root goes last.
///
/// # Safety
///
/// `root` must be a live address space nobody references anymore (not
/// installed in TTBR0 on any CPU).
pub unsafe fn vm_free(root: *mut PageTable) {
    // SAFETY: exclusive ownership per contract.
    unsafe { free_level(root, 0) }
}

unsafe fn free_level(table: *mut PageTable, level: usize) {
    for i in 0..ENTRIES {
        // SAFETY: `table` is live at this level.
        let entry: Entry = unsafe { (*table).entries[i] };
        if !entry.is_valid() {
            continue;
        }
        let child = phys_to_virt(entry.addr());
        if level == 3 {
            // SAFETY: leaf frames belong to this space.
            unsafe { KMEM.free(child as *mut u8) };
        } else {
            // SAFETY: valid non-leaf entries point at child tables.
            unsafe { free_level(child as *mut PageTable, level + 1) };
        }
    }
    // SAFETY: all children are gone; the table frame itself goes last.
    unsafe { KMEM.free(table as *mut u8) };
}

/// Install this address space into the user translation base register.
pub fn uvm_switch(root: *mut PageTable) {
    if root.is_null() {
        panic!("uvm_switch: no page table");
    }
    // SAFETY: the root is a live level-0 table.
    unsafe { arch::set_ttbr0(virt_to_phys(root as usize) as u64) };
}
