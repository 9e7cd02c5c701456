//! `execve`: replace the calling process image with an on-disk ELF
//!
//! Loads every `PT_LOAD` segment into a fresh address space, plants a
//! guard page under a one-page user stack, pushes argv/envp/auxv, and
//! switches the process over. Any failure frees the half-built space and
//! drops the inode; the old image survives untouched.

use alloc::vec::Vec;

use crate::error::{FsError, KernelError, KernelResult};
use crate::fs::{dir, inode, log};
use crate::mm::page_table::PageTable;
use crate::mm::{page_round_up, vm, PGSIZE};
use crate::process::{my_proc, MAXARG};

/// ELF identification and the header fields the loader consumes.
#[derive(Debug, Clone, Copy)]
pub struct ElfHeader {
    pub entry: u64,
    pub phoff: u64,
    pub phnum: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgramHeader {
    pub p_type: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub filesz: u64,
    pub memsz: u64,
}

pub const EHDR_SIZE: usize = 64;
pub const PHDR_SIZE: usize = 56;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELF_CLASS_64: u8 = 2;
const ELF_DATA_2LSB: u8 = 1;
const EM_AARCH64: u16 = 0xB7;
pub const PT_LOAD: u32 = 1;

const AT_NULL: u64 = 0;
const AT_PAGESZ: u64 = 6;

fn read_u16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn read_u32(b: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([b[off], b[off + 1], b[off + 2], b[off + 3]])
}

fn read_u64(b: &[u8], off: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&b[off..off + 8]);
    u64::from_le_bytes(raw)
}

/// Validate the identification bytes and pull out the loader-relevant
/// fields of an ELF64 header.
pub fn parse_elf_header(bytes: &[u8; EHDR_SIZE]) -> KernelResult<ElfHeader> {
    if bytes[0..4] != ELF_MAGIC {
        return Err(KernelError::Fs(FsError::BadElf));
    }
    if bytes[4] != ELF_CLASS_64 || bytes[5] != ELF_DATA_2LSB {
        return Err(KernelError::Fs(FsError::BadElf));
    }
    if read_u16(bytes, 18) != EM_AARCH64 {
        return Err(KernelError::Fs(FsError::BadElf));
    }
    Ok(ElfHeader {
        entry: read_u64(bytes, 24),
        phoff: read_u64(bytes, 32),
        phnum: read_u16(bytes, 56),
    })
}

/// Decode one ELF64 program header.
pub fn parse_program_header(bytes: &[u8; PHDR_SIZE]) -> ProgramHeader {
    ProgramHeader {
        p_type: read_u32(bytes, 0),
        offset: read_u64(bytes, 8),
        vaddr: read_u64(bytes, 16),
        filesz: read_u64(bytes, 32),
        memsz: read_u64(bytes, 40),
    }
}

/// Load every PT_LOAD segment of the locked inode into `root`. Returns the
/// resulting user size and the ELF entry point.
fn load_segments(
    root: *mut PageTable,
    ig: &mut inode::InodeGuard<'_>,
) -> KernelResult<(usize, u64)> {
    let mut ehdr_bytes = [0u8; EHDR_SIZE];
    if ig.readi(&mut ehdr_bytes, 0)? != EHDR_SIZE {
        return Err(KernelError::Fs(FsError::BadElf));
    }
    let elf = parse_elf_header(&ehdr_bytes)?;

    let mut sz = 0usize;
    let mut off = elf.phoff as u32;
    for _ in 0..elf.phnum {
        let mut phdr_bytes = [0u8; PHDR_SIZE];
        if ig.readi(&mut phdr_bytes, off)? != PHDR_SIZE {
            return Err(KernelError::Fs(FsError::BadElf));
        }
        off += PHDR_SIZE as u32;
        let ph = parse_program_header(&phdr_bytes);
        if ph.p_type != PT_LOAD {
            continue;
        }
        if ph.memsz < ph.filesz {
            return Err(KernelError::Fs(FsError::BadElf));
        }
        // SAFETY: root is the fresh space this exec exclusively owns.
        sz = unsafe { vm::allocuvm(root, sz, (ph.vaddr + ph.memsz) as usize) }?;
        let mut read = |dst: &mut [u8], off: u32| ig.readi(dst, off);
        // SAFETY: the range was just mapped by allocuvm.
        unsafe { vm::loaduvm(root, ph.vaddr as usize, &mut read, ph.offset as u32, ph.filesz as u32) }?;
    }
    Ok((sz, elf.entry))
}

/// Lay out the initial user stack:
///
/// argv strings grow down from the stack top, then the auxiliary vector
/// (`AT_PAGESZ` and a terminator), an empty envp, the argv pointer array,
/// and finally argc; the resulting stack pointer is 16-byte aligned.
fn build_stack(
    root: *mut PageTable,
    sz: usize,
    argv: &[&str],
) -> KernelResult<(usize, u64, u64)> {
    let sz = page_round_up(sz);
    // One stack page plus one guard page below it.
    // SAFETY: fresh space owned by this exec.
    let sz = unsafe { vm::allocuvm(root, sz, sz + 2 * PGSIZE) }?;
    // SAFETY: the guard page was just mapped.
    unsafe { vm::clearpteu(root, sz - 2 * PGSIZE) };

    let mut sp = sz;
    let argc = argv.len();
    let mut ustack: Vec<u64> = Vec::with_capacity(argc + 1);

    for arg in argv {
        sp -= arg.len() + 1;
        sp &= !0xF;
        let mut bytes: Vec<u8> = Vec::with_capacity(arg.len() + 1);
        bytes.extend_from_slice(arg.as_bytes());
        bytes.push(0);
        // SAFETY: sp stays inside the freshly mapped stack page.
        unsafe { vm::copyout(root, sp, &bytes) }?;
        ustack.push(sp as u64);
    }
    ustack.push(0);

    // Keep the final frame 16-byte aligned: the words below the strings
    // are auxv (4) + envp terminator (1) + argv array (argc+1) + argc (1).
    if argc % 2 == 0 {
        sp -= 8;
    }

    let auxv: [u64; 4] = [0, AT_PAGESZ, PGSIZE as u64, AT_NULL];
    sp -= core::mem::size_of_val(&auxv);
    // SAFETY: still inside the stack page.
    unsafe { vm::copyout(root, sp, as_bytes(&auxv)) }?;

    sp -= 8;
    // SAFETY: still inside the stack page.
    unsafe { vm::copyout(root, sp, &0u64.to_le_bytes()) }?;

    sp -= (argc + 1) * 8;
    let argv_base = sp as u64;
    // SAFETY: still inside the stack page.
    unsafe { vm::copyout(root, sp, as_bytes(&ustack)) }?;

    sp -= 8;
    // SAFETY: still inside the stack page.
    unsafe { vm::copyout(root, sp, &(argc as u64).to_le_bytes()) }?;

    Ok((sz, sp as u64, argv_base))
}

fn as_bytes(words: &[u64]) -> &[u8] {
    // SAFETY: u64 has no padding and any byte pattern is valid.
    unsafe { core::slice::from_raw_parts(words.as_ptr() as *const u8, words.len() * 8) }
}

/// Replace the calling process image with the executable at `path`.
/// On success returns argc (also planted in the return register).
pub fn execve(path: &str, argv: &[&str], _envp: &[&str]) -> KernelResult<usize> {
    if argv.len() > MAXARG {
        return Err(KernelError::InvalidArgument { name: "argv" });
    }

    log::begin_op();
    let Some(ip) = dir::namei(path) else {
        log::end_op();
        return Err(KernelError::Fs(FsError::NotFound));
    };
    let mut ig = inode::ilock(&ip);

    let pgdir = match vm::pgdir_init() {
        Ok(p) => p,
        Err(e) => {
            drop(ig);
            inode::iput(ip);
            log::end_op();
            return Err(e);
        }
    };

    let (sz, entry) = match load_segments(pgdir, &mut ig) {
        Ok(v) => v,
        Err(e) => {
            drop(ig);
            inode::iput(ip);
            log::end_op();
            // SAFETY: the partial space belongs to this failed exec.
            unsafe { vm::vm_free(pgdir) };
            return Err(e);
        }
    };
    drop(ig);
    inode::iput(ip);
    log::end_op();

    let (sz, sp, argv_base) = match build_stack(pgdir, sz, argv) {
        Ok(v) => v,
        Err(e) => {
            // SAFETY: the new space belongs to this failed exec.
            unsafe { vm::vm_free(pgdir) };
            return Err(e);
        }
    };

    let p = my_proc().expect("exec: no process");
    let old_pgdir = p.pgdir;
    p.pgdir = pgdir;
    p.sz = sz;
    // SAFETY: the trap frame lives on our kernel stack.
    let tf = unsafe { &mut *p.tf };
    tf.x[0] = argv.len() as u64;
    tf.x[1] = argv_base;
    tf.sp = sp;
    tf.elr = entry;
    vm::uvm_switch(p.pgdir);
    // SAFETY: no CPU references the old space anymore.
    unsafe { vm::vm_free(old_pgdir) };
    Ok(argv.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_header() -> [u8; EHDR_SIZE] {
        let mut h = [0u8; EHDR_SIZE];
        h[0..4].copy_from_slice(&ELF_MAGIC);
        h[4] = ELF_CLASS_64;
        h[5] = ELF_DATA_2LSB;
        h[18..20].copy_from_slice(&EM_AARCH64.to_le_bytes());
        h[24..32].copy_from_slice(&0x4000u64.to_le_bytes()); // entry
        h[32..40].copy_from_slice(&64u64.to_le_bytes()); // phoff
        h[56..58].copy_from_slice(&1u16.to_le_bytes()); // phnum
        h
    }

    #[test]
    fn accepts_a_well_formed_header() {
        let elf = parse_elf_header(&valid_header()).unwrap();
        assert_eq!(elf.entry, 0x4000);
        assert_eq!(elf.phoff, 64);
        assert_eq!(elf.phnum, 1);
    }

    #[test]
    fn rejects_bad_magic_class_and_machine() {
        let mut h = valid_header();
        h[0] = 0x7E;
        assert!(parse_elf_header(&h).is_err());

        let mut h = valid_header();
        h[4] = 1; // 32-bit
        assert!(parse_elf_header(&h).is_err());

        let mut h = valid_header();
        h[18] = 0x3E; // x86-64
        assert!(parse_elf_header(&h).is_err());
    }

    #[test]
    fn program_header_fields_decode() {
        let mut b = [0u8; PHDR_SIZE];
        b[0..4].copy_from_slice(&PT_LOAD.to_le_bytes());
        b[8..16].copy_from_slice(&0x1000u64.to_le_bytes());
        b[16..24].copy_from_slice(&0x40_0000u64.to_le_bytes());
        b[32..40].copy_from_slice(&100u64.to_le_bytes());
        b[40..48].copy_from_slice(&200u64.to_le_bytes());
        let ph = parse_program_header(&b);
        assert_eq!(ph.p_type, PT_LOAD);
        assert_eq!(ph.offset, 0x1000);
        assert_eq!(ph.vaddr, 0x40_0000);
        assert_eq!(ph.filesz, 100);
        assert_eq!(ph.memsz, 200);
    }
}
