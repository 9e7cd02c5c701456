//! Open-file layer
//!
//! A fixed system-wide table of open files, shared across processes by
//! reference count (`fork` duplicates descriptors, `dup` shares offsets).
//! Inode-backed files route reads and writes through the inode layer;
//! device files go to the registered device switch entry.

use crate::error::{FsError, KernelError, KernelResult};
use crate::sync::SpinLock;

use super::inode::{self, InodeRef};
use super::{log, Stat, BSIZE};

/// System-wide open files.
pub const NFILE: usize = 100;

/// Device switch entries.
pub const NDEV: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    None,
    Inode,
}

struct FileSlot {
    refcnt: u32,
    ftype: FileType,
    readable: bool,
    writable: bool,
    ip: Option<InodeRef>,
    off: u32,
}

impl FileSlot {
    const fn new() -> Self {
        Self {
            refcnt: 0,
            ftype: FileType::None,
            readable: false,
            writable: false,
            ip: None,
            off: 0,
        }
    }
}

static FTABLE: SpinLock<[FileSlot; NFILE]> =
    SpinLock::new("ftable", [const { FileSlot::new() }; NFILE]);

/// A counted handle on an open file. Not `Clone`: new handles come from
/// `dup`, and each ends in exactly one `close`.
#[derive(Debug)]
pub struct FileRef(usize);

/// Grab a free file-table slot.
pub fn alloc() -> Option<FileRef> {
    let mut table = FTABLE.lock();
    for (i, slot) in table.iter_mut().enumerate() {
        if slot.refcnt == 0 {
            slot.refcnt = 1;
            slot.ftype = FileType::None;
            slot.readable = false;
            slot.writable = false;
            slot.off = 0;
            return Some(FileRef(i));
        }
    }
    None
}

/// Turn a fresh slot into an inode-backed open file. The inode reference
/// moves into the table.
pub fn init_inode(f: &FileRef, ip: InodeRef, readable: bool, writable: bool) {
    let mut table = FTABLE.lock();
    let slot = &mut table[f.0];
    slot.ftype = FileType::Inode;
    slot.ip = Some(ip);
    slot.readable = readable;
    slot.writable = writable;
    slot.off = 0;
}

/// Another handle on the same open file (shared offset).
pub fn dup(f: &FileRef) -> FileRef {
    let mut table = FTABLE.lock();
    if table[f.0].refcnt == 0 {
        panic!("filedup: no reference");
    }
    table[f.0].refcnt += 1;
    FileRef(f.0)
}

/// Drop a handle; the last one releases the slot and its inode.
pub fn close(f: FileRef) {
    let idx = f.0;
    let mut table = FTABLE.lock();
    let slot = &mut table[idx];
    if slot.refcnt == 0 {
        panic!("fileclose: no reference");
    }
    slot.refcnt -= 1;
    if slot.refcnt > 0 {
        return;
    }
    let ip = slot.ip.take();
    let ftype = slot.ftype;
    slot.ftype = FileType::None;
    slot.readable = false;
    slot.writable = false;
    slot.off = 0;
    drop(table);

    if ftype == FileType::Inode {
        if let Some(ip) = ip {
            log::begin_op();
            inode::iput(ip);
            log::end_op();
        }
    }
}

/// Exclusive view of the slot behind a live handle.
///
/// Sound because the caller's handle keeps `refcnt > 0`, which pins every
/// field except `refcnt` itself: nobody repurposes or closes the slot
/// underneath us. The shared offset is racy between two handles of the
/// same file, as it always was.
#[allow(clippy::mut_from_ref)]
fn slot_of(f: &FileRef) -> &'static mut FileSlot {
    // SAFETY: see above.
    unsafe { &mut (*FTABLE.raw())[f.0] }
}

/// Metadata of the backing inode.
pub fn stat(f: &FileRef) -> KernelResult<Stat> {
    let slot = slot_of(f);
    match slot.ftype {
        FileType::Inode => {
            let ip = slot.ip.as_ref().expect("filestat: no inode");
            let ig = inode::ilock(ip);
            Ok(ig.stati())
        }
        FileType::None => Err(KernelError::Fs(FsError::BadFileDescriptor)),
    }
}

/// Read from the file at its current offset.
pub fn read(f: &FileRef, dst: &mut [u8]) -> KernelResult<usize> {
    let slot = slot_of(f);
    if !slot.readable {
        return Err(KernelError::Fs(FsError::BadFileDescriptor));
    }
    match slot.ftype {
        FileType::Inode => {
            let ip = slot.ip.as_ref().expect("fileread: no inode");
            let mut ig = inode::ilock(ip);
            let n = ig.readi(dst, slot.off)?;
            slot.off += n as u32;
            Ok(n)
        }
        FileType::None => panic!("fileread: unused file"),
    }
}

/// Write the whole of `src` at the current offset, splitting into chunks
/// that each fit one log transaction. A short write from the inode layer
/// surfaces as an error; there are no partial success reports.
pub fn write(f: &FileRef, src: &[u8]) -> KernelResult<usize> {
    let slot = slot_of(f);
    if !slot.writable {
        return Err(KernelError::Fs(FsError::BadFileDescriptor));
    }
    match slot.ftype {
        FileType::Inode => {
            // Each chunk must fit the log together with its bitmap,
            // indirect and inode blocks.
            let max = ((log::LOGSIZE - 4) / 2) * BSIZE;
            let ip = slot.ip.as_ref().expect("filewrite: no inode");
            let mut done = 0;
            while done < src.len() {
                let chunk = core::cmp::min(max, src.len() - done);
                log::begin_op();
                let mut ig = inode::ilock(ip);
                let r = ig.writei(&src[done..done + chunk], slot.off);
                if let Ok(n) = &r {
                    slot.off += *n as u32;
                }
                drop(ig);
                log::end_op();
                let n = r?;
                if n != chunk {
                    return Err(KernelError::Fs(FsError::IoError));
                }
                done += chunk;
            }
            Ok(src.len())
        }
        FileType::None => panic!("filewrite: unused file"),
    }
}

/// Device switch entry: read/write vectors for one major number.
#[derive(Clone, Copy)]
pub struct DevSw {
    pub read: fn(&mut [u8]) -> KernelResult<usize>,
    pub write: fn(&[u8]) -> KernelResult<usize>,
}

static DEVSW: SpinLock<[Option<DevSw>; NDEV]> = SpinLock::new("devsw", [None; NDEV]);

/// Install the handlers for `major` (the console driver does this at
/// boot).
pub fn register_device(major: usize, dev: DevSw) {
    if major >= NDEV {
        panic!("register_device: major {} out of range", major);
    }
    DEVSW.lock()[major] = Some(dev);
}

pub(crate) fn dev_read(major: i16, dst: &mut [u8]) -> KernelResult<usize> {
    let entry = usize::try_from(major)
        .ok()
        .filter(|m| *m < NDEV)
        .and_then(|m| DEVSW.lock()[m]);
    match entry {
        Some(dev) => (dev.read)(dst),
        None => Err(KernelError::Fs(FsError::NoDevice)),
    }
}

pub(crate) fn dev_write(major: i16, src: &[u8]) -> KernelResult<usize> {
    let entry = usize::try_from(major)
        .ok()
        .filter(|m| *m < NDEV)
        .and_then(|m| DEVSW.lock()[m]);
    match entry {
        Some(dev) => (dev.write)(src),
        None => Err(KernelError::Fs(FsError::NoDevice)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_dup_close_balance_the_refcount() {
        let f = alloc().expect("file slot");
        let idx = f.0;
        let g = dup(&f);
        assert_eq!(g.0, idx);
        close(f);
        // Still alive through the second handle.
        assert!(FTABLE.lock()[idx].refcnt == 1);
        close(g);
        assert!(FTABLE.lock()[idx].refcnt == 0);
    }

    #[test]
    fn unregistered_majors_are_rejected() {
        let mut buf = [0u8; 4];
        assert!(dev_read(NDEV as i16 + 1, &mut buf).is_err());
        assert!(dev_write(-1, &buf).is_err());
    }

    #[test]
    fn registered_device_vectors_are_called() {
        fn r(dst: &mut [u8]) -> KernelResult<usize> {
            dst.fill(b'x');
            Ok(dst.len())
        }
        fn w(src: &[u8]) -> KernelResult<usize> {
            Ok(src.len())
        }
        register_device(5, DevSw { read: r, write: w });
        let mut buf = [0u8; 3];
        assert_eq!(dev_read(5, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"xxx");
        assert_eq!(dev_write(5, b"hi").unwrap(), 2);
    }
}
