//! End-to-end filesystem scenarios over a RAM disk
//!
//! Each test formats a fresh file system (the mkfs the build scripts run
//! on real images, expressed with the kernel's own codecs), replays log
//! recovery, and drives the stack from path lookup down to the device.
//! The global caches are shared, so the tests serialize on one lock and
//! release every reference they take.

use spin::{Mutex, Once};

use ferrite_kernel::fs::buffer::{self, BufFlags};
use ferrite_kernel::fs::device::{self, RamDisk};
use ferrite_kernel::fs::dir::{self, make_name};
use ferrite_kernel::fs::inode::{self, InodeType, DINODE_SIZE, NDIRECT};
use ferrite_kernel::fs::log::{self, LogHeader, LOGSIZE};
use ferrite_kernel::fs::{self, file, SuperBlock, BPB, BSIZE, MBR_BASE, ROOTINO};

const DEV: u32 = fs::ROOTDEV;
const FSSIZE: u32 = 1000;
const NINODES: u32 = 200;
const NLOG: u32 = LOGSIZE as u32 + 1;

static DISK: Once<&'static RamDisk> = Once::new();
static FS_LOCK: Mutex<()> = Mutex::new(());

fn the_disk() -> &'static RamDisk {
    DISK.call_once(|| {
        let disk: &'static RamDisk =
            Box::leak(Box::new(RamDisk::new(MBR_BASE as usize + FSSIZE as usize)));
        device::register(disk);
        disk
    })
}

/// Geometry of the test image.
fn superblock() -> SuperBlock {
    let ninodeblocks = NINODES.div_ceil(8);
    let nbitmap = FSSIZE.div_ceil(BPB);
    let data_start = 2 + ninodeblocks + nbitmap;
    SuperBlock {
        size: FSSIZE,
        nblocks: FSSIZE - NLOG - data_start,
        ninodes: NINODES,
        nlog: NLOG,
        logstart: FSSIZE - NLOG,
        inodestart: 2,
    }
}

fn write_block(bno: u32, fill: impl FnOnce(&mut [u8])) {
    let mut b = buffer::bread(DEV, bno);
    b.data.fill(0);
    fill(&mut b.data);
    buffer::bwrite(&mut b);
    buffer::brelse(b);
}

/// Format the RAM disk: superblock, zeroed log, inode blocks with a root
/// directory, and a bitmap covering the metadata and the log.
fn mkfs() {
    let sb = superblock();
    let data_start = sb.bitmap_start() + FSSIZE.div_ceil(BPB);

    // Metadata blocks and the log region start out zeroed.
    for bno in 0..data_start {
        write_block(bno, |_| {});
    }
    for bno in sb.logstart..FSSIZE {
        write_block(bno, |_| {});
    }

    write_block(1, |data| sb.encode(data));

    // Root directory: inode 1, one link, no entries yet.
    write_block(inode::iblock(ROOTINO, &sb), |data| {
        let off = (ROOTINO as usize % 8) * DINODE_SIZE;
        data[off..off + 2].copy_from_slice(&(InodeType::Dir as i16).to_le_bytes());
        data[off + 6..off + 8].copy_from_slice(&1i16.to_le_bytes());
    });

    // Mark the metadata and log blocks used, lowest bits first.
    let mark = |bits: &mut [u8], b: u32| bits[(b % BPB) as usize >> 3] |= 1 << (b & 7);
    for bmb in 0..FSSIZE.div_ceil(BPB) {
        write_block(sb.bitmap_start() + bmb, |data| {
            for b in 0..BPB.min(FSSIZE - bmb * BPB) {
                let abs = bmb * BPB + b;
                if abs < data_start || abs >= sb.logstart {
                    mark(data, b);
                }
            }
        });
    }

    fs::init(DEV);
}

fn setup() -> spin::MutexGuard<'static, ()> {
    let _ = the_disk();
    let guard = FS_LOCK.lock();
    mkfs();
    guard
}

/// Create a regular file and write `content` through the file layer.
fn put_file(path: &str, content: &[u8]) {
    log::begin_op();
    let ip = dir::create(path, InodeType::File, 0, 0).expect("create");
    log::end_op();

    let f = file::alloc().expect("file slot");
    file::init_inode(&f, ip, true, true);
    assert_eq!(file::write(&f, content).expect("write"), content.len());
    file::close(f);
}

fn read_file(path: &str, len: usize) -> Vec<u8> {
    let ip = dir::namei(path).expect("namei");
    let mut ig = inode::ilock(&ip);
    let mut buf = vec![0u8; len];
    let n = ig.readi(&mut buf, 0).expect("readi");
    buf.truncate(n);
    drop(ig);
    log::begin_op();
    inode::iput(ip);
    log::end_op();
    buf
}

const ELF_STUB: &[u8] = &[0x7F, b'E', b'L', b'F', 2, 1, 1, 0, 0, 0, 0, 0];

#[test]
fn fresh_image_resolves_boot_files() {
    let _g = setup();

    for path in ["/init", "/ls", "/mkfs", "/sh", "/cat"] {
        put_file(path, ELF_STUB);
    }

    for path in ["/init", "/ls", "/mkfs", "/sh", "/cat"] {
        let ip = dir::namei(path).unwrap_or_else(|| panic!("{} missing", path));
        log::begin_op();
        inode::iput(ip);
        log::end_op();
    }
    assert!(dir::namei("/hello.cpp").is_none());

    assert_eq!(&read_file("/init", 4), &[0x7F, b'E', b'L', b'F']);
}

#[test]
fn create_write_read_roundtrip_persists_to_the_device() {
    let _g = setup();

    let text = b"This is a readme file\n";
    put_file("/readme.md", text);

    assert_eq!(read_file("/readme.md", 64), text);

    let ip = dir::namei("/readme.md").expect("file survives close");
    let mut ig = inode::ilock(&ip);
    assert_eq!(ig.size as usize, text.len());
    let block = ig.bmap(0).expect("bmap");
    drop(ig);
    log::begin_op();
    inode::iput(ip);
    log::end_op();

    // The committed transaction reached the device, not just the cache:
    // the first content block of the file carries the text on disk.
    let image = the_disk().snapshot();
    let start = (block + MBR_BASE) as usize * BSIZE;
    assert_eq!(&image[start..start + text.len()], text);
}

#[test]
fn committed_blocks_hit_the_device_after_end_op() {
    let _g = setup();
    let target = superblock().bitmap_start() + FSSIZE.div_ceil(BPB) + 3;

    log::begin_op();
    let mut b = buffer::bread(DEV, target);
    b.data[..8].copy_from_slice(b"ferrite!");
    log::log_write(&mut b);
    buffer::brelse(b);
    log::end_op();

    let image = the_disk().snapshot();
    let start = (target + MBR_BASE) as usize * BSIZE;
    assert_eq!(&image[start..start + 8], b"ferrite!");
}

#[test]
fn recovery_installs_a_committed_header_and_is_idempotent() {
    let _g = setup();
    let sb = superblock();
    let home = sb.bitmap_start() + FSSIZE.div_ceil(BPB) + 7;

    // Hand-craft a committed-but-not-installed transaction: data in log
    // slot 1, header naming the home block.
    write_block(sb.logstart + 1, |data| data[..5].copy_from_slice(b"crash"));
    write_block(sb.logstart, |data| {
        let mut lh = LogHeader::empty();
        lh.n = 1;
        lh.block[0] = home;
        lh.encode(data);
    });

    log::recover();
    let b = buffer::bread(DEV, home);
    assert_eq!(&b.data[..5], b"crash");
    assert!(b.flags.contains(BufFlags::VALID));
    buffer::brelse(b);

    // Replaying recovery changes nothing: the header was released.
    log::recover();
    let b = buffer::bread(DEV, home);
    assert_eq!(&b.data[..5], b"crash");
    buffer::brelse(b);

    let image = the_disk().snapshot();
    let head = LogHeader::decode(&image[(sb.logstart + MBR_BASE) as usize * BSIZE..]);
    assert_eq!(head.n, 0);
}

#[test]
fn directory_links_roundtrip_and_unlink_removes_them() {
    let _g = setup();

    log::begin_op();
    let d = dir::create("/docs", InodeType::Dir, 0, 0).expect("mkdir");
    log::end_op();

    // "." and ".." were wired by create.
    let mut dg = inode::ilock(&d);
    let dnum = dg.inum;
    let (dot, _) = dir::dirlookup(&mut dg, &make_name(b".")).expect("dot");
    let (dotdot, _) = dir::dirlookup(&mut dg, &make_name(b"..")).expect("dotdot");
    drop(dg);

    let dot_inum = inode::ilock(&dot).inum;
    let dotdot_inum = inode::ilock(&dotdot).inum;
    assert_eq!(dot_inum, dnum);
    assert_eq!(dotdot_inum, ROOTINO);

    log::begin_op();
    inode::iput(dot);
    inode::iput(dotdot);
    inode::iput(d);
    log::end_op();

    put_file("/docs/note", b"n");
    let note = dir::namei("/docs/note").expect("linked");
    let note_inum = inode::ilock(&note).inum;

    // dirlink then dirlookup agree on the inode number.
    let parent = dir::namei("/docs").expect("parent");
    let mut pg = inode::ilock(&parent);
    let (found, _) = dir::dirlookup(&mut pg, &make_name(b"note")).expect("lookup");
    assert_eq!(inode::ilock(&found).inum, note_inum);

    log::begin_op();
    dir::dirunlink(&mut pg, &make_name(b"note"), note_inum).expect("unlink");
    log::end_op();
    assert!(dir::dirlookup(&mut pg, &make_name(b"note")).is_none());
    drop(pg);

    log::begin_op();
    inode::iput(found);
    inode::iput(parent);
    inode::iput(note);
    log::end_op();

    assert!(dir::namei("/docs/note").is_none());
}

#[test]
fn path_lookup_ignores_repeated_and_trailing_slashes() {
    let _g = setup();

    log::begin_op();
    let a = dir::create("/a", InodeType::Dir, 0, 0).expect("mkdir a");
    log::end_op();
    put_file("/a/b", b"x");

    let plain = dir::namei("/a/b").expect("plain");
    let messy = dir::namei("/a//b/").expect("messy");
    let plain_inum = inode::ilock(&plain).inum;
    let messy_inum = inode::ilock(&messy).inum;
    assert_eq!(plain_inum, messy_inum);

    log::begin_op();
    inode::iput(plain);
    inode::iput(messy);
    inode::iput(a);
    log::end_op();

    // A file used as a directory component fails cleanly.
    assert!(dir::namei("/a/b/c").is_none());
}

#[test]
fn large_files_reach_through_the_indirect_block() {
    let _g = setup();

    let len = (NDIRECT + 3) * BSIZE;
    let content: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
    put_file("/big", &content);

    let ip = dir::namei("/big").expect("big");
    let mut ig = inode::ilock(&ip);
    assert_eq!(ig.size as usize, len);
    // The tail lives past the direct window.
    assert_ne!(ig.addrs[NDIRECT], 0);
    let mut tail = vec![0u8; BSIZE];
    let off = ((NDIRECT + 2) * BSIZE) as u32;
    assert_eq!(ig.readi(&mut tail, off).expect("tail read"), BSIZE);
    assert_eq!(&tail[..], &content[off as usize..off as usize + BSIZE]);
    drop(ig);

    log::begin_op();
    inode::iput(ip);
    log::end_op();
}

#[test]
fn write_bounds_are_enforced() {
    let _g = setup();

    put_file("/bounds", b"abc");
    let ip = dir::namei("/bounds").expect("bounds");
    let mut ig = inode::ilock(&ip);

    // A write starting past the end of the file is rejected.
    log::begin_op();
    assert!(ig.writei(b"zz", 100).is_err());
    log::end_op();

    // As is any offset out at the file-size ceiling.
    log::begin_op();
    assert!(ig
        .writei(b"zz", (inode::MAXFILE * BSIZE) as u32 - 1)
        .is_err());
    log::end_op();

    // Reads clamp instead of failing.
    let mut buf = [0u8; 16];
    assert_eq!(ig.readi(&mut buf, 1).expect("clamped"), 2);
    assert_eq!(&buf[..2], b"bc");
    drop(ig);

    log::begin_op();
    inode::iput(ip);
    log::end_op();
}

#[test]
fn unlinked_files_are_freed_on_the_last_reference() {
    let _g = setup();

    put_file("/tmpfile", b"temporary");
    let ip = dir::namei("/tmpfile").expect("tmpfile");
    let first_block = {
        let mut ig = inode::ilock(&ip);
        ig.bmap(0).expect("bmap")
    };

    // Drop the directory entry and the link count, then the reference:
    // iput truncates and frees the on-disk inode.
    let root = dir::namei("/").expect("root");
    log::begin_op();
    let inum = {
        let mut rg = inode::ilock(&root);
        let mut ig = inode::ilock(&ip);
        let inum = ig.inum;
        dir::dirunlink(&mut rg, &make_name(b"tmpfile"), inum).expect("unlink");
        ig.nlink -= 1;
        ig.iupdate();
        inum
    };
    inode::iput(ip);
    inode::iput(root);
    log::end_op();

    assert!(dir::namei("/tmpfile").is_none());

    // The content block went back to the bitmap: the next allocation in a
    // fresh file reuses the lowest free block.
    put_file("/reuse", b"r");
    let again = dir::namei("/reuse").expect("reuse");
    let reused_block = {
        let mut ig = inode::ilock(&again);
        ig.bmap(0).expect("bmap")
    };
    log::begin_op();
    inode::iput(again);
    log::end_op();
    assert_eq!(reused_block, first_block);

    // And the on-disk inode slot is free again.
    let sb = superblock();
    let image = the_disk().snapshot();
    let blk = inode::iblock(inum, &sb) + MBR_BASE;
    let off = blk as usize * BSIZE + (inum as usize % 8) * DINODE_SIZE;
    assert_eq!(i16::from_le_bytes([image[off], image[off + 1]]), 0);
}
