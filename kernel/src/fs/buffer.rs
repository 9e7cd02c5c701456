//! Buffer cache
//!
//! A fixed pool of block buffers on one MRU-ordered list. The list and the
//! per-buffer identity/refcount live under a single spinlock; the data of
//! each buffer sits behind its own sleep-lock so a holder may keep it
//! across disk I/O. Neighbours are slot indices, not pointers, with a
//! sentinel slot at index `NBUF` closing the ring.

use bitflags::bitflags;

use crate::process;
use crate::sync::{SleepGuard, SleepLock, SpinLock};

use super::{device, BSIZE, MBR_BASE};

/// Cache slots; three transactions' worth of blocks.
pub const NBUF: usize = 30;

const SENTINEL: usize = NBUF;

bitflags! {
    /// Buffer state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufFlags: u32 {
        /// Data mirrors the disk block.
        const VALID = 1 << 1;
        /// Data is newer than the disk block; must not be evicted.
        const DIRTY = 1 << 2;
    }
}

/// The sleep-lock-protected face of a buffer: identity copy, state flags,
/// and the block data. This is also what the disk driver sees.
pub struct BufData {
    pub dev: u32,
    pub blockno: u32,
    pub flags: BufFlags,
    pub data: [u8; BSIZE],
}

impl BufData {
    const fn new() -> Self {
        Self {
            dev: u32::MAX,
            blockno: 0,
            flags: BufFlags::empty(),
            data: [0; BSIZE],
        }
    }
}

/// Per-slot bookkeeping under the cache control lock.
#[derive(Clone, Copy)]
struct BufMeta {
    dev: u32,
    blockno: u32,
    refcnt: u32,
    prev: usize,
    next: usize,
}

struct Ctrl {
    meta: [BufMeta; NBUF + 1],
}

impl Ctrl {
    const fn new() -> Self {
        let mut meta = [BufMeta {
            dev: u32::MAX,
            blockno: 0,
            refcnt: 0,
            prev: 0,
            next: 0,
        }; NBUF + 1];
        // Ring order at boot: sentinel, 0, 1, .., NBUF-1.
        let mut i = 0;
        while i < NBUF {
            meta[i].prev = if i == 0 { SENTINEL } else { i - 1 };
            meta[i].next = if i == NBUF - 1 { SENTINEL } else { i + 1 };
            i += 1;
        }
        meta[SENTINEL].next = 0;
        meta[SENTINEL].prev = NBUF - 1;
        Self { meta }
    }

    fn unlink(&mut self, i: usize) {
        let (prev, next) = (self.meta[i].prev, self.meta[i].next);
        self.meta[prev].next = next;
        self.meta[next].prev = prev;
    }

    fn push_front(&mut self, i: usize) {
        let first = self.meta[SENTINEL].next;
        self.meta[i].prev = SENTINEL;
        self.meta[i].next = first;
        self.meta[first].prev = i;
        self.meta[SENTINEL].next = i;
    }
}

pub struct BufCache {
    ctrl: SpinLock<Ctrl>,
    slots: [SleepLock<BufData>; NBUF],
}

pub static BCACHE: BufCache = BufCache {
    ctrl: SpinLock::new("bcache", Ctrl::new()),
    slots: [const { SleepLock::new("buffer", BufData::new()) }; NBUF],
};

/// A locked, referenced buffer. Hand it back with `brelse`.
pub struct BufGuard<'a> {
    idx: usize,
    inner: SleepGuard<'a, BufData>,
}

impl core::ops::Deref for BufGuard<'_> {
    type Target = BufData;

    fn deref(&self) -> &BufData {
        &self.inner
    }
}

impl core::ops::DerefMut for BufGuard<'_> {
    fn deref_mut(&mut self) -> &mut BufData {
        &mut self.inner
    }
}

impl BufCache {
    /// Find or repurpose a buffer for `(dev, blockno)` and lock it.
    ///
    /// State loop per scan round: a live mapping that is free is taken; a
    /// live mapping that is locked puts us to sleep on the buffer and the
    /// scan restarts; with no live mapping the least recently used clean,
    /// unreferenced slot is repurposed. All slots busy is a panic.
    fn bget(&'static self, dev: u32, blockno: u32) -> BufGuard<'static> {
        let mut ctrl = self.ctrl.lock();
        loop {
            // Scan for a live mapping, most recently used first.
            let mut i = ctrl.meta[SENTINEL].next;
            let mut live = None;
            while i != SENTINEL {
                if ctrl.meta[i].dev == dev && ctrl.meta[i].blockno == blockno {
                    live = Some(i);
                    break;
                }
                i = ctrl.meta[i].next;
            }
            if let Some(i) = live {
                match self.slots[i].try_acquire() {
                    Some(inner) => {
                        ctrl.meta[i].refcnt += 1;
                        drop(ctrl);
                        return BufGuard { idx: i, inner };
                    }
                    None => {
                        // Locked by someone else: wait on the buffer and
                        // rescan, the mapping may have moved meanwhile.
                        ctrl = process::sleep(self.slots[i].chan(), ctrl);
                        continue;
                    }
                }
            }

            // No live mapping: recycle from the LRU end.
            let mut i = ctrl.meta[SENTINEL].prev;
            while i != SENTINEL {
                if ctrl.meta[i].refcnt == 0 {
                    if let Some(mut inner) = self.slots[i].try_acquire() {
                        if !inner.flags.contains(BufFlags::DIRTY) {
                            ctrl.meta[i].dev = dev;
                            ctrl.meta[i].blockno = blockno;
                            ctrl.meta[i].refcnt = 1;
                            inner.dev = dev;
                            inner.blockno = blockno;
                            inner.flags = BufFlags::empty();
                            drop(ctrl);
                            return BufGuard { idx: i, inner };
                        }
                    }
                }
                i = ctrl.meta[i].prev;
            }
            panic!("bget: no buffers");
        }
    }

    /// Locked buffer with the contents of `blockno` (partition-relative;
    /// the `MBR_BASE` mirror offset is applied here).
    pub fn bread(&'static self, dev: u32, blockno: u32) -> BufGuard<'static> {
        let mut b = self.bget(dev, blockno + MBR_BASE);
        if !b.flags.contains(BufFlags::VALID) {
            device::disk().submit(&mut b);
        }
        b
    }

    /// Write the buffer through to the device.
    pub fn bwrite(&'static self, b: &mut BufGuard<'_>) {
        b.flags.insert(BufFlags::DIRTY);
        device::disk().submit(&mut b.inner);
    }

    /// Release a locked buffer: drop the sleep-lock (waking sleepers in
    /// `bget`) and, at refcount zero, move the slot to the MRU head.
    pub fn brelse(&'static self, b: BufGuard<'static>) {
        let BufGuard { idx, inner } = b;
        drop(inner);

        let mut ctrl = self.ctrl.lock();
        ctrl.meta[idx].refcnt -= 1;
        if ctrl.meta[idx].refcnt == 0 {
            ctrl.unlink(idx);
            ctrl.push_front(idx);
        }
    }

    /// Retain the buffer across transactions without holding its lock.
    pub fn bpin(&'static self, b: &BufGuard<'_>) {
        self.ctrl.lock().meta[b.idx].refcnt += 1;
    }

    /// Drop a pin taken with `bpin`.
    pub fn bunpin(&'static self, b: &BufGuard<'_>) {
        let mut ctrl = self.ctrl.lock();
        if ctrl.meta[b.idx].refcnt == 0 {
            panic!("bunpin: refcount underflow");
        }
        ctrl.meta[b.idx].refcnt -= 1;
    }
}

pub fn bread(dev: u32, blockno: u32) -> BufGuard<'static> {
    BCACHE.bread(dev, blockno)
}

pub fn bwrite(b: &mut BufGuard<'_>) {
    BCACHE.bwrite(b)
}

pub fn brelse(b: BufGuard<'static>) {
    BCACHE.brelse(b)
}

pub fn bpin(b: &BufGuard<'_>) {
    BCACHE.bpin(b)
}

pub fn bunpin(b: &BufGuard<'_>) {
    BCACHE.bunpin(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::device::RamDisk;
    use alloc::boxed::Box;
    use spin::{Mutex, Once};

    static SETUP: Once<()> = Once::new();
    static CACHE_TEST_LOCK: Mutex<()> = Mutex::new(());

    const TEST_DEV: u32 = 9;

    fn setup() -> spin::MutexGuard<'static, ()> {
        SETUP.call_once(|| {
            let disk = Box::leak(Box::new(RamDisk::new(MBR_BASE as usize + 128)));
            device::register(disk);
        });
        CACHE_TEST_LOCK.lock()
    }

    #[test]
    fn written_blocks_read_back() {
        let _g = setup();
        let mut b = bread(TEST_DEV, 3);
        b.data[0] = 0xAA;
        b.data[BSIZE - 1] = 0x55;
        bwrite(&mut b);
        brelse(b);

        let b = bread(TEST_DEV, 3);
        assert_eq!(b.data[0], 0xAA);
        assert_eq!(b.data[BSIZE - 1], 0x55);
        assert!(b.flags.contains(BufFlags::VALID));
        assert!(!b.flags.contains(BufFlags::DIRTY));
        brelse(b);
    }

    #[test]
    fn eviction_recycles_clean_slots_and_keeps_data_on_disk() {
        let _g = setup();
        let mut b = bread(TEST_DEV, 10);
        b.data[7] = 0x77;
        bwrite(&mut b);
        brelse(b);

        // Touch enough other blocks to push block 10 out of the cache.
        for blockno in 20..20 + NBUF as u32 + 4 {
            let b = bread(TEST_DEV, blockno);
            brelse(b);
        }

        let b = bread(TEST_DEV, 10);
        assert_eq!(b.data[7], 0x77);
        brelse(b);
    }

    #[test]
    fn pinned_buffers_keep_their_reference() {
        let _g = setup();
        let b = bread(TEST_DEV, 40);
        bpin(&b);
        let idx = b.idx;
        brelse(b);
        // The slot still has the pin reference; a rescan maps the same slot.
        let b = bread(TEST_DEV, 40);
        assert_eq!(b.idx, idx);
        bunpin(&b);
        brelse(b);
    }

    #[test]
    fn distinct_blocks_get_distinct_buffers() {
        let _g = setup();
        let a = bread(TEST_DEV, 50);
        let b = bread(TEST_DEV, 51);
        assert_ne!(a.idx, b.idx);
        assert_eq!(a.blockno, 50 + MBR_BASE);
        assert_eq!(b.blockno, 51 + MBR_BASE);
        brelse(a);
        brelse(b);
    }
}
