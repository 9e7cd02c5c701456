//! Disk driver contract
//!
//! The SD-card driver is an external collaborator. The core talks to it
//! through one synchronous call: submit a buffer, and when the call
//! returns the data has been read (VALID set) or written (DIRTY cleared).
//! The driver parks the calling kernel thread on a channel and its
//! interrupt handler wakes it; `sd_intr` is that handler's entry from the
//! trap path.

use alloc::vec;
use alloc::vec::Vec;

use spin::Once;

use super::buffer::BufData;
use super::BSIZE;

/// Contract implemented by the block device driver.
pub trait DiskDriver: Sync {
    /// Complete one buffer synchronously: write it out when DIRTY is set,
    /// otherwise read it in. Implementations set VALID and clear DIRTY
    /// before returning.
    fn submit(&self, buf: &mut BufData);

    /// Controller interrupt; wakes the thread parked in `submit`.
    fn intr(&self) {}
}

static DISK: Once<&'static dyn DiskDriver> = Once::new();

/// Install the disk driver. Later registrations are ignored.
pub fn register(driver: &'static dyn DiskDriver) {
    DISK.call_once(|| driver);
}

pub(crate) fn disk() -> &'static dyn DiskDriver {
    *DISK.get().expect("no disk driver registered")
}

/// SD interrupt entry, called from the interrupt dispatcher.
pub fn sd_intr() {
    if let Some(d) = DISK.get() {
        d.intr();
    }
}

/// Memory-backed block device. The boot ramdisk uses it on hardware
/// without storage, and the filesystem tests run entirely on it.
pub struct RamDisk {
    blocks: spin::Mutex<Vec<u8>>,
}

impl RamDisk {
    pub fn new(nblocks: usize) -> Self {
        Self {
            blocks: spin::Mutex::new(vec![0u8; nblocks * BSIZE]),
        }
    }

    pub fn nblocks(&self) -> usize {
        self.blocks.lock().len() / BSIZE
    }

    /// Byte image of the disk; lets tests model a power cut by rebuilding
    /// a device from a snapshot.
    pub fn snapshot(&self) -> Vec<u8> {
        self.blocks.lock().clone()
    }

    pub fn restore(&self, image: &[u8]) {
        let mut blocks = self.blocks.lock();
        assert_eq!(blocks.len(), image.len(), "ramdisk: image size mismatch");
        blocks.copy_from_slice(image);
    }
}

impl DiskDriver for RamDisk {
    fn submit(&self, buf: &mut BufData) {
        use super::buffer::BufFlags;

        let mut blocks = self.blocks.lock();
        let start = buf.blockno as usize * BSIZE;
        let end = start + BSIZE;
        if end > blocks.len() {
            panic!("ramdisk: block {} out of range", buf.blockno);
        }
        if buf.flags.contains(BufFlags::DIRTY) {
            blocks[start..end].copy_from_slice(&buf.data);
        } else {
            buf.data.copy_from_slice(&blocks[start..end]);
        }
        buf.flags.insert(BufFlags::VALID);
        buf.flags.remove(BufFlags::DIRTY);
    }
}
