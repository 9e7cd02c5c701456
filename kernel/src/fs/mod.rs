//! File system
//!
//! Five layers, bottom up: the disk contract (`device`), the buffer cache
//! (`buffer`), the redo log (`log`), inodes (`inode`), and directories plus
//! path lookup (`dir`); `file` puts an open-file table on top. This module
//! owns the on-disk geometry: superblock, block bitmap, block allocator.
//!
//! On-disk layout, in `BSIZE` blocks (all numbers partition-relative; the
//! buffer cache adds `MBR_BASE` to account for the partition table):
//!
//! ```text
//! [ boot | superblock | inodes .. | bitmap .. | data .. | log .. ]
//!   0      1            2                                size-nlog
//! ```

pub mod buffer;
pub mod device;
pub mod dir;
pub mod file;
pub mod inode;
pub mod log;

use crate::error::{FsError, KernelResult};

/// Disk block size in bytes.
pub const BSIZE: usize = 512;

/// Device number of the root disk.
pub const ROOTDEV: u32 = 1;

/// Inode number of the root directory.
pub const ROOTINO: u32 = 1;

/// Bitmap bits per block.
pub const BPB: u32 = (BSIZE * 8) as u32;

/// Partition offset the buffer cache adds to every block number.
pub const MBR_BASE: u32 = 2048;

/// On-disk superblock: six little-endian u32 words in block 1. Read from
/// disk on every request and cached by the caller for the duration of one
/// operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    /// Total size of the file system in blocks.
    pub size: u32,
    /// Number of data blocks.
    pub nblocks: u32,
    /// Number of inodes.
    pub ninodes: u32,
    /// Number of log blocks (header included).
    pub nlog: u32,
    /// First log block.
    pub logstart: u32,
    /// First inode block.
    pub inodestart: u32,
}

impl SuperBlock {
    pub const DISK_SIZE: usize = 24;

    pub fn decode(bytes: &[u8]) -> Self {
        let word = |i: usize| {
            u32::from_le_bytes([bytes[4 * i], bytes[4 * i + 1], bytes[4 * i + 2], bytes[4 * i + 3]])
        };
        Self {
            size: word(0),
            nblocks: word(1),
            ninodes: word(2),
            nlog: word(3),
            logstart: word(4),
            inodestart: word(5),
        }
    }

    pub fn encode(&self, bytes: &mut [u8]) {
        for (i, v) in [
            self.size,
            self.nblocks,
            self.ninodes,
            self.nlog,
            self.logstart,
            self.inodestart,
        ]
        .iter()
        .enumerate()
        {
            bytes[4 * i..4 * i + 4].copy_from_slice(&v.to_le_bytes());
        }
    }

    /// First block of the free bitmap.
    pub fn bitmap_start(&self) -> u32 {
        self.inodestart + self.ninodes.div_ceil(inode::IPB as u32)
    }

    /// Bitmap block holding the bit for data block `b`.
    pub fn bitmap_block(&self, b: u32) -> u32 {
        b / BPB + self.bitmap_start()
    }
}

/// Read the superblock of `dev`.
pub fn readsb(dev: u32) -> SuperBlock {
    let b = buffer::bread(dev, 1);
    let sb = SuperBlock::decode(&b.data[..SuperBlock::DISK_SIZE]);
    buffer::brelse(b);
    sb
}

/// Zero a block through the log.
fn bzero(dev: u32, bno: u32) {
    let mut b = buffer::bread(dev, bno);
    b.data.fill(0);
    log::log_write(&mut b);
    buffer::brelse(b);
}

/// Allocate a zeroed data block: lowest zero bit in the bitmap. Must run
/// inside a transaction.
pub fn balloc(dev: u32) -> KernelResult<u32> {
    let sb = readsb(dev);
    let mut base = 0u32;
    while base < sb.size {
        let mut b = buffer::bread(dev, sb.bitmap_block(base));
        for bit in 0..BPB.min(sb.size - base) {
            let mask = 1u8 << (bit & 7);
            let byte = (bit >> 3) as usize;
            if b.data[byte] & mask == 0 {
                b.data[byte] |= mask;
                log::log_write(&mut b);
                buffer::brelse(b);
                bzero(dev, base + bit);
                return Ok(base + bit);
            }
        }
        buffer::brelse(b);
        base += BPB;
    }
    Err(FsError::NoFreeBlock.into())
}

/// Return a block to the bitmap. Freeing a free block is a fatal
/// consistency violation. Must run inside a transaction.
pub fn bfree(dev: u32, block: u32) {
    let sb = readsb(dev);
    let mut b = buffer::bread(dev, sb.bitmap_block(block));
    let bit = block % BPB;
    let mask = 1u8 << (bit & 7);
    let byte = (bit >> 3) as usize;
    if b.data[byte] & mask == 0 {
        panic!("bfree: freeing free block {} on dev {}", block, dev);
    }
    b.data[byte] &= !mask;
    log::log_write(&mut b);
    buffer::brelse(b);
}

/// Inode metadata handed to `fstat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub dev: u32,
    pub ino: u32,
    pub kind: inode::InodeType,
    pub nlink: i16,
    pub size: u32,
}

/// Bring up the logging layer and replay any committed transaction left by
/// a crash. Runs in the context of the first process: recovery does disk
/// I/O and may sleep.
pub fn init(dev: u32) {
    log::init(dev);
    let sb = readsb(dev);
    // `log` names the redo-log module here; the facade macros go through
    // the crate path.
    ::log::info!(
        "fs: {} blocks, {} inodes, log [{}..{})",
        sb.size,
        sb.ninodes,
        sb.size - sb.nlog,
        sb.size
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblock_codec_roundtrips() {
        let sb = SuperBlock {
            size: 1000,
            nblocks: 900,
            ninodes: 200,
            nlog: 31,
            logstart: 969,
            inodestart: 2,
        };
        let mut bytes = [0u8; SuperBlock::DISK_SIZE];
        sb.encode(&mut bytes);
        assert_eq!(SuperBlock::decode(&bytes), sb);
    }

    #[test]
    fn bitmap_geometry_follows_the_inode_area() {
        let sb = SuperBlock {
            size: 1000,
            nblocks: 900,
            ninodes: 200,
            nlog: 31,
            logstart: 969,
            inodestart: 2,
        };
        // 200 inodes at 8 per block -> 25 inode blocks.
        assert_eq!(sb.bitmap_start(), 27);
        assert_eq!(sb.bitmap_block(0), 27);
        assert_eq!(sb.bitmap_block(BPB), 28);
    }
}
