//! Redo log
//!
//! Filesystem operations group into transactions; all blocks a transaction
//! dirties are first copied into the on-disk log, the header naming them is
//! written (the commit point), and only then do the blocks reach their home
//! locations. Recovery after a crash replays whatever the header names;
//! replaying is idempotent.
//!
//! On-disk: one header block at `start`, then `LOGSIZE` data slots. The
//! header block numbers are partition-relative, like everything above the
//! buffer cache.

use crate::process;
use crate::sync::SpinLock;

use super::{buffer, readsb, BSIZE, MBR_BASE};

/// Max data blocks in the on-disk log.
pub const LOGSIZE: usize = 30;

/// Max blocks a single FS operation may dirty; `begin_op` reserves this
/// many per outstanding operation.
pub const MAXOPBLOCKS: usize = 10;

const _: () = assert!(4 + 4 * LOGSIZE <= BSIZE, "log header must fit one block");

/// The commit record: count and home block numbers of the logged slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    pub n: u32,
    pub block: [u32; LOGSIZE],
}

impl LogHeader {
    pub const fn empty() -> Self {
        Self {
            n: 0,
            block: [0; LOGSIZE],
        }
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let word = |i: usize| {
            u32::from_le_bytes([bytes[4 * i], bytes[4 * i + 1], bytes[4 * i + 2], bytes[4 * i + 3]])
        };
        let mut lh = Self::empty();
        lh.n = word(0);
        for i in 0..LOGSIZE {
            lh.block[i] = word(1 + i);
        }
        lh
    }

    pub fn encode(&self, bytes: &mut [u8]) {
        bytes[0..4].copy_from_slice(&self.n.to_le_bytes());
        for i in 0..LOGSIZE {
            bytes[4 + 4 * i..8 + 4 * i].copy_from_slice(&self.block[i].to_le_bytes());
        }
    }
}

struct LogState {
    /// First log block (the header).
    start: u32,
    /// Log length in blocks, header included.
    size: u32,
    /// FS operations currently inside begin_op/end_op.
    outstanding: u32,
    /// A commit is running; new operations wait.
    committing: bool,
    dev: u32,
    lh: LogHeader,
}

static LOG: SpinLock<LogState> = SpinLock::new(
    "log",
    LogState {
        start: 0,
        size: 0,
        outstanding: 0,
        committing: false,
        dev: 0,
        lh: LogHeader::empty(),
    },
);

fn chan() -> usize {
    &LOG as *const _ as usize
}

/// Size the log from the superblock and replay anything a crash left
/// committed but not installed.
pub fn init(dev: u32) {
    let sb = readsb(dev);
    {
        let mut log = LOG.lock();
        log.start = sb.size - sb.nlog;
        log.size = sb.nlog;
        log.dev = dev;
        log.outstanding = 0;
        log.committing = false;
    }
    recover();
}

fn read_head(dev: u32, start: u32) -> LogHeader {
    let b = buffer::bread(dev, start);
    let lh = LogHeader::decode(&b.data);
    buffer::brelse(b);
    lh
}

/// Writing the header block is the atomic step: with a non-zero count it
/// commits the transaction, with zero it releases the log.
fn write_head(dev: u32, start: u32, lh: &LogHeader) {
    let mut b = buffer::bread(dev, start);
    lh.encode(&mut b.data);
    buffer::bwrite(&mut b);
    buffer::brelse(b);
}

/// Copy each logged block from the cache into its log slot.
fn write_log(dev: u32, start: u32, lh: &LogHeader) {
    for tail in 0..lh.n {
        let mut to = buffer::bread(dev, start + tail + 1);
        let from = buffer::bread(dev, lh.block[tail as usize]);
        to.data.copy_from_slice(&from.data);
        buffer::bwrite(&mut to);
        buffer::brelse(from);
        buffer::brelse(to);
    }
}

/// Copy committed blocks from their log slots to their home locations.
fn install_trans(dev: u32, start: u32, lh: &LogHeader, recovering: bool) {
    for tail in 0..lh.n {
        let lbuf = buffer::bread(dev, start + tail + 1);
        let mut dbuf = buffer::bread(dev, lh.block[tail as usize]);
        dbuf.data.copy_from_slice(&lbuf.data);
        buffer::bwrite(&mut dbuf);
        if !recovering {
            // Drop the pin log_write took when the block entered the log.
            buffer::bunpin(&dbuf);
        }
        buffer::brelse(lbuf);
        buffer::brelse(dbuf);
    }
}

/// Boot-time (and test-time) recovery: install whatever the on-disk header
/// names, then release the log. Running it twice is a no-op.
pub fn recover() {
    let (dev, start) = {
        let log = LOG.lock();
        (log.dev, log.start)
    };
    let lh = read_head(dev, start);
    install_trans(dev, start, &lh, true);
    write_head(dev, start, &LogHeader::empty());
    LOG.lock().lh = LogHeader::empty();
}

/// Open a transaction: wait out a running commit, and wait until the log
/// can absorb this operation's worst case.
pub fn begin_op() {
    let mut log = LOG.lock();
    loop {
        if log.committing {
            log = process::sleep(chan(), log);
        } else if log.lh.n as usize + (log.outstanding as usize + 1) * MAXOPBLOCKS > LOGSIZE {
            log = process::sleep(chan(), log);
        } else {
            log.outstanding += 1;
            break;
        }
    }
}

/// Close a transaction; the last closer commits on behalf of everyone.
pub fn end_op() {
    let mut do_commit = false;
    let mut lh = LogHeader::empty();
    let (mut dev, mut start) = (0, 0);
    {
        let mut log = LOG.lock();
        if log.committing {
            panic!("end_op: already committing");
        }
        log.outstanding -= 1;
        if log.outstanding == 0 {
            do_commit = true;
            log.committing = true;
            lh = log.lh;
            dev = log.dev;
            start = log.start;
        } else {
            // Freed reservation space may unblock a begin_op.
            process::wakeup(chan());
        }
    }

    if do_commit {
        if lh.n > 0 {
            write_log(dev, start, &lh);
            write_head(dev, start, &lh); // commit point
            install_trans(dev, start, &lh, false);
            write_head(dev, start, &LogHeader::empty()); // release point
        }
        let mut log = LOG.lock();
        log.lh = LogHeader::empty();
        log.committing = false;
        drop(log);
        process::wakeup(chan());
    }
}

/// Record a modified buffer in the current transaction and keep it in the
/// cache until the commit installs it. Replaces `bwrite`:
///
/// ```ignore
/// let mut b = buffer::bread(dev, blockno);
/// // modify b.data
/// log::log_write(&mut b);
/// buffer::brelse(b);
/// ```
pub fn log_write(b: &mut buffer::BufGuard<'_>) {
    let fsblock = b.blockno - MBR_BASE;
    let is_new = {
        let mut log = LOG.lock();
        if log.lh.n as usize >= LOGSIZE || log.lh.n >= log.size - 1 {
            panic!("log_write: transaction too big");
        }
        if log.outstanding < 1 {
            panic!("log_write: outside a transaction");
        }
        let n = log.lh.n as usize;
        let mut slot = n;
        for i in 0..n {
            // Absorption: a block already in this transaction stays put.
            if log.lh.block[i] == fsblock {
                slot = i;
                break;
            }
        }
        log.lh.block[slot] = fsblock;
        if slot == n {
            log.lh.n += 1;
            true
        } else {
            false
        }
    };
    if is_new {
        // Pin outside the log lock: the cache lock orders before it.
        buffer::bpin(b);
    }
    b.flags.insert(buffer::BufFlags::DIRTY);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_codec_roundtrips() {
        let mut lh = LogHeader::empty();
        lh.n = 3;
        lh.block[0] = 17;
        lh.block[1] = 80;
        lh.block[2] = 17;
        let mut bytes = [0u8; BSIZE];
        lh.encode(&mut bytes);
        assert_eq!(LogHeader::decode(&bytes), lh);
    }

    #[test]
    fn reservation_formula_matches_the_invariant() {
        // A full complement of MAXOPBLOCKS-sized operations never exceeds
        // the log.
        let outstanding = LOGSIZE / MAXOPBLOCKS;
        assert!(outstanding * MAXOPBLOCKS <= LOGSIZE);
        assert!((outstanding + 1) * MAXOPBLOCKS > LOGSIZE);
    }
}
