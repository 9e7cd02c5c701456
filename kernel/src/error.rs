//! Kernel-wide error types
//!
//! Recoverable failures travel as `Result` values and are turned into `-1`
//! at the syscall boundary; invariant violations panic (and halt the CPU).

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// No physical frames left.
    OutOfMemory,
    /// A fixed table (processes, files) has no free slot.
    ResourceExhausted { resource: &'static str },
    /// A user-supplied address did not resolve to a writable user page.
    BadAddress { addr: usize },
    /// An argument was out of the accepted range.
    InvalidArgument { name: &'static str },
    /// Filesystem-level errors.
    Fs(FsError),
}

/// Filesystem-specific errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Path or directory entry not found.
    NotFound,
    /// Directory entry already present.
    AlreadyExists,
    /// Path component was not a directory.
    NotADirectory,
    /// Read or write beyond the maximum file size.
    FileTooLarge,
    /// Offset/length arithmetic overflowed or fell outside the file.
    BadOffset,
    /// Every on-disk inode is allocated.
    NoFreeInode,
    /// The data-block bitmap has no zero bit.
    NoFreeBlock,
    /// No device handler registered for this major number.
    NoDevice,
    /// File not opened for the attempted access.
    BadFileDescriptor,
    /// Short transfer from the device layer.
    IoError,
    /// The executable image failed validation.
    BadElf,
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of physical memory"),
            Self::ResourceExhausted { resource } => {
                write!(f, "resource exhausted: {}", resource)
            }
            Self::BadAddress { addr } => write!(f, "bad user address 0x{:x}", addr),
            Self::InvalidArgument { name } => write!(f, "invalid argument '{}'", name),
            Self::Fs(e) => write!(f, "fs: {:?}", e),
        }
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::Fs(err)
    }
}

impl KernelError {
    /// Value surfaced to user space for this failure.
    pub fn to_errno(self) -> i64 {
        -1
    }
}
