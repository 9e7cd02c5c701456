//! Architecture support
//!
//! Everything that touches system registers, MMIO or assembly is confined to
//! this module. The aarch64 implementation drives the real machine; the host
//! implementation provides just enough for the rest of the kernel to run
//! under `cargo test` on the build machine.

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub mod aarch64;
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub use aarch64::*;

#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
mod host;
#[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
pub use host::*;
