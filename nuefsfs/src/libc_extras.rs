// Shims over the libc crate that smooth out platform differences.
// Linux exposes an explicit 64-bit stat family; macOS only has the plain names.

use std::io;

pub mod libc {
    pub use ::libc::*;

    #[cfg(target_os = "macos")]
    pub use ::libc::{
        fstat as fstat64, ftruncate as ftruncate64, lstat as lstat64, stat as stat64,
        truncate as truncate64,
    };
}

/// Converts an *io::Error* into the raw error code FUSE expects.
/// Errors that carry no OS code collapse to *EIO*.
pub fn io_to_libc_error(err: io::Error) -> self::libc::c_int {
    err.raw_os_error().unwrap_or(self::libc::EIO)
}
