// Thin checked wrappers around the raw syscalls the VFS handlers lean on.
// Each returns the raw OS error code on failure, ready to hand back to FUSE.

use std::ffi::{CString, OsString};
use std::io;
use std::mem;
use std::os::unix::ffi::OsStringExt;

use crate::libc_extras::libc;

fn last_error() -> libc::c_int {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

pub fn lstat(path: OsString) -> Result<libc::stat64, libc::c_int> {
    let mut buf: libc::stat64 = unsafe { mem::zeroed() };

    let result = unsafe {
        let path_c = CString::from_vec_unchecked(path.into_vec());
        libc::lstat64(path_c.as_ptr(), &mut buf)
    };

    match result {
        -1 => Err(last_error()),
        _ => Ok(buf),
    }
}

pub fn fstat(fd: libc::c_int) -> Result<libc::stat64, libc::c_int> {
    let mut buf: libc::stat64 = unsafe { mem::zeroed() };

    match unsafe { libc::fstat64(fd, &mut buf) } {
        -1 => Err(last_error()),
        _ => Ok(buf),
    }
}

pub fn open(path: OsString, flags: libc::c_int) -> Result<libc::c_int, libc::c_int> {
    let fd = unsafe {
        let path_c = CString::from_vec_unchecked(path.into_vec());
        libc::open(path_c.as_ptr(), flags)
    };

    match fd {
        -1 => Err(last_error()),
        _ => Ok(fd),
    }
}
