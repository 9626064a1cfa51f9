//! Thin wrappers over the extended-attribute syscalls.
//!
//! Every by-path operation in this crate comes in two flavors: a
//! descriptor-relative form used when the resolver produced an open
//! descriptor, and an `l`-prefixed non-following form used against a
//! composed absolute path.

use std::ffi::CStr;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd};

/// Read the named attribute of an open descriptor into `buf`.
///
/// With an empty `buf` the kernel reports the value size instead.
pub fn fgetxattr(fd: BorrowedFd<'_>, name: &CStr, buf: &mut [u8]) -> io::Result<usize> {
    // Safe because the kernel writes at most buf.len() bytes into buf and
    // we check the return value.
    let ret = unsafe {
        libc::fgetxattr(fd.as_raw_fd(), name.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

/// Read the named attribute of a path without following a final symlink.
pub fn lgetxattr(path: &CStr, name: &CStr, buf: &mut [u8]) -> io::Result<usize> {
    // Safe because the kernel writes at most buf.len() bytes into buf and
    // we check the return value.
    let ret = unsafe {
        libc::lgetxattr(path.as_ptr(), name.as_ptr(), buf.as_mut_ptr().cast(), buf.len())
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

/// List the attribute names of an open descriptor into `buf`.
pub fn flistxattr(fd: BorrowedFd<'_>, buf: &mut [u8]) -> io::Result<usize> {
    // Safe because the kernel writes at most buf.len() bytes into buf and
    // we check the return value.
    let ret = unsafe { libc::flistxattr(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

/// List the attribute names of a path without following a final symlink.
pub fn llistxattr(path: &CStr, buf: &mut [u8]) -> io::Result<usize> {
    // Safe because the kernel writes at most buf.len() bytes into buf and
    // we check the return value.
    let ret = unsafe { libc::llistxattr(path.as_ptr(), buf.as_mut_ptr().cast(), buf.len()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

/// Set the named attribute on an open descriptor.
pub fn fsetxattr(fd: BorrowedFd<'_>, name: &CStr, value: &[u8]) -> io::Result<()> {
    // Safe because the kernel only reads value.len() bytes from value and
    // we check the return value.
    let ret = unsafe {
        libc::fsetxattr(
            fd.as_raw_fd(),
            name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            0,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Set the named attribute on a path without following a final symlink.
pub fn lsetxattr(path: &CStr, name: &CStr, value: &[u8]) -> io::Result<()> {
    // Safe because the kernel only reads value.len() bytes from value and
    // we check the return value.
    let ret = unsafe {
        libc::lsetxattr(
            path.as_ptr(),
            name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            0,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
