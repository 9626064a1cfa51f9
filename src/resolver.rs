//! Safe path resolution inside a layer subtree.
//!
//! Backends never trust a relative path textually: resolution happens
//! through `openat2` with `RESOLVE_IN_ROOT`, so symlinks inside the
//! layer can never escape its root. Kernels without `openat2` fall back
//! to a component-wise `openat` walk that refuses to follow symlinks at
//! all and rejects `..`, which is stricter than the clamping `openat2`
//! performs but keeps the same no-escape guarantee.

use std::ffi::{CString, OsStr};
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};
use crate::source::Layer;

/// Outcome of resolving a relative path within a layer.
///
/// The resolver prefers handing back an open descriptor; operations that
/// only exist in symlink-aware by-path form receive the composed
/// absolute path instead.
#[derive(Debug)]
pub enum Resolved {
    Fd(OwnedFd),
    Path(PathBuf),
}

/// Resolve `path` inside the layer to a descriptor or an absolute path.
///
/// Objects that cannot be opened for reading by nature (symlinks,
/// sockets, fifos without writers) fall back to textual composition
/// against the layer's canonical root path. Any other open failure is
/// surfaced unchanged.
pub fn open_fd_or_path(layer: &Layer, path: &Path, flags: i32) -> Result<Resolved> {
    let open_flags = flags | libc::O_NONBLOCK | libc::O_NOFOLLOW | libc::O_CLOEXEC;
    match safe_openat(layer.dir_fd()?, path, open_flags, 0) {
        Ok(fd) => Ok(Resolved::Fd(fd)),
        Err(err) => match err.raw_os_error() {
            Some(libc::ELOOP) | Some(libc::EISDIR) | Some(libc::ENXIO) => {
                Ok(Resolved::Path(layer.path()?.join(path)))
            }
            _ => Err(Error::Io(err)),
        },
    }
}

static OPENAT2_UNSUPPORTED: AtomicBool = AtomicBool::new(false);

/// Open `path` relative to `dirfd` without letting resolution escape the
/// subtree rooted at `dirfd`. Interrupted calls are retried.
pub fn safe_openat(dirfd: BorrowedFd<'_>, path: &Path, flags: i32, mode: u32) -> io::Result<OwnedFd> {
    if !OPENAT2_UNSUPPORTED.load(Ordering::Relaxed) {
        let c_path = path_cstr(path)?;
        match openat2_in_root(dirfd, &c_path, flags, mode) {
            Err(err) if err.raw_os_error() == Some(libc::ENOSYS) => {
                OPENAT2_UNSUPPORTED.store(true, Ordering::Relaxed);
            }
            other => return other,
        }
    }
    openat_walk(dirfd, path, flags, mode)
}

fn openat2_in_root(dirfd: BorrowedFd<'_>, path: &std::ffi::CStr, flags: i32, mode: u32) -> io::Result<OwnedFd> {
    // The kernel rejects a nonzero mode unless the open creates something.
    let creating = flags & libc::O_CREAT != 0 || flags & libc::O_TMPFILE == libc::O_TMPFILE;
    // `libc::open_how` is non-exhaustive, so it cannot be built with a
    // struct literal; zero-initialize and fill in the fields instead.
    let mut how: libc::open_how = unsafe { std::mem::zeroed() };
    how.flags = u64::from(flags as u32);
    how.mode = if creating { u64::from(mode) } else { 0 };
    how.resolve = libc::RESOLVE_IN_ROOT | libc::RESOLVE_NO_MAGICLINKS;
    loop {
        // Safe because the kernel only reads path and how, and we check
        // the return value.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_openat2,
                dirfd.as_raw_fd(),
                path.as_ptr(),
                &how as *const libc::open_how,
                std::mem::size_of::<libc::open_how>(),
            )
        };
        if ret >= 0 {
            // Safe because the kernel just handed us this descriptor.
            return Ok(unsafe { OwnedFd::from_raw_fd(ret as RawFd) });
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Legacy resolution: walk intermediate components one `openat` at a
/// time with `O_NOFOLLOW` everywhere, so no symlink is ever followed.
fn openat_walk(dirfd: BorrowedFd<'_>, path: &Path, flags: i32, mode: u32) -> io::Result<OwnedFd> {
    let mut parts: Vec<&OsStr> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => parts.push(name),
            Component::CurDir => {}
            // Absolute paths and ".." never resolve inside a layer.
            _ => return Err(io::Error::from_raw_os_error(libc::EXDEV)),
        }
    }
    let last = match parts.pop() {
        Some(last) => last,
        None => OsStr::new("."),
    };

    let mut cur: Option<OwnedFd> = None;
    for name in parts {
        let parent = cur.as_ref().map_or(dirfd, |fd| fd.as_fd());
        let next = openat_retry(
            parent,
            name,
            libc::O_PATH | libc::O_NOFOLLOW | libc::O_DIRECTORY | libc::O_CLOEXEC,
            0,
        )?;
        cur = Some(next);
    }
    let parent = cur.as_ref().map_or(dirfd, |fd| fd.as_fd());
    openat_retry(parent, last, flags | libc::O_NOFOLLOW, mode)
}

fn openat_retry(dirfd: BorrowedFd<'_>, name: &OsStr, flags: i32, mode: u32) -> io::Result<OwnedFd> {
    let c_name = path_cstr(Path::new(name))?;
    loop {
        // Safe because the name pointer stays valid for the call and we
        // check the return value.
        let ret = unsafe {
            libc::openat(dirfd.as_raw_fd(), c_name.as_ptr(), flags, mode as libc::c_uint)
        };
        if ret >= 0 {
            // Safe because the kernel just handed us this descriptor.
            return Ok(unsafe { OwnedFd::from_raw_fd(ret) });
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// NUL-terminate a path for the syscall layer; the empty path means the
/// directory itself.
pub(crate) fn path_cstr(path: &Path) -> io::Result<CString> {
    let bytes = path.as_os_str().as_bytes();
    let bytes = if bytes.is_empty() { b".".as_slice() } else { bytes };
    CString::new(bytes).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::direct::DirectSource;
    use crate::source::{Layer, LayerLocator};
    use std::fs::{self, File};
    use std::os::unix::fs::symlink;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn load_layer(path: &Path) -> Layer {
        Layer::load(
            Arc::new(DirectSource::new()),
            &LayerLocator::new(path.to_path_buf()),
        )
        .unwrap()
    }

    #[test]
    fn regular_files_resolve_to_descriptors() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("f"), b"data").unwrap();
        let layer = load_layer(dir.path());

        match open_fd_or_path(&layer, Path::new("f"), libc::O_RDONLY).unwrap() {
            Resolved::Fd(_) => {}
            Resolved::Path(p) => panic!("expected descriptor, got path {p:?}"),
        }
    }

    #[test]
    fn symlinks_fall_back_to_paths() {
        let dir = tempdir().unwrap();
        symlink("target", dir.path().join("link")).unwrap();
        let layer = load_layer(dir.path());

        match open_fd_or_path(&layer, Path::new("link"), libc::O_RDONLY).unwrap() {
            Resolved::Path(p) => assert_eq!(p, layer.path().unwrap().join("link")),
            Resolved::Fd(_) => panic!("expected path fallback for a symlink"),
        }
    }

    #[test]
    fn resolution_cannot_escape_the_root() {
        let dir = tempdir().unwrap();
        symlink("/", dir.path().join("esc")).unwrap();
        let dirfd = OwnedFd::from(File::open(dir.path()).unwrap());

        // Either the symlink resolution is clamped to the (empty) root or
        // the legacy walk refuses the symlink outright.
        let result = safe_openat(
            dirfd.as_fd(),
            Path::new("esc/etc/passwd"),
            libc::O_RDONLY | libc::O_CLOEXEC,
            0,
        );
        assert!(result.is_err());
    }

    #[test]
    fn empty_path_opens_the_directory_itself() {
        let dir = tempdir().unwrap();
        let dirfd = OwnedFd::from(File::open(dir.path()).unwrap());
        let fd = safe_openat(
            dirfd.as_fd(),
            Path::new(""),
            libc::O_DIRECTORY | libc::O_RDONLY | libc::O_CLOEXEC,
            0,
        )
        .unwrap();
        drop(fd);
    }
}
