//! Direct backend: serves a layer straight from an on-disk directory tree.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd};
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ownership::{self, OverrideRecord, OverrideTier};
use crate::resolver::{self, path_cstr, Resolved};
use crate::stat::{self, FileMetadata};
use crate::xattr;

use super::{DataSource, DirEntry, DirectoryStream, FileKind, Layer, LayerLocator};

/// Backend serving operations from one real directory per layer.
#[derive(Debug, Default)]
pub struct DirectSource;

impl DirectSource {
    pub fn new() -> Self {
        DirectSource
    }
}

/// Read the object's override attribute for the layer's tier, if any,
/// and fold it into `meta`.
///
/// An object without the attribute keeps its raw metadata; an attribute
/// that fails to parse is on-disk corruption and fails the whole stat.
fn apply_override(
    layer: &Layer,
    fd: Option<BorrowedFd<'_>>,
    path: &Path,
    meta: &mut FileMetadata,
) -> Result<()> {
    let Some(tier) = layer.override_tier() else {
        return Ok(());
    };
    let name = tier.xattr_name();

    let mut buf = [0u8; ownership::OVERRIDE_VALUE_MAX];
    let read = match fd {
        Some(fd) => xattr::fgetxattr(fd, name, &mut buf),
        None => match resolver::open_fd_or_path(layer, path, libc::O_RDONLY)? {
            Resolved::Fd(fd) => xattr::fgetxattr(fd.as_fd(), name, &mut buf),
            Resolved::Path(full) => xattr::lgetxattr(&path_cstr(&full)?, name, &mut buf),
        },
    };
    let len = match read {
        Ok(len) => len,
        Err(err)
            if matches!(
                err.raw_os_error(),
                Some(libc::ENODATA) | Some(libc::EOPNOTSUPP)
            ) =>
        {
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    let record = OverrideRecord::parse(&buf[..len]).map_err(|err| {
        warn!(path = %path.display(), "malformed ownership override record");
        err
    })?;
    record.apply(meta);
    Ok(())
}

fn retry_eintr<F: FnMut() -> libc::c_long>(mut call: F) -> io::Result<libc::c_long> {
    loop {
        let ret = call();
        if ret >= 0 {
            return Ok(ret);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

impl DataSource for DirectSource {
    fn layer_count(&self, _locator: &LayerLocator) -> Result<usize> {
        // One logical layer per directory.
        Ok(1)
    }

    fn load(&self, layer: &mut Layer, locator: &LayerLocator) -> Result<()> {
        layer.dir = None;
        layer.path = None;
        layer.has_user_override = false;
        layer.has_privileged_override = false;

        let path = locator
            .path
            .canonicalize()
            .map_err(|_| Error::PathNotFound(locator.path.display().to_string()))?;

        let c_path = path_cstr(&path)?;
        let raw = retry_eintr(|| {
            // Safe because the path pointer stays valid for the call and
            // we check the return value.
            unsafe {
                libc::open(
                    c_path.as_ptr(),
                    libc::O_DIRECTORY | libc::O_RDONLY | libc::O_CLOEXEC,
                ) as libc::c_long
            }
        })?;
        // Safe because the kernel just handed us this descriptor.
        let dir = unsafe { OwnedFd::from_raw_fd(raw as i32) };

        // The tier honored for every object of this layer is fixed here,
        // by probing the root once. Privileged wins over user.
        let mut probe = [0u8; ownership::OVERRIDE_VALUE_MAX];
        if xattr::fgetxattr(dir.as_fd(), OverrideTier::Privileged.xattr_name(), &mut probe).is_ok()
        {
            layer.has_privileged_override = true;
        } else if xattr::fgetxattr(dir.as_fd(), OverrideTier::User.xattr_name(), &mut probe).is_ok()
        {
            layer.has_user_override = true;
        }

        debug!(
            path = %path.display(),
            privileged_override = layer.has_privileged_override,
            user_override = layer.has_user_override,
            "loaded direct layer"
        );

        layer.dir = Some(dir);
        layer.path = Some(path);
        Ok(())
    }

    fn release(&self, layer: &mut Layer) -> Result<()> {
        // Dropping the descriptor closes it; nothing in this backend
        // derives handles that outlive the layer.
        if layer.dir.take().is_some() {
            debug!(path = ?layer.path, "released direct layer");
        }
        layer.path = None;
        Ok(())
    }

    fn exists(&self, layer: &Layer, path: &Path) -> Result<bool> {
        let dirfd = layer.dir_fd()?;
        let c_path = path_cstr(path)?;
        // Safe because the path pointer stays valid for the call and we
        // check the return value.
        let ret = unsafe {
            libc::faccessat(
                dirfd.as_raw_fd(),
                c_path.as_ptr(),
                libc::F_OK,
                libc::AT_SYMLINK_NOFOLLOW,
            )
        };
        if ret == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOENT) | Some(libc::ENOTDIR) => Ok(false),
            _ => Err(err.into()),
        }
    }

    fn stat_path(
        &self,
        layer: &Layer,
        path: &Path,
        follow: bool,
        mask: u32,
    ) -> Result<FileMetadata> {
        let mut meta = stat::stat_at(layer.dir_fd()?, path, follow, mask)?;
        apply_override(layer, None, path, &mut meta)?;
        Ok(meta)
    }

    fn stat_fd(
        &self,
        layer: &Layer,
        fd: BorrowedFd<'_>,
        path: &Path,
        mask: u32,
    ) -> Result<FileMetadata> {
        let mut meta = stat::stat_fd(fd, mask)?;
        apply_override(layer, Some(fd), path, &mut meta)?;
        Ok(meta)
    }

    fn open_directory(&self, layer: &Layer, path: &Path) -> Result<Box<dyn DirectoryStream>> {
        let fd = resolver::safe_openat(
            layer.dir_fd()?,
            path,
            libc::O_DIRECTORY | libc::O_RDONLY | libc::O_CLOEXEC,
            0,
        )?;
        Ok(Box::new(DirectDirStream::from_fd(fd)?))
    }

    fn open(&self, layer: &Layer, path: &Path, flags: i32, mode: u32) -> Result<OwnedFd> {
        Ok(resolver::safe_openat(layer.dir_fd()?, path, flags, mode)?)
    }

    fn read_link(&self, layer: &Layer, path: &Path, buf: &mut [u8]) -> Result<usize> {
        let dirfd = layer.dir_fd()?;
        let c_path = path_cstr(path)?;
        let len = retry_eintr(|| {
            // Safe because the kernel writes at most buf.len() bytes into
            // buf and we check the return value.
            unsafe {
                libc::readlinkat(
                    dirfd.as_raw_fd(),
                    c_path.as_ptr(),
                    buf.as_mut_ptr().cast(),
                    buf.len(),
                ) as libc::c_long
            }
        })?;
        Ok(len as usize)
    }

    fn get_xattr(&self, layer: &Layer, path: &Path, name: &str, buf: &mut [u8]) -> Result<usize> {
        let c_name =
            CString::new(name).map_err(|_| Error::Io(io::Error::from_raw_os_error(libc::EINVAL)))?;
        let read = match resolver::open_fd_or_path(layer, path, libc::O_RDONLY)? {
            Resolved::Fd(fd) => xattr::fgetxattr(fd.as_fd(), &c_name, buf),
            Resolved::Path(full) => xattr::lgetxattr(&path_cstr(&full)?, &c_name, buf),
        };
        Ok(read?)
    }

    fn list_xattr(&self, layer: &Layer, path: &Path, buf: &mut [u8]) -> Result<usize> {
        let read = match resolver::open_fd_or_path(layer, path, libc::O_RDONLY)? {
            Resolved::Fd(fd) => xattr::flistxattr(fd.as_fd(), buf),
            Resolved::Path(full) => xattr::llistxattr(&path_cstr(&full)?, buf),
        };
        Ok(read?)
    }

    fn needs_id_remap(&self, layer: &Layer) -> bool {
        !layer.has_privileged_override && !layer.has_user_override
    }
}

/// Directory cursor backed by a `DIR` stream that owns its descriptor.
struct DirectDirStream {
    dir: *mut libc::DIR,
}

// Safe: the stream is driven from one thread at a time through &mut and
// a DIR stream carries no thread affinity.
unsafe impl Send for DirectDirStream {}

impl DirectDirStream {
    /// Wrap an open directory descriptor; closes it even when the
    /// wrapping itself fails.
    fn from_fd(fd: OwnedFd) -> Result<Self> {
        let raw = fd.into_raw_fd();
        // Safe because we own raw and fdopendir takes ownership on
        // success.
        let dir = unsafe { libc::fdopendir(raw) };
        if dir.is_null() {
            let err = io::Error::last_os_error();
            // Safe because fdopendir failed, so ownership stayed with us.
            unsafe { libc::close(raw) };
            return Err(err.into());
        }
        Ok(DirectDirStream { dir })
    }
}

impl DirectoryStream for DirectDirStream {
    fn read_entry(&mut self) -> Result<Option<DirEntry>> {
        // readdir returns NULL both at end of stream and on error; only
        // errno tells them apart.
        // Safe because self.dir is a live DIR stream we own.
        unsafe { *libc::__errno_location() = 0 };
        let entry = unsafe { libc::readdir64(self.dir) };
        if entry.is_null() {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(0) | None => Ok(None),
                _ => Err(err.into()),
            };
        }
        // Safe because readdir64 returned a valid entry that stays alive
        // until the next call on this stream.
        let entry = unsafe { &*entry };
        let name = unsafe { std::ffi::CStr::from_ptr(entry.d_name.as_ptr()) };
        use std::os::unix::ffi::OsStrExt;
        Ok(Some(DirEntry {
            name: std::ffi::OsStr::from_bytes(name.to_bytes()).to_os_string(),
            ino: entry.d_ino,
            kind: FileKind::from_dtype(entry.d_type),
        }))
    }
}

impl Drop for DirectDirStream {
    fn drop(&mut self) {
        // Safe because self.dir is a live DIR stream we own; closedir
        // releases the underlying descriptor.
        unsafe { libc::closedir(self.dir) };
    }
}
