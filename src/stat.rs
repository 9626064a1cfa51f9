//! File metadata acquisition.
//!
//! Metadata retrieval prefers `statx`, which takes a field-interest mask
//! and `AT_STATX_DONT_SYNC` so a layer proxying remote storage never
//! forces a synchronization just to answer a stat. Kernels without
//! `statx` answer `ENOSYS`; only that error switches a call to the
//! classic stat family, where the mask is ignored and the full record is
//! returned. The unsupported outcome is remembered so later calls skip
//! the probe.

use std::ffi::CStr;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, BorrowedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::resolver::path_cstr;

/// Field-interest mask requesting the basic stat fields.
pub const MASK_BASIC: u32 = libc::STATX_BASIC_STATS;

/// A single point in time, as the kernel reports it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: u32,
}

/// Canonical file metadata, normalized from either stat flavor.
///
/// Produced fresh by every stat operation and owned by the caller;
/// nothing in this crate caches one across calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetadata {
    pub dev: u64,
    pub ino: u64,
    /// File type and permission bits, `st_mode` layout.
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atime: TimeSpec,
    pub mtime: TimeSpec,
    pub ctime: TimeSpec,
}

impl FileMetadata {
    /// Pure structural conversion from an extended stat record.
    pub fn from_statx(stx: &libc::statx) -> Self {
        FileMetadata {
            dev: libc::makedev(stx.stx_dev_major, stx.stx_dev_minor),
            ino: stx.stx_ino,
            mode: u32::from(stx.stx_mode),
            nlink: u64::from(stx.stx_nlink),
            uid: stx.stx_uid,
            gid: stx.stx_gid,
            rdev: libc::makedev(stx.stx_rdev_major, stx.stx_rdev_minor),
            size: stx.stx_size,
            blksize: stx.stx_blksize,
            blocks: stx.stx_blocks,
            atime: TimeSpec {
                sec: stx.stx_atime.tv_sec,
                nsec: stx.stx_atime.tv_nsec,
            },
            mtime: TimeSpec {
                sec: stx.stx_mtime.tv_sec,
                nsec: stx.stx_mtime.tv_nsec,
            },
            ctime: TimeSpec {
                sec: stx.stx_ctime.tv_sec,
                nsec: stx.stx_ctime.tv_nsec,
            },
        }
    }

    /// Pure structural conversion from a classic stat record.
    pub fn from_stat(st: &libc::stat64) -> Self {
        FileMetadata {
            dev: st.st_dev,
            ino: st.st_ino,
            mode: st.st_mode,
            nlink: st.st_nlink as u64,
            uid: st.st_uid,
            gid: st.st_gid,
            rdev: st.st_rdev,
            size: st.st_size as u64,
            blksize: st.st_blksize as u32,
            blocks: st.st_blocks as u64,
            atime: TimeSpec {
                sec: st.st_atime,
                nsec: st.st_atime_nsec as u32,
            },
            mtime: TimeSpec {
                sec: st.st_mtime,
                nsec: st.st_mtime_nsec as u32,
            },
            ctime: TimeSpec {
                sec: st.st_ctime,
                nsec: st.st_ctime_nsec as u32,
            },
        }
    }

    /// File-type bits of the mode (`S_IFMT` portion).
    pub fn file_type(&self) -> u32 {
        self.mode & libc::S_IFMT
    }

    /// Permission bits of the mode (everything below `S_IFMT`).
    pub fn permissions(&self) -> u32 {
        self.mode & !libc::S_IFMT
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == libc::S_IFDIR
    }

    pub fn is_file(&self) -> bool {
        self.file_type() == libc::S_IFREG
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == libc::S_IFLNK
    }
}

static STATX_UNSUPPORTED: AtomicBool = AtomicBool::new(false);

fn is_enosys(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOSYS)
}

/// Stat an already-open descriptor.
pub fn stat_fd(fd: BorrowedFd<'_>, mask: u32) -> io::Result<FileMetadata> {
    if !STATX_UNSUPPORTED.load(Ordering::Relaxed) {
        let flags = libc::AT_EMPTY_PATH | libc::AT_STATX_DONT_SYNC;
        match do_statx(fd.as_raw_fd(), c"", flags, mask) {
            Ok(stx) => return Ok(FileMetadata::from_statx(&stx)),
            Err(err) if is_enosys(&err) => STATX_UNSUPPORTED.store(true, Ordering::Relaxed),
            Err(err) => return Err(err),
        }
    }
    classic_stat_fd(fd)
}

/// Stat a path relative to `dirfd`, optionally following a final symlink.
pub fn stat_at(dirfd: BorrowedFd<'_>, path: &Path, follow: bool, mask: u32) -> io::Result<FileMetadata> {
    let c_path = path_cstr(path)?;
    let at_flags = if follow { 0 } else { libc::AT_SYMLINK_NOFOLLOW };
    if !STATX_UNSUPPORTED.load(Ordering::Relaxed) {
        match do_statx(
            dirfd.as_raw_fd(),
            &c_path,
            at_flags | libc::AT_STATX_DONT_SYNC,
            mask,
        ) {
            Ok(stx) => return Ok(FileMetadata::from_statx(&stx)),
            Err(err) if is_enosys(&err) => STATX_UNSUPPORTED.store(true, Ordering::Relaxed),
            Err(err) => return Err(err),
        }
    }
    classic_stat_at(dirfd, &c_path, at_flags)
}

fn do_statx(dirfd: i32, path: &CStr, flags: i32, mask: u32) -> io::Result<libc::statx> {
    let mut stx = MaybeUninit::<libc::statx>::zeroed();
    // Safe because statx only writes into stx and we check the return value.
    let ret = unsafe { libc::statx(dirfd, path.as_ptr(), flags, mask, stx.as_mut_ptr()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safe because a successful statx fully initialized the record.
    Ok(unsafe { stx.assume_init() })
}

fn classic_stat_fd(fd: BorrowedFd<'_>) -> io::Result<FileMetadata> {
    let mut st = MaybeUninit::<libc::stat64>::zeroed();
    // Safe because fstat64 only writes into st and we check the return value.
    let ret = unsafe { libc::fstat64(fd.as_raw_fd(), st.as_mut_ptr()) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safe because a successful fstat64 fully initialized the record.
    Ok(FileMetadata::from_stat(&unsafe { st.assume_init() }))
}

fn classic_stat_at(dirfd: BorrowedFd<'_>, path: &CStr, at_flags: i32) -> io::Result<FileMetadata> {
    let mut st = MaybeUninit::<libc::stat64>::zeroed();
    // Safe because fstatat64 only writes into st and we check the return value.
    let ret = unsafe { libc::fstatat64(dirfd.as_raw_fd(), path.as_ptr(), st.as_mut_ptr(), at_flags) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safe because a successful fstatat64 fully initialized the record.
    Ok(FileMetadata::from_stat(&unsafe { st.assume_init() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::os::fd::{AsFd, OwnedFd};
    use std::os::unix::fs::MetadataExt;
    use std::path::Path;
    use tempfile::tempdir;

    fn open_dirfd(path: &Path) -> OwnedFd {
        OwnedFd::from(File::open(path).unwrap())
    }

    #[test]
    fn stat_at_matches_std_metadata() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("f"), b"hello").unwrap();
        let expected = fs::metadata(dir.path().join("f")).unwrap();

        let dirfd = open_dirfd(dir.path());
        let meta = stat_at(dirfd.as_fd(), Path::new("f"), false, MASK_BASIC).unwrap();

        assert_eq!(meta.ino, expected.ino());
        assert_eq!(meta.size, 5);
        assert_eq!(meta.mode, expected.mode());
        assert_eq!(meta.uid, expected.uid());
        assert_eq!(meta.gid, expected.gid());
        assert!(meta.is_file());
        assert_eq!(meta.mtime.sec, expected.mtime());
    }

    #[test]
    fn stat_fd_matches_stat_at() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("f"), b"abc").unwrap();

        let dirfd = open_dirfd(dir.path());
        let by_path = stat_at(dirfd.as_fd(), Path::new("f"), false, MASK_BASIC).unwrap();

        let file = File::open(dir.path().join("f")).unwrap();
        let by_fd = stat_fd(file.as_fd(), MASK_BASIC).unwrap();

        assert_eq!(by_fd.ino, by_path.ino);
        assert_eq!(by_fd.dev, by_path.dev);
        assert_eq!(by_fd.mode, by_path.mode);
        assert_eq!(by_fd.size, by_path.size);
    }

    #[test]
    fn classic_fallback_returns_full_record() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("f"), b"abcd").unwrap();

        let dirfd = open_dirfd(dir.path());
        let c_path = path_cstr(Path::new("f")).unwrap();
        let classic = classic_stat_at(dirfd.as_fd(), &c_path, libc::AT_SYMLINK_NOFOLLOW).unwrap();
        // A narrow mask on the preferred path must not leave the fallback
        // record partially populated.
        let extended = stat_at(dirfd.as_fd(), Path::new("f"), false, libc::STATX_INO).unwrap();

        assert_eq!(classic.ino, extended.ino);
        assert_eq!(classic.size, 4);
        assert_ne!(classic.mode, 0);
        assert_ne!(classic.nlink, 0);
    }

    #[test]
    fn follow_flag_distinguishes_symlinks() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("target"), b"x").unwrap();
        std::os::unix::fs::symlink("target", dir.path().join("link")).unwrap();

        let dirfd = open_dirfd(dir.path());
        let nofollow = stat_at(dirfd.as_fd(), Path::new("link"), false, MASK_BASIC).unwrap();
        let follow = stat_at(dirfd.as_fd(), Path::new("link"), true, MASK_BASIC).unwrap();

        assert!(nofollow.is_symlink());
        assert!(follow.is_file());
    }
}
