//! Ownership override records.
//!
//! An unprivileged process populating a layer cannot chown the files it
//! writes, so the intended (uid, gid, permission bits) are kept as a
//! small text record in an extended attribute on the object itself and
//! reapplied whenever the object is stat'ed.
//!
//! Two attribute names exist, one per trust tier: the privileged name
//! lives in the `security` namespace and can only be written with
//! elevated capability; the user name is writable by the unprivileged
//! owner and is honored only when the privileged one is absent. The
//! value format `uid:gid:permission-octal` (e.g. `1000:1000:644`) is an
//! on-disk contract shared by every layer tree ever written.

use std::ffi::CStr;
use std::os::fd::BorrowedFd;

use crate::error::{Error, Result};
use crate::stat::FileMetadata;
use crate::xattr;

/// Attribute name writable by the unprivileged owner.
pub const OVERRIDE_XATTR_USER: &CStr = c"user.overfs.override_stat";

/// Attribute name requiring elevated capability to write.
pub const OVERRIDE_XATTR_PRIVILEGED: &CStr = c"security.overfs.override_stat";

/// Upper bound on a stored override value, `uid:gid:octal` included.
pub const OVERRIDE_VALUE_MAX: usize = 64;

/// Trust tier of an override attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideTier {
    User,
    Privileged,
}

impl OverrideTier {
    /// The extended-attribute name holding this tier's records.
    pub fn xattr_name(self) -> &'static CStr {
        match self {
            OverrideTier::User => OVERRIDE_XATTR_USER,
            OverrideTier::Privileged => OVERRIDE_XATTR_PRIVILEGED,
        }
    }
}

/// Intended ownership and permission bits for one filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverrideRecord {
    pub uid: u32,
    pub gid: u32,
    /// Permission bits only; type bits are never overridden.
    pub mode: u32,
}

impl OverrideRecord {
    pub fn new(uid: u32, gid: u32, mode: u32) -> Self {
        OverrideRecord { uid, gid, mode }
    }

    /// Parse the stored `uid:gid:permission-octal` text.
    ///
    /// A record that is present but does not parse is on-disk corruption
    /// and reported as [`Error::MalformedOverride`], never silently
    /// defaulted. Absence of the attribute is the caller's normal case,
    /// not this function's.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| Error::MalformedOverride(String::from_utf8_lossy(raw).into_owned()))?;
        let malformed = || Error::MalformedOverride(text.to_string());

        let mut fields = text.split(':');
        let uid = fields
            .next()
            .and_then(|f| f.parse::<u32>().ok())
            .ok_or_else(malformed)?;
        let gid = fields
            .next()
            .and_then(|f| f.parse::<u32>().ok())
            .ok_or_else(malformed)?;
        let mode = fields
            .next()
            .and_then(|f| u32::from_str_radix(f, 8).ok())
            .ok_or_else(malformed)?;
        if fields.next().is_some() {
            return Err(malformed());
        }

        Ok(OverrideRecord { uid, gid, mode })
    }

    /// Encode to the on-disk text format.
    pub fn encode(&self) -> String {
        format!("{}:{}:{:o}", self.uid, self.gid, self.mode)
    }

    /// Write this record to the given tier's attribute on an open object.
    ///
    /// Writing the privileged tier fails with `EPERM` without the
    /// capability to write `security.*` names.
    pub fn store(&self, fd: BorrowedFd<'_>, tier: OverrideTier) -> Result<()> {
        xattr::fsetxattr(fd, tier.xattr_name(), self.encode().as_bytes())?;
        Ok(())
    }

    /// Overlay this record onto raw metadata: ownership is replaced
    /// outright, permission bits are replaced, type bits are kept.
    pub fn apply(&self, meta: &mut FileMetadata) {
        meta.uid = self.uid;
        meta.gid = self.gid;
        meta.mode = (meta.mode & libc::S_IFMT) | (self.mode & !libc::S_IFMT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta_with_mode(mode: u32) -> FileMetadata {
        FileMetadata {
            dev: 0,
            ino: 1,
            mode,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: 0,
            blksize: 4096,
            blocks: 0,
            atime: Default::default(),
            mtime: Default::default(),
            ctime: Default::default(),
        }
    }

    #[test]
    fn encode_parse_round_trip() {
        for record in [
            OverrideRecord::new(0, 0, 0),
            OverrideRecord::new(1000, 1000, 0o644),
            OverrideRecord::new(65534, 65534, 0o7777),
            OverrideRecord::new(u32::MAX, 0, 0o400),
        ] {
            assert_eq!(
                OverrideRecord::parse(record.encode().as_bytes()).unwrap(),
                record
            );
        }
    }

    #[test]
    fn parse_stored_format() {
        let record = OverrideRecord::parse(b"1000:1000:600").unwrap();
        assert_eq!(record, OverrideRecord::new(1000, 1000, 0o600));
    }

    #[test]
    fn parse_rejects_malformed_records() {
        for raw in [
            &b"bogus"[..],
            b"",
            b"1:2",
            b"1:2:644:extra",
            b"-1:2:644",
            b"1:2:988",
            b"1:abc:644",
            b"\xff\xfe",
        ] {
            assert!(
                matches!(
                    OverrideRecord::parse(raw),
                    Err(Error::MalformedOverride(_))
                ),
                "accepted {raw:?}"
            );
        }
    }

    #[test]
    fn apply_preserves_type_bits() {
        let mut meta = meta_with_mode(libc::S_IFREG | 0o644);
        OverrideRecord::new(1000, 1000, 0o600).apply(&mut meta);
        assert_eq!(meta.uid, 1000);
        assert_eq!(meta.gid, 1000);
        assert_eq!(meta.mode, libc::S_IFREG | 0o600);

        let mut dir = meta_with_mode(libc::S_IFDIR | 0o755);
        OverrideRecord::new(0, 0, 0o700).apply(&mut dir);
        assert_eq!(dir.mode, libc::S_IFDIR | 0o700);
    }
}
