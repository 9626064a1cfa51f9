//! Storage backends ("data sources") for overlay layers.
//!
//! The overlay engine never talks to a concrete backend type: it holds a
//! [`Layer`] bound to an `Arc<dyn DataSource>` and drives everything
//! through that capability table. Alternative backends (archive-based,
//! read-only image) plug in by implementing [`DataSource`].

pub mod direct;

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::ownership::OverrideTier;
use crate::stat::FileMetadata;

/// Opaque locator handed to a backend when loading layers.
///
/// The direct backend only consumes `path`; other backends interpret
/// `opaque` however they like. Serializable so mount tables can carry
/// layer descriptions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerLocator {
    /// Backend-specific data, unused by the direct backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opaque: Option<String>,
    /// Directory path for directory-backed sources.
    pub path: PathBuf,
}

impl LayerLocator {
    pub fn new(path: PathBuf) -> Self {
        LayerLocator { opaque: None, path }
    }
}

/// File type reported by a directory entry, when the filesystem knows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    RegularFile,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl FileKind {
    /// Map a dirent `d_type`; `DT_UNKNOWN` yields `None`.
    pub fn from_dtype(d_type: u8) -> Option<Self> {
        match d_type {
            libc::DT_REG => Some(FileKind::RegularFile),
            libc::DT_DIR => Some(FileKind::Directory),
            libc::DT_LNK => Some(FileKind::Symlink),
            libc::DT_BLK => Some(FileKind::BlockDevice),
            libc::DT_CHR => Some(FileKind::CharDevice),
            libc::DT_FIFO => Some(FileKind::Fifo),
            libc::DT_SOCK => Some(FileKind::Socket),
            _ => None,
        }
    }
}

/// One entry yielded by a directory stream.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: OsString,
    pub ino: u64,
    pub kind: Option<FileKind>,
}

/// An open, positioned enumeration cursor over one directory.
///
/// Each cursor owns its underlying descriptor; concurrent enumerations
/// of the same path never share one. The descriptor is released when the
/// stream is dropped or handed to [`DataSource::close_directory`].
pub trait DirectoryStream: Send {
    /// Advance the cursor; `None` marks end of stream.
    fn read_entry(&mut self) -> Result<Option<DirEntry>>;
}

/// The operation set every storage backend must provide.
pub trait DataSource: Send + Sync {
    /// Number of stacked sub-layers behind one locator, at least 1.
    fn layer_count(&self, locator: &LayerLocator) -> Result<usize>;

    /// Populate `layer` from `locator`. Fully populates or fully fails;
    /// a layer is never left half-initialized.
    fn load(&self, layer: &mut Layer, locator: &LayerLocator) -> Result<()>;

    /// Release backend-owned resources. Idempotent.
    fn release(&self, layer: &mut Layer) -> Result<()>;

    /// Whether `path` names an object in the layer, of any type.
    fn exists(&self, layer: &Layer, path: &Path) -> Result<bool>;

    /// Stat by relative path, optionally following a final symlink.
    fn stat_path(&self, layer: &Layer, path: &Path, follow: bool, mask: u32)
        -> Result<FileMetadata>;

    /// Stat a previously opened descriptor; `path` is a hint for
    /// backends that cannot stat a bare descriptor.
    fn stat_fd(&self, layer: &Layer, fd: BorrowedFd<'_>, path: &Path, mask: u32)
        -> Result<FileMetadata>;

    /// Open an independent enumeration cursor over a directory.
    fn open_directory(&self, layer: &Layer, path: &Path) -> Result<Box<dyn DirectoryStream>>;

    /// Advance a cursor produced by [`DataSource::open_directory`].
    fn read_directory_entry(&self, stream: &mut dyn DirectoryStream) -> Result<Option<DirEntry>> {
        stream.read_entry()
    }

    /// Release a cursor and its underlying descriptor.
    fn close_directory(&self, stream: Box<dyn DirectoryStream>) -> Result<()> {
        drop(stream);
        Ok(())
    }

    /// Open an object; descriptor ownership passes to the caller.
    fn open(&self, layer: &Layer, path: &Path, flags: i32, mode: u32) -> Result<OwnedFd>;

    /// Read a symlink target into `buf`; returns the byte count, with no
    /// trailing NUL appended.
    fn read_link(&self, layer: &Layer, path: &Path, buf: &mut [u8]) -> Result<usize>;

    /// Read a named extended attribute into `buf`.
    fn get_xattr(&self, layer: &Layer, path: &Path, name: &str, buf: &mut [u8]) -> Result<usize>;

    /// List extended-attribute names into `buf`.
    fn list_xattr(&self, layer: &Layer, path: &Path, buf: &mut [u8]) -> Result<usize>;

    /// Whether raw ownership ids still need the external id-mapping
    /// step, i.e. no override record supersedes them.
    fn needs_id_remap(&self, layer: &Layer) -> bool;
}

/// One storage subtree participating in the overlay.
///
/// Populated exactly once by `load`, read concurrently for the lifetime
/// of the mount, released at unmount. `dir` and `path` are either both
/// present or both absent.
pub struct Layer {
    source: Arc<dyn DataSource>,
    pub(crate) dir: Option<OwnedFd>,
    pub(crate) path: Option<PathBuf>,
    pub(crate) has_user_override: bool,
    pub(crate) has_privileged_override: bool,
}

impl Layer {
    /// An unloaded layer bound to a backend.
    pub fn new(source: Arc<dyn DataSource>) -> Self {
        Layer {
            source,
            dir: None,
            path: None,
            has_user_override: false,
            has_privileged_override: false,
        }
    }

    /// Bind a backend and load it from `locator` in one step.
    pub fn load(source: Arc<dyn DataSource>, locator: &LayerLocator) -> Result<Layer> {
        let mut layer = Layer::new(Arc::clone(&source));
        source.load(&mut layer, locator)?;
        Ok(layer)
    }

    /// Release backend resources; safe to call more than once.
    pub fn release(&mut self) -> Result<()> {
        let source = Arc::clone(&self.source);
        source.release(self)
    }

    pub fn is_loaded(&self) -> bool {
        self.dir.is_some()
    }

    /// The layer's directory descriptor.
    pub fn dir_fd(&self) -> Result<BorrowedFd<'_>> {
        self.dir.as_ref().map(AsFd::as_fd).ok_or(Error::LayerNotLoaded)
    }

    /// The layer's canonical absolute root path.
    pub fn path(&self) -> Result<&Path> {
        self.path.as_deref().ok_or(Error::LayerNotLoaded)
    }

    pub fn has_user_override(&self) -> bool {
        self.has_user_override
    }

    pub fn has_privileged_override(&self) -> bool {
        self.has_privileged_override
    }

    /// The single override tier consulted for objects of this layer,
    /// decided once at load time. Privileged wins over user.
    pub fn override_tier(&self) -> Option<OverrideTier> {
        if self.has_privileged_override {
            Some(OverrideTier::Privileged)
        } else if self.has_user_override {
            Some(OverrideTier::User)
        } else {
            None
        }
    }

    pub fn source(&self) -> &Arc<dyn DataSource> {
        &self.source
    }

    pub fn exists(&self, path: &Path) -> Result<bool> {
        self.source.exists(self, path)
    }

    pub fn stat_path(&self, path: &Path, follow: bool, mask: u32) -> Result<FileMetadata> {
        self.source.stat_path(self, path, follow, mask)
    }

    pub fn stat_fd(&self, fd: BorrowedFd<'_>, path: &Path, mask: u32) -> Result<FileMetadata> {
        self.source.stat_fd(self, fd, path, mask)
    }

    pub fn open_directory(&self, path: &Path) -> Result<Box<dyn DirectoryStream>> {
        self.source.open_directory(self, path)
    }

    pub fn open(&self, path: &Path, flags: i32, mode: u32) -> Result<OwnedFd> {
        self.source.open(self, path, flags, mode)
    }

    pub fn read_link(&self, path: &Path, buf: &mut [u8]) -> Result<usize> {
        self.source.read_link(self, path, buf)
    }

    pub fn get_xattr(&self, path: &Path, name: &str, buf: &mut [u8]) -> Result<usize> {
        self.source.get_xattr(self, path, name, buf)
    }

    pub fn list_xattr(&self, path: &Path, buf: &mut [u8]) -> Result<usize> {
        self.source.list_xattr(self, path, buf)
    }

    pub fn needs_id_remap(&self) -> bool {
        self.source.needs_id_remap(self)
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("path", &self.path)
            .field("loaded", &self.is_loaded())
            .field("has_user_override", &self.has_user_override)
            .field("has_privileged_override", &self.has_privileged_override)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_round_trips_through_serde() {
        let locator = LayerLocator::new(PathBuf::from("/data/lower"));
        let json = serde_json::to_string(&locator).unwrap();
        assert_eq!(json, r#"{"path":"/data/lower"}"#);
        let back: LayerLocator = serde_json::from_str(&json).unwrap();
        assert_eq!(back.path, locator.path);
        assert!(back.opaque.is_none());
    }

    #[test]
    fn unloaded_layer_reports_not_loaded() {
        let layer = Layer::new(Arc::new(direct::DirectSource::new()));
        assert!(!layer.is_loaded());
        assert!(matches!(layer.dir_fd(), Err(Error::LayerNotLoaded)));
        assert!(matches!(layer.path(), Err(Error::LayerNotLoaded)));
        assert!(layer.override_tier().is_none());
    }

    #[test]
    fn dtype_mapping() {
        assert_eq!(FileKind::from_dtype(libc::DT_REG), Some(FileKind::RegularFile));
        assert_eq!(FileKind::from_dtype(libc::DT_DIR), Some(FileKind::Directory));
        assert_eq!(FileKind::from_dtype(libc::DT_LNK), Some(FileKind::Symlink));
        assert_eq!(FileKind::from_dtype(libc::DT_UNKNOWN), None);
    }
}
