//! overfs - storage-layer backends for a user-space overlay filesystem
//!
//! This library answers file-access operations (stat, directory listing,
//! extended attributes, open, readlink, existence checks) for one
//! overlay layer at a time, behind a pluggable [`DataSource`] capability
//! table. The [`DirectSource`] backend serves them straight from a real
//! on-disk directory tree, reconciling what an unprivileged process can
//! actually chown with the overlay's ownership contract through
//! extended-attribute ownership override records (see [`ownership`]).
//!
//! The overlay merge engine, the FUSE request dispatcher, and mount
//! option handling live outside this crate; they consume the types
//! re-exported here.

pub mod error;
pub mod ownership;
pub mod resolver;
pub mod source;
pub mod stat;
pub mod xattr;

pub use error::{Error, Result};
pub use ownership::{OverrideRecord, OverrideTier};
pub use resolver::Resolved;
pub use source::direct::DirectSource;
pub use source::{DataSource, DirEntry, DirectoryStream, FileKind, Layer, LayerLocator};
pub use stat::{FileMetadata, TimeSpec};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::source::{DataSource, Layer, LayerLocator};
    pub use crate::stat::FileMetadata;
}
