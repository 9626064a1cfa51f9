//! Error types for overfs

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by storage backends
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying kernel call failed; surfaced unchanged
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Layer locator did not resolve to an existing directory
    #[error("cannot resolve path {0}")]
    PathNotFound(String),

    /// Operation invoked on a layer before `load` or after `release`
    #[error("layer is not loaded")]
    LayerNotLoaded,

    /// Ownership override attribute present but not in `uid:gid:octal-mode` form
    #[error("malformed ownership override record {0:?}")]
    MalformedOverride(String),
}

impl Error {
    /// Shorthand for wrapping the calling thread's last OS error.
    pub fn last_os_error() -> Self {
        Error::Io(std::io::Error::last_os_error())
    }

    /// The errno a filesystem dispatcher should answer with.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Error::PathNotFound(_) => libc::ENOENT,
            Error::LayerNotLoaded => libc::EBADF,
            Error::MalformedOverride(_) => libc::EINVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        let err = Error::Io(std::io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(err.errno(), libc::EACCES);
        assert_eq!(Error::MalformedOverride("x".into()).errno(), libc::EINVAL);
        assert_eq!(Error::LayerNotLoaded.errno(), libc::EBADF);
        assert_eq!(Error::PathNotFound("/nope".into()).errno(), libc::ENOENT);
    }
}
