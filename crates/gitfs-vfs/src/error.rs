//! Error types for the union VFS.

use thiserror::Error;

/// Errors that can occur during VFS operations.
#[derive(Debug, Error)]
pub enum VfsError {
    /// Path absent in the merged namespace.
    #[error("path not found: {0}")]
    NotFound(String),

    /// A directory operation was applied to a non-directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// A file operation was applied to a directory.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// Entry already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Directory is not empty.
    #[error("directory not empty: {0}")]
    NotEmpty(String),

    /// Mode or ownership check failed.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Concurrent mutations raced and this side lost.
    #[error("conflicting concurrent modification: {0}")]
    Conflict(String),

    /// Path escapes the layer root or is otherwise malformed.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Object store could not produce the requested object.
    #[error("object store error: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Object bytes did not match the advertised length.
    #[error("truncated object {id}: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Object identifier.
        id: String,
        /// Size advertised by the store.
        expected: u64,
        /// Bytes actually produced.
        actual: u64,
    },

    /// Mount or unmount operation failed.
    #[error("mount failed: {0}")]
    MountFailed(String),

    /// IO error from scratch files or the upper layer.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VfsError {
    /// Wrap an arbitrary store backend error.
    pub fn store(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        VfsError::Store(source.into())
    }

    /// Map this error to the errno reported over the kernel transport.
    pub fn errno(&self) -> i32 {
        match self {
            VfsError::NotFound(_) => libc::ENOENT,
            VfsError::NotADirectory(_) => libc::ENOTDIR,
            VfsError::IsADirectory(_) => libc::EISDIR,
            VfsError::AlreadyExists(_) => libc::EEXIST,
            VfsError::NotEmpty(_) => libc::ENOTEMPTY,
            VfsError::PermissionDenied(_) => libc::EACCES,
            VfsError::Conflict(_) => libc::EBUSY,
            VfsError::InvalidPath(_) => libc::EINVAL,
            VfsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            VfsError::Store(_)
            | VfsError::Truncated { .. }
            | VfsError::MountFailed(_) => libc::EIO,
        }
    }

    /// Whether this error means "the path does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(self, VfsError::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(VfsError::NotFound("x".into()).errno(), libc::ENOENT);
        assert_eq!(VfsError::NotADirectory("x".into()).errno(), libc::ENOTDIR);
        assert_eq!(VfsError::IsADirectory("x".into()).errno(), libc::EISDIR);
        assert_eq!(VfsError::store("boom").errno(), libc::EIO);
    }

    #[test]
    fn test_io_errno_passthrough() {
        let e = VfsError::Io(std::io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(e.errno(), libc::ENOSPC);
    }
}
