//! Storage error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The requested entry does not exist or is inaccessible.
    #[error("does not exist or inaccessible: {0}")]
    NotFound(String),

    /// The entry name escapes the repository root or is otherwise unusable.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The repository id is not a valid UUID.
    #[error("invalid repository id: {0}")]
    InvalidId(String),

    /// A freshly generated repository id already exists on disk.
    #[error("repository {id} at path {} already exists", path.display())]
    RepoExists {
        /// The colliding id.
        id: String,
        /// Where the repository was to be created.
        path: PathBuf,
    },

    /// A directory operation was attempted on a file.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// A file operation was attempted on a directory.
    #[error("is a directory: {0}")]
    IsADirectory(String),

    /// A corruption was detected.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// A repository archive could not be built or read.
    #[error("archive error: {0}")]
    Archive(String),
}

/// A specialized Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
