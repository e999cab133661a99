//! Storage backends for repository content.
//!
//! A repository is a tree of directories and byte files. [`Backend`] is the
//! seam that decides where those bytes live; [`fs::FsBackend`] maps the tree
//! onto a real directory and [`log::LogBackend`] folds it into a single
//! append-only record file.

pub(crate) mod fs;
pub(crate) mod log;

use crate::{EntryPath, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::SystemTime;
use tokio::io::AsyncRead;

/// A readable byte stream over one file entry.
pub type ReadStream = Box<dyn AsyncRead + Send + Unpin>;

/// Which backend a repository uses.
///
/// Written in configuration as `filesystem` (or `fs`) and `log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Plain files and directories below the repository path.
    #[default]
    #[serde(alias = "fs")]
    Filesystem,
    /// One append-only record log per repository.
    Log,
}

impl BackendKind {
    /// Opens a backend of this kind rooted at `path`.
    pub(crate) async fn open(self, path: &Path) -> Result<Box<dyn Backend>> {
        Ok(match self {
            Self::Filesystem => Box::new(fs::FsBackend::open(path).await?),
            Self::Log => Box::new(log::LogBackend::open(path).await?),
        })
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fs" | "filesystem" => Ok(Self::Filesystem),
            "log" => Ok(Self::Log),
            other => Err(format!("unknown storage backend: {other}")),
        }
    }
}

/// Kind of a repository entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A byte file.
    File,
    /// A directory.
    Directory,
}

/// Metadata about a repository entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStat {
    /// Size in bytes; zero for directories.
    pub size: u64,
    /// File or directory.
    pub kind: EntryKind,
    /// Last modification time, when the backend tracks one.
    pub modified: Option<SystemTime>,
}

impl EntryStat {
    /// Returns `true` if the entry is a directory.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// How an opened write stream treats existing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteMode {
    /// Replace the file content.
    #[default]
    Truncate,
    /// Append to the file content.
    Append,
}

/// A write stream over one file entry.
///
/// Written bytes are only guaranteed to be visible after [`finish`](Self::finish).
#[async_trait]
pub trait WriteStream: Send {
    /// Writes a chunk of bytes.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Flushes and closes the stream.
    async fn finish(self: Box<Self>) -> Result<()>;
}

/// A storage backend for one repository.
#[async_trait]
pub trait Backend: Send + Sync {
    /// The kind of this backend.
    fn kind(&self) -> BackendKind;

    /// Returns metadata for an entry.
    async fn stat(&self, path: &EntryPath) -> Result<EntryStat>;

    /// Opens a file for reading.
    async fn open_read(&self, path: &EntryPath) -> Result<ReadStream>;

    /// Opens a file for writing, creating it if needed.
    async fn open_write(&self, path: &EntryPath, mode: WriteMode) -> Result<Box<dyn WriteStream>>;

    /// Lists the names directly inside a directory, sorted.
    async fn list(&self, path: &EntryPath) -> Result<Vec<String>>;

    /// Creates a directory and any missing parents.
    async fn mkdir(&self, path: &EntryPath) -> Result<()>;
}
