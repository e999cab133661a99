//! A single repository: a tree of files and directories on one backend.

use crate::backend::{Backend, BackendKind, EntryStat, ReadStream, WriteMode, WriteStream};
use crate::{EntryPath, Result, StorageError};
use futures::future::BoxFuture;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;
use walkdir::WalkDir;

/// Chunk size used when copying template files into a repository.
const COPY_CHUNK: usize = 64 * 1024;

/// A populate callback run against a freshly created repository.
pub type PopulateFn = Box<dyn for<'a> FnOnce(&'a Repository) -> BoxFuture<'a, Result<()>> + Send>;

/// Initial content for a new repository.
pub enum Template {
    /// Copy a local directory tree into the repository.
    Directory(PathBuf),
    /// Run a callback that writes the content itself.
    Populate(PopulateFn),
}

impl Template {
    /// Template that copies the directory at `path`.
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self::Directory(path.into())
    }

    /// Template that runs `f` against the new repository.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: for<'a> FnOnce(&'a Repository) -> BoxFuture<'a, Result<()>> + Send + 'static,
    {
        Self::Populate(Box::new(f))
    }
}

impl std::fmt::Debug for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Directory(path) => f.debug_tuple("Directory").field(path).finish(),
            Self::Populate(_) => f.write_str("Populate(..)"),
        }
    }
}

/// A repository of named entries.
///
/// All names are resolved against the repository root with
/// [`EntryPath::resolve`], so `a/./b` and `/a/b` name the same entry and
/// nothing outside the root can be reached.
///
/// Whole-tree snapshots and replacements are serialized through
/// [`lock_shared`](Self::lock_shared) and
/// [`lock_exclusive`](Self::lock_exclusive); single entry operations do not
/// take the lock.
pub struct Repository {
    storage_path: PathBuf,
    backend: Box<dyn Backend>,
    tree: RwLock<()>,
}

impl Repository {
    /// Opens the repository stored at `storage_path`, creating the
    /// directory if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be opened.
    pub async fn open(storage_path: impl AsRef<Path>, kind: BackendKind) -> Result<Self> {
        let storage_path = storage_path.as_ref().to_path_buf();
        let backend = kind.open(&storage_path).await?;
        debug!(path = %storage_path.display(), backend = ?kind, "opened repository");
        Ok(Self {
            storage_path,
            backend,
            tree: RwLock::new(()),
        })
    }

    /// Where the repository lives on disk.
    #[must_use]
    pub fn storage_path(&self) -> &Path {
        &self.storage_path
    }

    /// The backend kind holding the repository.
    #[must_use]
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Waits until no tree replacement is running and blocks new ones while
    /// the guard lives.
    pub async fn lock_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.tree.read().await
    }

    /// Waits for every snapshot to finish and keeps new ones out while the
    /// guard lives.
    pub async fn lock_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.tree.write().await
    }

    /// Returns metadata for an entry.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the entry does not exist.
    pub async fn stat(&self, name: &str) -> Result<EntryStat> {
        self.backend.stat(&EntryPath::resolve(name)?).await
    }

    /// Guesses the MIME type of an entry from its name.
    #[must_use]
    pub fn content_type(name: &str) -> Option<mime_guess::Mime> {
        mime_guess::from_path(name).first()
    }

    /// Returns the size of an entry in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the entry does not exist.
    pub async fn size(&self, name: &str) -> Result<u64> {
        Ok(self.stat(name).await?.size)
    }

    /// Opens a file for reading.
    ///
    /// # Errors
    ///
    /// Fails if the entry is missing or a directory.
    pub async fn open_read(&self, name: &str) -> Result<ReadStream> {
        self.backend.open_read(&EntryPath::resolve(name)?).await
    }

    /// Opens a file for writing. The parent directory must exist on the
    /// filesystem backend.
    ///
    /// # Errors
    ///
    /// Fails if the entry is a directory or cannot be created.
    pub async fn open_write(&self, name: &str, mode: WriteMode) -> Result<Box<dyn WriteStream>> {
        self.backend.open_write(&EntryPath::resolve(name)?, mode).await
    }

    /// Lists the entries of a directory, sorted by name.
    ///
    /// # Errors
    ///
    /// Fails if the entry is missing or not a directory.
    pub async fn list(&self, name: &str) -> Result<Vec<String>> {
        self.backend.list(&EntryPath::resolve(name)?).await
    }

    /// Creates a directory and its missing parents.
    ///
    /// # Errors
    ///
    /// Fails if a file is in the way.
    pub async fn mkdir(&self, name: &str) -> Result<()> {
        self.backend.mkdir(&EntryPath::resolve(name)?).await
    }

    /// Replaces the content of `name` with `data`, creating parents.
    ///
    /// # Errors
    ///
    /// Fails if the entry cannot be written.
    pub async fn write_all(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = EntryPath::resolve(name)?;
        if let Some(parent) = path.parent().filter(|p| !p.is_root()) {
            self.backend.mkdir(&parent).await?;
        }

        let mut stream = self.backend.open_write(&path, WriteMode::Truncate).await?;
        stream.write(data).await?;
        stream.finish().await
    }

    /// Reads the whole content of `name`.
    ///
    /// # Errors
    ///
    /// Fails if the entry is missing or a directory.
    pub async fn read_all(&self, name: &str) -> Result<Vec<u8>> {
        let mut stream = self.open_read(name).await?;
        let mut data = Vec::new();
        stream.read_to_end(&mut data).await?;
        Ok(data)
    }

    /// Fills the repository from `template`.
    ///
    /// Returns the number of entries written for a directory template.
    ///
    /// # Errors
    ///
    /// Returns the first error hit while copying or the callback's error.
    pub async fn populate(&self, template: Template) -> Result<usize> {
        match template {
            Template::Directory(source) => self.copy_directory(source).await,
            Template::Populate(callback) => {
                callback(self).await?;
                Ok(0)
            }
        }
    }

    async fn copy_directory(&self, source: PathBuf) -> Result<usize> {
        let walk_root = source.clone();
        let entries = tokio::task::spawn_blocking(move || collect_tree(&walk_root))
            .await
            .map_err(std::io::Error::other)??;

        let mut copied = 0;
        for (name, kind) in entries {
            match kind {
                TreeEntry::Dir => self.mkdir(&name).await?,
                TreeEntry::File(path) => {
                    let mut source = tokio::fs::File::open(&path).await?;
                    let mut sink = self.open_write(&name, WriteMode::Truncate).await?;
                    let mut buf = vec![0u8; COPY_CHUNK];
                    loop {
                        let n = source.read(&mut buf).await?;
                        if n == 0 {
                            break;
                        }
                        sink.write(&buf[..n]).await?;
                    }
                    sink.finish().await?;
                }
            }
            copied += 1;
        }

        debug!(
            source = %source.display(),
            repo = %self.storage_path.display(),
            entries = copied,
            "populated repository from directory"
        );
        Ok(copied)
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("storage_path", &self.storage_path)
            .field("backend", &self.backend.kind())
            .finish()
    }
}

enum TreeEntry {
    Dir,
    File(PathBuf),
}

/// Walks `root` parents-first, returning `/`-joined relative names.
fn collect_tree(root: &Path) -> Result<Vec<(String, TreeEntry)>> {
    let mut entries = Vec::new();

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            StorageError::Io(
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
            )
        })?;

        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let file_type = entry.file_type();
        if file_type.is_dir() {
            entries.push((name, TreeEntry::Dir));
        } else if file_type.is_file() {
            entries.push((name, TreeEntry::File(entry.into_path())));
        } else {
            debug!(path = %entry.path().display(), "skipping unsupported template entry");
        }
    }

    Ok(entries)
}
