//! Filesystem backend: the repository tree is a real directory tree.

use super::{Backend, BackendKind, EntryKind, EntryStat, ReadStream, WriteMode, WriteStream};
use crate::{EntryPath, Result, StorageError};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Backend storing entries as files below a root directory.
#[derive(Debug)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    /// Opens (and creates, if needed) a backend rooted at `root`.
    pub async fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).await?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn locate(&self, path: &EntryPath) -> PathBuf {
        let mut full = self.root.clone();
        full.extend(path.segments());
        full
    }
}

fn not_found(path: &EntryPath) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |e| match e.kind() {
        ErrorKind::NotFound | ErrorKind::PermissionDenied => {
            StorageError::NotFound(path.to_string())
        }
        _ => StorageError::Io(e),
    }
}

#[async_trait]
impl Backend for FsBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Filesystem
    }

    async fn stat(&self, path: &EntryPath) -> Result<EntryStat> {
        let meta = fs::metadata(self.locate(path)).await.map_err(not_found(path))?;
        let kind = if meta.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };

        Ok(EntryStat {
            size: if meta.is_dir() { 0 } else { meta.len() },
            kind,
            modified: meta.modified().ok(),
        })
    }

    async fn open_read(&self, path: &EntryPath) -> Result<ReadStream> {
        let full = self.locate(path);
        let meta = fs::metadata(&full).await.map_err(not_found(path))?;
        if meta.is_dir() {
            return Err(StorageError::IsADirectory(path.to_string()));
        }

        let file = File::open(&full).await.map_err(not_found(path))?;
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &EntryPath, mode: WriteMode) -> Result<Box<dyn WriteStream>> {
        if path.is_root() {
            return Err(StorageError::IsADirectory(path.to_string()));
        }

        let full = self.locate(path);
        if fs::metadata(&full).await.is_ok_and(|m| m.is_dir()) {
            return Err(StorageError::IsADirectory(path.to_string()));
        }

        let mut options = OpenOptions::new();
        options.create(true);
        match mode {
            WriteMode::Truncate => options.write(true).truncate(true),
            WriteMode::Append => options.append(true),
        };

        let file = options.open(&full).await.map_err(not_found(path))?;

        Ok(Box::new(FsWriter { file }))
    }

    async fn list(&self, path: &EntryPath) -> Result<Vec<String>> {
        let full = self.locate(path);
        let meta = fs::metadata(&full).await.map_err(not_found(path))?;
        if !meta.is_dir() {
            return Err(StorageError::NotADirectory(path.to_string()));
        }

        let mut names = Vec::new();
        let mut dir = fs::read_dir(&full).await?;
        while let Some(entry) = dir.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    async fn mkdir(&self, path: &EntryPath) -> Result<()> {
        let full = self.locate(path);
        if let Ok(meta) = fs::metadata(&full).await {
            if meta.is_dir() {
                return Ok(());
            }
            return Err(StorageError::NotADirectory(path.to_string()));
        }

        fs::create_dir_all(&full).await?;
        Ok(())
    }
}

struct FsWriter {
    file: File,
}

#[async_trait]
impl WriteStream for FsWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_data().await?;
        Ok(())
    }
}
