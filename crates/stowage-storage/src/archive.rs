//! Tar snapshots of repository content.
//!
//! Repositories travel between nodes as a single tar stream: one directory
//! entry per directory and one regular entry per file, parents first. Both
//! directions stream entry by entry, so memory use does not grow with the
//! repository.

use crate::backend::{EntryKind, WriteMode};
use crate::{EntryPath, Repository, Result, StorageError};
use std::io::{self, Read, Write};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::io::SyncIoBridge;
use tracing::debug;

const CHUNK: usize = 64 * 1024;

enum Item {
    Dir(String),
    File(String, u64),
}

/// Writes a tar snapshot of `repo` into `out` and hands `out` back.
///
/// The repository is held shared for the whole snapshot, so a concurrent
/// [`unpack`] cannot tear it.
///
/// # Errors
///
/// Fails if an entry cannot be read or `out` cannot be written.
pub async fn pack<W>(repo: Arc<Repository>, out: W) -> Result<W>
where
    W: Write + Send + 'static,
{
    let _snapshot = repo.lock_shared().await;
    let items = collect(&repo).await?;
    let entries = items.len();

    let handle = Handle::current();
    let source = Arc::clone(&repo);
    let out = tokio::task::spawn_blocking(move || build(&handle, &source, items, out))
        .await
        .map_err(io::Error::other)??;

    debug!(repo = %repo.storage_path().display(), entries, "packed repository");
    Ok(out)
}

async fn collect(repo: &Repository) -> Result<Vec<Item>> {
    let mut items = Vec::new();
    let mut pending = vec![EntryPath::root()];

    while let Some(dir) = pending.pop() {
        for name in repo.list(dir.as_str()).await? {
            let path = dir.join(&name);
            let stat = repo.stat(path.as_str()).await?;
            match stat.kind {
                EntryKind::Directory => {
                    items.push(Item::Dir(path.as_str().to_string()));
                    pending.push(path);
                }
                EntryKind::File => items.push(Item::File(path.as_str().to_string(), stat.size)),
            }
        }
    }

    Ok(items)
}

fn build<W: Write>(handle: &Handle, repo: &Repository, items: Vec<Item>, out: W) -> Result<W> {
    let mut builder = tar::Builder::new(out);

    for item in items {
        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        match item {
            Item::Dir(name) => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder.append_data(&mut header, name, io::empty())?;
            }
            Item::File(name, size) => {
                let stream = handle.block_on(repo.open_read(&name))?;
                let mut content = SyncIoBridge::new_with_handle(stream, handle.clone()).take(size);

                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                header.set_size(size);
                builder.append_data(&mut header, &name, &mut content)?;

                if content.limit() > 0 {
                    return Err(StorageError::Corruption(format!(
                        "{name} shrank while being packed"
                    )));
                }
            }
        }
    }

    Ok(builder.into_inner()?)
}

/// Extracts a tar archive produced by [`pack`] from `input` into `repo`.
///
/// Existing files with the same names are replaced. Entries that are
/// neither directories nor regular files are skipped. Returns the number of
/// entries written. The repository is held exclusively while extracting.
///
/// # Errors
///
/// Returns [`StorageError::Archive`] for a malformed archive, or the error
/// of the first failed write.
pub async fn unpack<R>(repo: Arc<Repository>, input: R) -> Result<usize>
where
    R: Read + Send + 'static,
{
    let _replacing = repo.lock_exclusive().await;

    let handle = Handle::current();
    let target = Arc::clone(&repo);
    let count = tokio::task::spawn_blocking(move || extract(&handle, &target, input))
        .await
        .map_err(io::Error::other)??;

    debug!(repo = %repo.storage_path().display(), entries = count, "unpacked archive");
    Ok(count)
}

fn extract<R: Read>(handle: &Handle, repo: &Repository, input: R) -> Result<usize> {
    let malformed = |e: io::Error| StorageError::Archive(e.to_string());
    let mut archive = tar::Archive::new(input);
    let mut buf = vec![0u8; CHUNK];
    let mut count = 0;

    for entry in archive.entries().map_err(malformed)? {
        let mut entry = entry.map_err(malformed)?;
        let raw_path = entry.path().map_err(malformed)?.to_string_lossy().into_owned();
        let path = EntryPath::resolve(&raw_path)?;
        if path.is_root() {
            continue;
        }

        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            handle.block_on(repo.mkdir(path.as_str()))?;
        } else if entry_type.is_file() {
            if let Some(parent) = path.parent().filter(|p| !p.is_root()) {
                handle.block_on(repo.mkdir(parent.as_str()))?;
            }
            let mut sink = handle.block_on(repo.open_write(path.as_str(), WriteMode::Truncate))?;
            loop {
                let n = entry.read(&mut buf).map_err(malformed)?;
                if n == 0 {
                    break;
                }
                handle.block_on(sink.write(&buf[..n]))?;
            }
            handle.block_on(sink.finish())?;
        } else {
            debug!(path = %raw_path, "skipping unsupported archive entry");
            continue;
        }
        count += 1;
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BackendKind;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn open(dir: &TempDir, name: &str, kind: BackendKind) -> Arc<Repository> {
        Arc::new(Repository::open(dir.path().join(name), kind).await.unwrap())
    }

    #[tokio::test]
    async fn transfers_tree_between_backends() {
        let dir = TempDir::new().unwrap();
        let source = open(&dir, "fs", BackendKind::Filesystem).await;
        source.write_all("a", b"hello").await.unwrap();
        source.write_all("b", b"").await.unwrap();
        source.write_all("deep/nested/c", &[3u8; 1000]).await.unwrap();
        source.mkdir("empty").await.unwrap();

        let archive = pack(Arc::clone(&source), Vec::new()).await.unwrap();

        let target = open(&dir, "log", BackendKind::Log).await;
        assert_eq!(unpack(Arc::clone(&target), Cursor::new(archive)).await.unwrap(), 6);

        assert_eq!(target.list("/").await.unwrap(), vec!["a", "b", "deep", "empty"]);
        assert_eq!(target.read_all("a").await.unwrap(), b"hello");
        assert_eq!(target.size("b").await.unwrap(), 0);
        assert_eq!(target.read_all("deep/nested/c").await.unwrap(), vec![3u8; 1000]);
        assert!(target.stat("empty").await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn large_files_and_long_names_survive() {
        let dir = TempDir::new().unwrap();
        let source = open(&dir, "src", BackendKind::Log).await;
        let long_name = format!("{}/blob.bin", "segment".repeat(30));
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
        source.write_all(&long_name, &data).await.unwrap();

        let archive = pack(Arc::clone(&source), Vec::new()).await.unwrap();
        let target = open(&dir, "dst", BackendKind::Filesystem).await;
        unpack(Arc::clone(&target), Cursor::new(archive)).await.unwrap();

        assert_eq!(target.read_all(&long_name).await.unwrap(), data);
    }

    #[tokio::test]
    async fn rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let repo = open(&dir, "repo", BackendKind::Log).await;
        let garbage = Cursor::new(vec![0xAB; 1024]);
        assert!(unpack(repo, garbage).await.is_err());
    }

    #[tokio::test]
    async fn snapshot_waits_for_replacement() {
        let dir = TempDir::new().unwrap();
        let repo = open(&dir, "repo", BackendKind::Filesystem).await;
        repo.write_all("file", b"old").await.unwrap();

        let replacing = repo.lock_exclusive().await;
        let mut snapshot = tokio::spawn(pack(Arc::clone(&repo), Vec::new()));
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut snapshot)
            .await
            .is_err());

        repo.write_all("file", b"new content").await.unwrap();
        drop(replacing);

        let archive = snapshot.await.unwrap().unwrap();
        let copy = open(&dir, "copy", BackendKind::Log).await;
        unpack(Arc::clone(&copy), Cursor::new(archive)).await.unwrap();
        assert_eq!(copy.read_all("file").await.unwrap(), b"new content");
    }

    #[tokio::test]
    async fn replacement_waits_for_snapshot() {
        let dir = TempDir::new().unwrap();
        let repo = open(&dir, "repo", BackendKind::Filesystem).await;

        let snapshot = repo.lock_shared().await;
        let mut archive = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut archive);
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(4);
            header.set_mode(0o644);
            builder.append_data(&mut header, "file", &b"data"[..]).unwrap();
            builder.finish().unwrap();
        }
        let mut replacement = tokio::spawn(unpack(Arc::clone(&repo), Cursor::new(archive)));
        assert!(tokio::time::timeout(Duration::from_millis(50), &mut replacement)
            .await
            .is_err());
        assert!(repo.stat("file").await.is_err());

        drop(snapshot);
        assert_eq!(replacement.await.unwrap().unwrap(), 1);
        assert_eq!(repo.read_all("file").await.unwrap(), b"data");
    }
}
