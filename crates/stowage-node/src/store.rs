//! [`SyncStore`] over the node's [`Storage`].
//!
//! Each repository travels as one tar archive. Both directions go through
//! an anonymous spool file under the storage's `tmp/` directory: the sender
//! packs a snapshot into one on `read_open` and streams it out, the receiver
//! appends incoming chunks to one and unpacks it into the repository with
//! the sender's id once END_ID arrives. Repository locks are only held while
//! a spool file is written or extracted, never while waiting on the peer.

use async_trait::async_trait;
use std::io::{self, BufReader, BufWriter, SeekFrom};
use std::sync::Arc;
use stowage_protocol::{SyncReader, SyncStore, WriteTarget};
use stowage_storage::{pack, unpack, RepoId, Storage, StorageError};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

fn to_io(e: StorageError) -> io::Error {
    match e {
        StorageError::Io(e) => e,
        StorageError::NotFound(what) => io::Error::new(io::ErrorKind::NotFound, what),
        other => io::Error::other(other),
    }
}

fn parse_id(id: &str) -> io::Result<RepoId> {
    id.parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid repository id {id:?}"),
        )
    })
}

/// Exposes a [`Storage`] to the sync protocol.
#[derive(Debug, Clone)]
pub struct StorageSyncStore {
    storage: Arc<Storage>,
    max_transfer_bytes: u64,
}

impl StorageSyncStore {
    /// Wraps `storage`, accepting archives of any size.
    #[must_use]
    pub fn new(storage: Arc<Storage>) -> Self {
        Self::with_limit(storage, u64::MAX)
    }

    /// Wraps `storage`, refusing received archives larger than
    /// `max_transfer_bytes`.
    #[must_use]
    pub fn with_limit(storage: Arc<Storage>, max_transfer_bytes: u64) -> Self {
        Self {
            storage,
            max_transfer_bytes,
        }
    }

    /// The wrapped storage.
    #[must_use]
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }
}

#[async_trait]
impl SyncStore for StorageSyncStore {
    async fn ids(&self) -> io::Result<Vec<String>> {
        let ids = self.storage.ids().await.map_err(to_io)?;
        Ok(ids.iter().map(ToString::to_string).collect())
    }

    async fn read_open(&self, id: &str) -> io::Result<SyncReader> {
        let repo_id = parse_id(id)?;
        let repo = self
            .storage
            .get(&repo_id)
            .await
            .map_err(to_io)?
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("repository {id}")))?;

        let spool = self.storage.spool_file().await.map_err(to_io)?;
        let spool = pack(repo, BufWriter::new(spool))
            .await
            .map_err(to_io)?
            .into_inner()
            .map_err(io::IntoInnerError::into_error)?;

        let mut archive = File::from_std(spool);
        let bytes = archive.seek(SeekFrom::End(0)).await?;
        archive.seek(SeekFrom::Start(0)).await?;
        debug!(repo = %repo_id, bytes, "packed repository for sync");
        Ok(Box::pin(archive))
    }

    async fn write_open(&self, id: &str) -> io::Result<Box<dyn WriteTarget>> {
        let id = parse_id(id)?;
        let spool = self.storage.spool_file().await.map_err(to_io)?;
        Ok(Box::new(ArchiveTarget {
            storage: Arc::clone(&self.storage),
            id,
            spool: File::from_std(spool),
            received: 0,
            limit: self.max_transfer_bytes,
        }))
    }
}

/// Receives one repository archive into a spool file.
struct ArchiveTarget {
    storage: Arc<Storage>,
    id: RepoId,
    spool: File,
    received: u64,
    limit: u64,
}

#[async_trait]
impl WriteTarget for ArchiveTarget {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let received = self.received.saturating_add(data.len() as u64);
        if received > self.limit {
            warn!(repo = %self.id, limit = self.limit, "archive exceeds transfer limit");
            return Err(io::Error::other(format!(
                "repository {} exceeds the transfer limit of {} bytes",
                self.id, self.limit
            )));
        }
        self.spool.write_all(data).await?;
        self.received = received;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> io::Result<()> {
        let Self {
            storage,
            id,
            mut spool,
            received,
            ..
        } = *self;

        spool.flush().await?;
        spool.seek(SeekFrom::Start(0)).await?;
        let archive = BufReader::new(spool.into_std().await);

        let repo = storage.adopt(&id).await.map_err(to_io)?;
        let entries = unpack(repo, archive).await.map_err(to_io)?;
        info!(repo = %id, bytes = received, entries, "stored replicated repository");
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        debug!(repo = %self.id, received = self.received, "dropped incomplete repository");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use stowage_storage::StorageConfig;
    use tokio::io::AsyncReadExt;

    async fn storage(dir: &tempfile::TempDir) -> Arc<Storage> {
        Arc::new(Storage::open(StorageConfig::new(dir.path())).await.unwrap())
    }

    async fn read_to_end(mut reader: SyncReader) -> Vec<u8> {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn copies_repository_between_storages() {
        let (src_dir, dst_dir) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let source = StorageSyncStore::new(storage(&src_dir).await);
        let dest = StorageSyncStore::new(storage(&dst_dir).await);

        let (id, repo) = source.storage().create(None).await.unwrap();
        repo.write_all("docs/readme.txt", b"hello").await.unwrap();

        let ids = source.ids().await.unwrap();
        assert_eq!(ids, vec![id.to_string()]);

        let archive = read_to_end(source.read_open(&ids[0]).await.unwrap()).await;
        let mut target = dest.write_open(&ids[0]).await.unwrap();
        for chunk in archive.chunks(100) {
            target.write(chunk).await.unwrap();
        }
        target.commit().await.unwrap();

        let copy = dest.storage().get(&id).await.unwrap().unwrap();
        let content = copy.read_all("docs/readme.txt").await.unwrap();
        assert_eq!(content, b"hello".to_vec());
        assert_eq!(dest.ids().await.unwrap(), ids);
    }

    #[tokio::test]
    async fn unknown_repository_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = StorageSyncStore::new(storage(&dir).await);

        let missing = fixed_id();
        let err = match store.read_open(&missing.to_string()).await {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn invalid_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = StorageSyncStore::new(storage(&dir).await);

        let err = match store.write_open("../../etc").await {
            Ok(_) => panic!("expected an error"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn aborted_transfer_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = StorageSyncStore::new(storage(&dir).await);
        let id = fixed_id();

        let mut target = store.write_open(&id.to_string()).await.unwrap();
        target.write(b"partial").await.unwrap();
        target.abort().await;

        assert!(store.storage().get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_archive_fails_commit() {
        let dir = tempfile::tempdir().unwrap();
        let store = StorageSyncStore::new(storage(&dir).await);
        let id = fixed_id();

        let mut target = store.write_open(&id.to_string()).await.unwrap();
        target.write(&[0xAB; 700]).await.unwrap();
        assert!(target.commit().await.is_err());
    }

    #[tokio::test]
    async fn large_repository_streams_through_spool_files() {
        let (src_dir, dst_dir) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let source = StorageSyncStore::new(storage(&src_dir).await);
        let dest = StorageSyncStore::new(storage(&dst_dir).await);

        let data: Vec<u8> = (0..3_000_000u32).map(|i| (i % 251) as u8).collect();
        let (id, repo) = source.storage().create(None).await.unwrap();
        repo.write_all("blob.bin", &data).await.unwrap();
        repo.write_all("small", b"x").await.unwrap();

        let mut reader = source.read_open(&id.to_string()).await.unwrap();
        let mut target = dest.write_open(&id.to_string()).await.unwrap();
        let mut chunk = vec![0u8; 16 * 1024];
        loop {
            let n = reader.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            target.write(&chunk[..n]).await.unwrap();
        }
        drop(reader);
        target.commit().await.unwrap();

        let copy = dest.storage().get(&id).await.unwrap().unwrap();
        assert_eq!(copy.read_all("blob.bin").await.unwrap(), data);
        assert_eq!(copy.read_all("small").await.unwrap(), b"x");

        for store in [&source, &dest] {
            let leftovers = std::fs::read_dir(store.storage().spool_path()).unwrap().count();
            assert_eq!(leftovers, 0);
        }
    }

    #[tokio::test]
    async fn oversized_archive_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = StorageSyncStore::with_limit(storage(&dir).await, 1000);
        let id = fixed_id();

        let mut target = store.write_open(&id.to_string()).await.unwrap();
        target.write(&[0u8; 600]).await.unwrap();
        let err = target.write(&[0u8; 600]).await.unwrap_err();
        assert!(err.to_string().contains("transfer limit"));
        target.abort().await;

        assert!(store.storage().get(&id).await.unwrap().is_none());
    }

    fn fixed_id() -> RepoId {
        "01234567-89ab-cdef-0123-456789abcdef".parse().unwrap()
    }
}
