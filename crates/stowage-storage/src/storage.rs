//! Storage root managing many repositories behind an LRU pool.

use crate::backend::BackendKind;
use crate::{RepoId, Repository, Result, StorageError, Template};
use lru::LruCache;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// Default number of repositories kept open.
pub const DEFAULT_POOL_SIZE: usize = 1024;

const KEYS_DIR: &str = "keys";
const REPOS_DIR: &str = "repos";
const SPOOL_DIR: &str = "tmp";
const ID_FILE: &str = "id";

/// Configuration for a [`Storage`] root.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory holding the node's keys and repositories.
    pub base_path: PathBuf,
    /// Maximum number of open repositories kept in memory.
    pub pool_size: usize,
    /// Backend used for every repository.
    pub backend: BackendKind,
}

impl StorageConfig {
    /// Configuration with default pool size and backend.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            pool_size: DEFAULT_POOL_SIZE,
            backend: BackendKind::default(),
        }
    }
}

/// Open repositories: the LRU pool plus every handle still alive elsewhere.
///
/// A repository evicted from the pool while a caller still holds it stays
/// reachable through `live`, so one path never has two open backends.
struct Pool {
    lru: LruCache<RepoId, Arc<Repository>>,
    live: HashMap<RepoId, Weak<Repository>>,
}

impl Pool {
    fn new(capacity: NonZeroUsize) -> Self {
        Self {
            lru: LruCache::new(capacity),
            live: HashMap::new(),
        }
    }

    fn get(&mut self, id: &RepoId) -> Option<Arc<Repository>> {
        if let Some(repo) = self.lru.get(id) {
            debug!(repo = %id, "repository served from pool");
            return Some(Arc::clone(repo));
        }

        let repo = self.live.get(id).and_then(Weak::upgrade)?;
        debug!(repo = %id, "repository revived from a live handle");
        self.insert(*id, Arc::clone(&repo));
        Some(repo)
    }

    fn insert(&mut self, id: RepoId, repo: Arc<Repository>) {
        self.live.insert(id, Arc::downgrade(&repo));
        if let Some((evicted, handle)) = self.lru.push(id, repo) {
            drop(handle);
            if evicted != id {
                debug!(repo = %evicted, "evicted repository from pool");
                self.live.retain(|_, handle| handle.strong_count() > 0);
            }
        }
    }
}

/// Manages all repositories below one base path.
///
/// Opened repositories are pooled: while a repository is in the pool every
/// `get` returns the same `Arc`. An evicted repository that is still in use
/// keeps being handed out; otherwise it is reopened from disk on the next
/// access.
pub struct Storage {
    base_path: PathBuf,
    backend: BackendKind,
    pool_size: NonZeroUsize,
    id: Uuid,
    pool: Mutex<Pool>,
}

impl Storage {
    /// Opens the storage root, creating its layout and persistent id.
    ///
    /// # Errors
    ///
    /// Fails if the layout cannot be created or the id file is unreadable.
    pub async fn open(config: StorageConfig) -> Result<Self> {
        let base_path = if config.base_path.is_absolute() {
            config.base_path
        } else {
            std::env::current_dir()?.join(config.base_path)
        };
        let pool_size = NonZeroUsize::new(config.pool_size).unwrap_or(NonZeroUsize::MIN);

        create_private_dir(&base_path.join(KEYS_DIR)).await?;
        create_private_dir(&base_path.join(REPOS_DIR)).await?;
        create_private_dir(&base_path.join(SPOOL_DIR)).await?;
        let id = load_or_create_id(&base_path.join(ID_FILE)).await?;

        info!(
            id = %id,
            path = %base_path.display(),
            pool_size = pool_size.get(),
            backend = ?config.backend,
            "initialized storage"
        );

        Ok(Self {
            base_path,
            backend: config.backend,
            pool_size,
            id,
            pool: Mutex::new(Pool::new(pool_size)),
        })
    }

    /// The persistent identity of this storage root.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The absolute base path.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Directory reserved for key material.
    #[must_use]
    pub fn keys_path(&self) -> PathBuf {
        self.base_path.join(KEYS_DIR)
    }

    /// Directory for transient spool files.
    #[must_use]
    pub fn spool_path(&self) -> PathBuf {
        self.base_path.join(SPOOL_DIR)
    }

    /// Creates an anonymous spool file that disappears once closed.
    ///
    /// # Errors
    ///
    /// Fails if the spool directory is not writable.
    pub async fn spool_file(&self) -> Result<std::fs::File> {
        let dir = self.spool_path();
        let file = tokio::task::spawn_blocking(move || tempfile::tempfile_in(dir))
            .await
            .map_err(std::io::Error::other)??;
        Ok(file)
    }

    /// The pool capacity.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool_size.get()
    }

    /// The on-disk path of the repository with `id`.
    #[must_use]
    pub fn path_for_repo(&self, id: &RepoId) -> PathBuf {
        self.base_path.join(REPOS_DIR).join(id.relative_path())
    }

    /// Number of repositories currently in the pool.
    pub async fn pooled(&self) -> usize {
        self.pool.lock().await.lru.len()
    }

    /// Whether `id` currently sits in the pool. Does not touch its recency.
    pub async fn is_pooled(&self, id: &RepoId) -> bool {
        self.pool.lock().await.lru.contains(id)
    }

    /// Returns the repository with `id`, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Fails if the repository exists but cannot be opened.
    pub async fn get(&self, id: &RepoId) -> Result<Option<Arc<Repository>>> {
        let mut pool = self.pool.lock().await;
        if let Some(repo) = pool.get(id) {
            return Ok(Some(repo));
        }

        let path = self.path_for_repo(id);
        if !tokio::fs::try_exists(&path).await? {
            debug!(repo = %id, path = %path.display(), "repository does not exist");
            return Ok(None);
        }

        let repo = Arc::new(Repository::open(&path, self.backend).await?);
        pool.insert(*id, Arc::clone(&repo));
        Ok(Some(repo))
    }

    /// Creates a repository with a fresh id, optionally populated from
    /// `template`.
    ///
    /// The repository only enters the pool once population has succeeded;
    /// on failure its directory is removed again.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::RepoExists`] if the generated path is taken,
    /// or the population error.
    pub async fn create(&self, template: Option<Template>) -> Result<(RepoId, Arc<Repository>)> {
        let name = Uuid::new_v4().to_string();
        let id = RepoId::from_uuid(Uuid::new_v5(&self.id, name.as_bytes()));
        let path = self.path_for_repo(&id);

        if tokio::fs::try_exists(&path).await? {
            return Err(StorageError::RepoExists {
                id: id.to_string(),
                path,
            });
        }

        let repo = Repository::open(&path, self.backend).await?;
        if let Some(template) = template {
            if let Err(e) = repo.populate(template).await {
                warn!(repo = %id, error = %e, "populating new repository failed");
                drop(repo);
                if let Err(cleanup) = tokio::fs::remove_dir_all(&path).await {
                    warn!(repo = %id, error = %cleanup, "failed to remove unpopulated repository");
                }
                return Err(e);
            }
        }

        let repo = Arc::new(repo);
        self.pool.lock().await.insert(id, Arc::clone(&repo));
        info!(repo = %id, "created repository");
        Ok((id, repo))
    }

    /// Returns the repository with `id`, creating an empty one at exactly
    /// that id if it does not exist yet.
    ///
    /// Used for content received from peers, which keeps its original id.
    ///
    /// # Errors
    ///
    /// Fails if the repository cannot be opened or created.
    pub async fn adopt(&self, id: &RepoId) -> Result<Arc<Repository>> {
        let mut pool = self.pool.lock().await;
        if let Some(repo) = pool.get(id) {
            return Ok(repo);
        }

        let path = self.path_for_repo(id);
        let existed = tokio::fs::try_exists(&path).await?;
        let repo = Arc::new(Repository::open(&path, self.backend).await?);
        pool.insert(*id, Arc::clone(&repo));

        if !existed {
            info!(repo = %id, "adopted repository");
        }
        Ok(repo)
    }

    /// Lists the ids of all repositories on disk, sorted.
    ///
    /// # Errors
    ///
    /// Fails if the repository tree cannot be read.
    pub async fn ids(&self) -> Result<Vec<RepoId>> {
        let root = self.base_path.join(REPOS_DIR);
        tokio::task::spawn_blocking(move || scan_ids(&root))
            .await
            .map_err(std::io::Error::other)?
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("id", &self.id)
            .field("base_path", &self.base_path)
            .field("pool_size", &self.pool_size)
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

async fn create_private_dir(path: &Path) -> Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(path).await?;
    Ok(())
}

async fn load_or_create_id(path: &Path) -> Result<Uuid> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Uuid::parse_str(raw.trim())
            .map_err(|e| StorageError::Corruption(format!("storage id file {}: {e}", path.display()))),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let id = Uuid::new_v4();
            tokio::fs::write(path, id.to_string()).await?;
            Ok(id)
        }
        Err(e) => Err(e.into()),
    }
}

fn scan_ids(root: &Path) -> Result<Vec<RepoId>> {
    let mut ids = Vec::new();

    for entry in WalkDir::new(root).min_depth(3).max_depth(3) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable repository entry");
                continue;
            }
        };
        if !entry.file_type().is_dir() {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        match name.parse::<RepoId>() {
            Ok(id) if entry.path().ends_with(id.relative_path()) => ids.push(id),
            _ => debug!(path = %entry.path().display(), "ignoring foreign directory in repository tree"),
        }
    }

    ids.sort();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use tempfile::TempDir;

    async fn open(dir: &TempDir, pool_size: usize) -> Storage {
        Storage::open(StorageConfig {
            base_path: dir.path().to_path_buf(),
            pool_size,
            backend: BackendKind::Filesystem,
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn creates_layout_and_keeps_id() {
        let dir = TempDir::new().unwrap();
        let first = open(&dir, 4).await.id();

        assert!(dir.path().join("keys").is_dir());
        assert!(dir.path().join("repos").is_dir());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(dir.path().join("keys")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }

        let second = open(&dir, 4).await.id();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn get_unknown_returns_none() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, 4).await;
        let id = RepoId::from_uuid(Uuid::new_v4());
        assert!(storage.get(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn created_ids_are_unique_and_listed() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, 16).await;

        let mut created = Vec::new();
        for _ in 0..10 {
            let (id, repo) = storage.create(None).await.unwrap();
            assert_eq!(repo.storage_path(), storage.path_for_repo(&id));
            created.push(id);
        }

        let unique: HashSet<_> = created.iter().collect();
        assert_eq!(unique.len(), created.len());

        created.sort();
        assert_eq!(storage.ids().await.unwrap(), created);
    }

    #[tokio::test]
    async fn pooled_repository_is_shared() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, 4).await;

        let (id, created) = storage.create(None).await.unwrap();
        let fetched = storage.get(&id).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&created, &fetched));
    }

    #[tokio::test]
    async fn eviction_reopens_from_disk() {
        let dir = TempDir::new().unwrap();
        let pool_size = 3;
        let storage = open(&dir, pool_size).await;

        let (first_id, first) = storage.create(None).await.unwrap();
        first.write_all("kept.txt", b"still here").await.unwrap();
        let first_path = first.storage_path().to_path_buf();
        drop(first);
        for _ in 0..pool_size {
            storage.create(None).await.unwrap();
        }
        assert_eq!(storage.pooled().await, pool_size);
        assert!(!storage.is_pooled(&first_id).await);

        let reopened = storage.get(&first_id).await.unwrap().unwrap();
        assert_eq!(reopened.storage_path(), first_path.as_path());
        assert_eq!(reopened.read_all("kept.txt").await.unwrap(), b"still here");
        assert_eq!(storage.pooled().await, pool_size);
    }

    #[tokio::test]
    async fn get_refreshes_recency() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, 3).await;

        let (r1, first) = storage.create(None).await.unwrap();
        let (r2, _) = storage.create(None).await.unwrap();
        let (r3, _) = storage.create(None).await.unwrap();

        let touched = storage.get(&r1).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &touched));
        let (r4, _) = storage.create(None).await.unwrap();

        assert!(storage.is_pooled(&r1).await);
        assert!(!storage.is_pooled(&r2).await);
        assert!(storage.is_pooled(&r3).await);
        assert!(storage.is_pooled(&r4).await);
        let pooled = storage.get(&r1).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &pooled));
    }

    #[tokio::test]
    async fn evicted_handle_in_use_is_shared_with_reopen() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(StorageConfig {
            base_path: dir.path().to_path_buf(),
            pool_size: 1,
            backend: BackendKind::Log,
        })
        .await
        .unwrap();

        let (id, held) = storage.create(None).await.unwrap();
        storage.create(None).await.unwrap();
        assert!(!storage.is_pooled(&id).await);

        let reopened = storage.get(&id).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&held, &reopened));
        assert!(storage.is_pooled(&id).await);

        held.write_all("x", b"111").await.unwrap();
        reopened.write_all("y", b"22222").await.unwrap();
        assert_eq!(reopened.read_all("y").await.unwrap(), b"22222");
        assert_eq!(held.read_all("x").await.unwrap(), b"111");

        drop((held, reopened));
        storage.create(None).await.unwrap();
        let fresh = storage.get(&id).await.unwrap().unwrap();
        assert_eq!(fresh.read_all("x").await.unwrap(), b"111");
        assert_eq!(fresh.read_all("y").await.unwrap(), b"22222");
    }

    #[tokio::test]
    async fn spool_files_live_under_base() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, 4).await;
        assert!(storage.spool_path().starts_with(dir.path()));

        let mut spool = storage.spool_file().await.unwrap();
        std::io::Write::write_all(&mut spool, b"scratch").unwrap();
        assert!(storage.ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_template_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, 4).await;

        let template = Template::from_fn(|repo| {
            async move {
                repo.write_all("partial", b"x").await.unwrap();
                Err(StorageError::Corruption("template failed".into()))
            }
            .boxed()
        });

        assert!(storage.create(Some(template)).await.is_err());
        assert!(storage.ids().await.unwrap().is_empty());
        assert_eq!(storage.pooled().await, 0);
    }

    #[tokio::test]
    async fn adopt_keeps_remote_id() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir, 4).await;
        let id: RepoId = "6ba7b810-9dad-11d1-80b4-00c04fd430c8".parse().unwrap();

        let adopted = storage.adopt(&id).await.unwrap();
        adopted.write_all("blob", b"remote").await.unwrap();

        let again = storage.adopt(&id).await.unwrap();
        assert!(Arc::ptr_eq(&adopted, &again));
        assert_eq!(storage.ids().await.unwrap(), vec![id]);
    }
}
