//! In-memory sync store for testing.

use crate::sync::{SyncReader, SyncStore, WriteTarget};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

#[derive(Default)]
struct Inner {
    repos: BTreeMap<String, Vec<u8>>,
    aborted: Vec<String>,
    failing_reads: HashSet<String>,
    failing_writes: HashSet<String>,
}

/// A [`SyncStore`] keeping every repository as one byte blob in memory.
#[derive(Clone, Default)]
pub struct MemorySyncStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemorySyncStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` under `id`.
    pub fn insert(&self, id: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.inner.write().repos.insert(id.into(), data.into());
    }

    /// Returns the content stored under `id`.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Vec<u8>> {
        self.inner.read().repos.get(id).cloned()
    }

    /// Returns all stored repositories.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.inner.read().repos.clone()
    }

    /// Ids whose incoming transfers were aborted, in order.
    #[must_use]
    pub fn aborted(&self) -> Vec<String> {
        self.inner.read().aborted.clone()
    }

    /// Makes reading `id` fail after it was opened.
    pub fn fail_reads(&self, id: impl Into<String>) {
        self.inner.write().failing_reads.insert(id.into());
    }

    /// Makes writing to `id` fail.
    pub fn fail_writes(&self, id: impl Into<String>) {
        self.inner.write().failing_writes.insert(id.into());
    }
}

#[async_trait]
impl SyncStore for MemorySyncStore {
    async fn ids(&self) -> io::Result<Vec<String>> {
        Ok(self.inner.read().repos.keys().cloned().collect())
    }

    async fn read_open(&self, id: &str) -> io::Result<SyncReader> {
        let inner = self.inner.read();
        if inner.failing_reads.contains(id) {
            return Ok(Box::pin(FailingReader));
        }
        let data = inner
            .repos
            .get(id)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, id.to_string()))?;
        Ok(Box::pin(io::Cursor::new(data)))
    }

    async fn write_open(&self, id: &str) -> io::Result<Box<dyn WriteTarget>> {
        let fail = self.inner.read().failing_writes.contains(id);
        Ok(Box::new(MemoryTarget {
            store: self.clone(),
            id: id.to_string(),
            buffer: Vec::new(),
            fail,
        }))
    }
}

struct MemoryTarget {
    store: MemorySyncStore,
    id: String,
    buffer: Vec<u8>,
    fail: bool,
}

#[async_trait]
impl WriteTarget for MemoryTarget {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.fail {
            return Err(io::Error::other("injected write failure"));
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> io::Result<()> {
        let Self { store, id, buffer, .. } = *self;
        store.insert(id, buffer);
        Ok(())
    }

    async fn abort(self: Box<Self>) {
        self.store.inner.write().aborted.push(self.id);
    }
}

struct FailingReader;

impl AsyncRead for FailingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::other("injected read failure")))
    }
}
