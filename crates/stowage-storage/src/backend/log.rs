//! Append-only log backend.
//!
//! All mutations of a repository are appended as records to a single
//! `entries.log` file inside the repository directory:
//!
//! ```text
//! [op u8][path_len u16 BE][path][data_len u32 BE][data]
//! ```
//!
//! `op` is `MKDIR`, `PUT` (replace file content) or `APPEND`. Parent
//! directories of a written path are implicit. The in-memory index is rebuilt
//! by replaying the log on open; a partially written final record is cut off.

use super::{Backend, BackendKind, EntryKind, EntryStat, ReadStream, WriteMode, WriteStream};
use crate::{EntryPath, Result, StorageError};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, BufReader, Read, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

/// Name of the record file inside the repository directory.
pub const LOG_FILE: &str = "entries.log";

const PREFIX_LEN: u64 = 3;
const DATA_LEN_LEN: u64 = 4;

/// Largest chunk a reader pulls from the log at once.
const READ_CHUNK: u64 = 64 * 1024;

/// Largest record a writer appends at once.
const WRITE_CHUNK: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Op {
    Mkdir = 1,
    Put = 2,
    Append = 3,
}

impl Op {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Mkdir),
            2 => Some(Self::Put),
            3 => Some(Self::Append),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Extent {
    offset: u64,
    len: u64,
}

#[derive(Debug)]
enum Node {
    Dir,
    File(Vec<Extent>),
}

/// Path index rebuilt from the log. The root is stored under the empty key.
#[derive(Debug)]
struct Index {
    entries: BTreeMap<String, Node>,
}

impl Default for Index {
    fn default() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(String::new(), Node::Dir);
        Self { entries }
    }
}

impl Index {
    fn get(&self, path: &EntryPath) -> Option<&Node> {
        self.entries.get(path.as_str())
    }

    fn apply(&mut self, op: Op, path: &EntryPath, extent: Extent) {
        for ancestor in path.ancestors() {
            self.entries
                .entry(ancestor.as_str().to_string())
                .or_insert(Node::Dir);
        }

        let key = path.as_str().to_string();
        let extents = || {
            if extent.len > 0 {
                vec![extent]
            } else {
                Vec::new()
            }
        };

        match op {
            Op::Mkdir => {
                self.entries.entry(key).or_insert(Node::Dir);
            }
            Op::Put => {
                self.entries.insert(key, Node::File(extents()));
            }
            Op::Append => match self.entries.entry(key).or_insert_with(|| Node::File(Vec::new())) {
                Node::File(existing) => existing.extend(extents()),
                Node::Dir => {}
            },
        }
    }

    fn children(&self, path: &EntryPath) -> Vec<String> {
        if path.is_root() {
            return self
                .entries
                .keys()
                .filter(|k| !k.is_empty() && !k.contains('/'))
                .cloned()
                .collect();
        }

        let prefix = format!("{}/", path.as_str());
        self.entries
            .range(prefix.clone()..)
            .map(|(k, _)| k)
            .take_while(|k| k.starts_with(&prefix))
            .filter_map(|k| {
                let rest = &k[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    /// Rejects a write below an existing file.
    fn check_ancestors(&self, path: &EntryPath) -> Result<()> {
        for ancestor in path.ancestors() {
            if let Some(Node::File(_)) = self.get(&ancestor) {
                return Err(StorageError::NotADirectory(ancestor.to_string()));
            }
        }
        Ok(())
    }

    fn check_writable(&self, path: &EntryPath) -> Result<()> {
        if path.is_root() || matches!(self.get(path), Some(Node::Dir)) {
            return Err(StorageError::IsADirectory(path.to_string()));
        }
        self.check_ancestors(path)
    }
}

struct Record {
    op: Op,
    path: EntryPath,
    data_offset: u64,
    data_len: u64,
}

/// Reads the record at `offset`, or `None` if the log ends or breaks there.
fn read_record<R: Read + io::Seek>(
    reader: &mut BufReader<R>,
    offset: u64,
    file_len: u64,
) -> io::Result<Option<Record>> {
    let remaining = file_len - offset;
    if remaining < PREFIX_LEN {
        return Ok(None);
    }

    let mut prefix = [0u8; 3];
    reader.read_exact(&mut prefix)?;
    let Some(op) = Op::from_u8(prefix[0]) else {
        return Ok(None);
    };
    let path_len = u64::from(u16::from_be_bytes([prefix[1], prefix[2]]));
    if remaining < PREFIX_LEN + path_len + DATA_LEN_LEN {
        return Ok(None);
    }

    let mut raw_path = vec![0u8; path_len as usize];
    reader.read_exact(&mut raw_path)?;
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let data_len = u64::from(u32::from_be_bytes(len));

    let data_offset = offset + PREFIX_LEN + path_len + DATA_LEN_LEN;
    if data_offset + data_len > file_len {
        return Ok(None);
    }
    reader.seek_relative(data_len as i64)?;

    let Some(path) = String::from_utf8(raw_path)
        .ok()
        .and_then(|p| EntryPath::resolve(&p).ok())
    else {
        return Ok(None);
    };

    Ok(Some(Record {
        op,
        path,
        data_offset,
        data_len,
    }))
}

/// Replays the log, returning the index, the length of the intact prefix and
/// the length of the file.
fn replay(log_path: &Path) -> io::Result<(Index, u64, u64)> {
    let file = match std::fs::File::open(log_path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Index::default(), 0, 0)),
        Err(e) => return Err(e),
    };

    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut index = Index::default();
    let mut offset = 0u64;
    let mut records = 0usize;

    while let Some(record) = read_record(&mut reader, offset, file_len)? {
        index.apply(
            record.op,
            &record.path,
            Extent {
                offset: record.data_offset,
                len: record.data_len,
            },
        );
        offset = record.data_offset + record.data_len;
        records += 1;
    }

    debug!(path = %log_path.display(), records, "replayed repository log");
    Ok((index, offset, file_len))
}

struct LogState {
    file: File,
    len: u64,
    index: Index,
}

impl LogState {
    async fn append(&mut self, op: Op, path: &EntryPath, data: &[u8]) -> Result<()> {
        let raw_path = path.as_str().as_bytes();
        let path_len = u16::try_from(raw_path.len())
            .map_err(|_| StorageError::InvalidPath(path.to_string()))?;
        let data_len = u32::try_from(data.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "record data exceeds 4 GiB")
        })?;

        let mut record = BytesMut::with_capacity(7 + raw_path.len() + data.len());
        record.put_u8(op as u8);
        record.put_u16(path_len);
        record.put_slice(raw_path);
        record.put_u32(data_len);
        record.put_slice(data);

        let data_offset = self.len + PREFIX_LEN + u64::from(path_len) + DATA_LEN_LEN;

        let written = async {
            self.file.write_all(&record).await?;
            self.file.flush().await
        }
        .await;

        if let Err(e) = written {
            // Drop whatever part of the record made it to disk.
            if let Err(rollback) = self.file.set_len(self.len).await {
                warn!(error = %rollback, "failed to roll back partial log record");
            }
            return Err(e.into());
        }

        self.index.apply(
            op,
            path,
            Extent {
                offset: data_offset,
                len: u64::from(data_len),
            },
        );
        self.len += record.len() as u64;
        Ok(())
    }
}

/// Streams the bytes of `extents` in order from a dedicated handle.
///
/// Indexed extents are never rewritten, so reading needs no state lock.
fn extent_reader(file: File, extents: Vec<Extent>) -> ReadStream {
    let chunks = futures::stream::try_unfold((file, VecDeque::from(extents)), |(file, extents)| {
        next_chunk(file, extents)
    });
    Box::new(StreamReader::new(Box::pin(chunks)))
}

async fn next_chunk(
    mut file: File,
    mut extents: VecDeque<Extent>,
) -> io::Result<Option<(Bytes, (File, VecDeque<Extent>))>> {
    let Some(extent) = extents.front_mut() else {
        return Ok(None);
    };

    let len = extent.len.min(READ_CHUNK);
    let mut chunk = vec![0u8; len as usize];
    file.seek(SeekFrom::Start(extent.offset)).await?;
    file.read_exact(&mut chunk).await?;

    extent.offset += len;
    extent.len -= len;
    if extent.len == 0 {
        extents.pop_front();
    }
    Ok(Some((Bytes::from(chunk), (file, extents))))
}

struct LogShared {
    log_path: PathBuf,
    state: Mutex<LogState>,
}

/// Backend storing a repository as one append-only record log.
pub struct LogBackend {
    shared: Arc<LogShared>,
}

impl LogBackend {
    /// Opens the log inside `root`, replaying existing records.
    pub async fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root).await?;
        let log_path = root.join(LOG_FILE);

        let scan_path = log_path.clone();
        let (index, valid_len, file_len) = tokio::task::spawn_blocking(move || replay(&scan_path))
            .await
            .map_err(io::Error::other)??;

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&log_path)
            .await?;

        if valid_len < file_len {
            warn!(
                path = %log_path.display(),
                valid_len,
                file_len,
                "truncating incomplete tail of repository log"
            );
            file.set_len(valid_len).await?;
        }

        Ok(Self {
            shared: Arc::new(LogShared {
                log_path,
                state: Mutex::new(LogState {
                    file,
                    len: valid_len,
                    index,
                }),
            }),
        })
    }
}

impl std::fmt::Debug for LogBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBackend")
            .field("log_path", &self.shared.log_path)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Backend for LogBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Log
    }

    async fn stat(&self, path: &EntryPath) -> Result<EntryStat> {
        let state = self.shared.state.lock().await;
        match state.index.get(path) {
            Some(Node::Dir) => Ok(EntryStat {
                size: 0,
                kind: EntryKind::Directory,
                modified: None,
            }),
            Some(Node::File(extents)) => Ok(EntryStat {
                size: extents.iter().map(|e| e.len).sum(),
                kind: EntryKind::File,
                modified: None,
            }),
            None => Err(StorageError::NotFound(path.to_string())),
        }
    }

    async fn open_read(&self, path: &EntryPath) -> Result<ReadStream> {
        let extents = match self.shared.state.lock().await.index.get(path) {
            Some(Node::File(extents)) => extents.clone(),
            Some(Node::Dir) => return Err(StorageError::IsADirectory(path.to_string())),
            None => return Err(StorageError::NotFound(path.to_string())),
        };

        let file = File::open(&self.shared.log_path).await?;
        Ok(extent_reader(file, extents))
    }

    async fn open_write(&self, path: &EntryPath, mode: WriteMode) -> Result<Box<dyn WriteStream>> {
        self.shared.state.lock().await.index.check_writable(path)?;

        let op = match mode {
            WriteMode::Truncate => Op::Put,
            WriteMode::Append => Op::Append,
        };
        Ok(Box::new(LogWriter {
            shared: Arc::clone(&self.shared),
            path: path.clone(),
            op,
            started: false,
            buffer: Vec::new(),
        }))
    }

    async fn list(&self, path: &EntryPath) -> Result<Vec<String>> {
        let state = self.shared.state.lock().await;
        match state.index.get(path) {
            Some(Node::Dir) => Ok(state.index.children(path)),
            Some(Node::File(_)) => Err(StorageError::NotADirectory(path.to_string())),
            None => Err(StorageError::NotFound(path.to_string())),
        }
    }

    async fn mkdir(&self, path: &EntryPath) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        match state.index.get(path) {
            Some(Node::Dir) => return Ok(()),
            Some(Node::File(_)) => return Err(StorageError::NotADirectory(path.to_string())),
            None => {}
        }
        state.index.check_ancestors(path)?;
        state.append(Op::Mkdir, path, &[]).await
    }
}

/// Collects written bytes into records of at most [`WRITE_CHUNK`] bytes.
///
/// The first record carries the open mode; every later one appends.
struct LogWriter {
    shared: Arc<LogShared>,
    path: EntryPath,
    op: Op,
    started: bool,
    buffer: Vec<u8>,
}

impl LogWriter {
    async fn flush(&mut self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        state.index.check_writable(&self.path)?;
        state.append(self.op, &self.path, &self.buffer).await?;

        self.buffer.clear();
        self.op = Op::Append;
        self.started = true;
        Ok(())
    }
}

#[async_trait]
impl WriteStream for LogWriter {
    async fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let take = (WRITE_CHUNK - self.buffer.len()).min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buffer.len() == WRITE_CHUNK {
                self.flush().await?;
            }
        }
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        let mut writer = self;
        if !writer.started || !writer.buffer.is_empty() {
            writer.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn path(name: &str) -> EntryPath {
        EntryPath::resolve(name).unwrap()
    }

    async fn put(backend: &LogBackend, name: &str, mode: WriteMode, data: &[u8]) {
        let mut writer = backend.open_write(&path(name), mode).await.unwrap();
        writer.write(data).await.unwrap();
        writer.finish().await.unwrap();
    }

    async fn read(backend: &LogBackend, name: &str) -> Vec<u8> {
        let mut stream = backend.open_read(&path(name)).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn write_append_and_read() {
        let dir = TempDir::new().unwrap();
        let backend = LogBackend::open(dir.path()).await.unwrap();

        put(&backend, "docs/readme", WriteMode::Truncate, b"hello").await;
        put(&backend, "docs/readme", WriteMode::Append, b" world").await;

        assert_eq!(read(&backend, "docs/readme").await, b"hello world");
        assert_eq!(backend.stat(&path("docs/readme")).await.unwrap().size, 11);
        assert!(backend.stat(&path("docs")).await.unwrap().is_dir());

        put(&backend, "docs/readme", WriteMode::Truncate, b"bye").await;
        assert_eq!(read(&backend, "docs/readme").await, b"bye");
    }

    #[tokio::test]
    async fn replays_after_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let backend = LogBackend::open(dir.path()).await.unwrap();
            backend.mkdir(&path("empty/nested")).await.unwrap();
            put(&backend, "a", WriteMode::Truncate, b"one").await;
            put(&backend, "b/c", WriteMode::Truncate, b"").await;
        }

        let backend = LogBackend::open(dir.path()).await.unwrap();
        assert_eq!(backend.list(&EntryPath::root()).await.unwrap(), vec!["a", "b", "empty"]);
        assert_eq!(backend.list(&path("empty")).await.unwrap(), vec!["nested"]);
        assert_eq!(read(&backend, "a").await, b"one");
        assert_eq!(read(&backend, "b/c").await, b"");
    }

    #[tokio::test]
    async fn truncates_torn_tail() {
        let dir = TempDir::new().unwrap();
        {
            let backend = LogBackend::open(dir.path()).await.unwrap();
            put(&backend, "kept", WriteMode::Truncate, b"intact").await;
        }

        let log_path = dir.path().join(LOG_FILE);
        let intact_len = std::fs::metadata(&log_path).unwrap().len();
        let mut raw = std::fs::read(&log_path).unwrap();
        // A PUT record header that promises more data than follows.
        raw.extend_from_slice(&[2, 0, 4, b'l', b'o', b's', b't', 0, 0, 0, 9, b'x']);
        std::fs::write(&log_path, &raw).unwrap();

        let backend = LogBackend::open(dir.path()).await.unwrap();
        assert_eq!(read(&backend, "kept").await, b"intact");
        assert!(matches!(
            backend.stat(&path("lost")).await,
            Err(StorageError::NotFound(_))
        ));
        assert_eq!(std::fs::metadata(&log_path).unwrap().len(), intact_len);

        put(&backend, "after", WriteMode::Truncate, b"ok").await;
        drop(backend);
        let backend = LogBackend::open(dir.path()).await.unwrap();
        assert_eq!(read(&backend, "after").await, b"ok");
    }

    #[tokio::test]
    async fn large_writes_are_split_into_records() {
        let dir = TempDir::new().unwrap();
        let data: Vec<u8> = (0..WRITE_CHUNK * 5 / 2).map(|i| (i % 241) as u8).collect();
        {
            let backend = LogBackend::open(dir.path()).await.unwrap();
            put(&backend, "big", WriteMode::Truncate, &data).await;
            assert_eq!(read(&backend, "big").await, data);
        }

        // Three records, each with a 3 byte prefix, the path and a 4 byte length.
        let log_len = std::fs::metadata(dir.path().join(LOG_FILE)).unwrap().len();
        assert_eq!(log_len, data.len() as u64 + 3 * (3 + 3 + 4));

        let backend = LogBackend::open(dir.path()).await.unwrap();
        assert_eq!(read(&backend, "big").await, data);
        assert_eq!(backend.stat(&path("big")).await.unwrap().size, data.len() as u64);
    }

    #[tokio::test]
    async fn readers_see_a_stable_snapshot() {
        let dir = TempDir::new().unwrap();
        let backend = LogBackend::open(dir.path()).await.unwrap();
        put(&backend, "file", WriteMode::Truncate, b"before").await;

        let mut reader = backend.open_read(&path("file")).await.unwrap();
        put(&backend, "file", WriteMode::Truncate, b"after!").await;

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"before");
        assert_eq!(read(&backend, "file").await, b"after!");
    }

    #[tokio::test]
    async fn rejects_file_directory_conflicts() {
        let dir = TempDir::new().unwrap();
        let backend = LogBackend::open(dir.path()).await.unwrap();
        put(&backend, "file", WriteMode::Truncate, b"x").await;
        backend.mkdir(&path("dir")).await.unwrap();

        assert!(matches!(
            backend.mkdir(&path("file")).await,
            Err(StorageError::NotADirectory(_))
        ));
        assert!(matches!(
            backend.open_write(&path("file/child"), WriteMode::Truncate).await,
            Err(StorageError::NotADirectory(_))
        ));
        assert!(matches!(
            backend.open_write(&path("dir"), WriteMode::Truncate).await,
            Err(StorageError::IsADirectory(_))
        ));
        assert!(matches!(
            backend.list(&path("file")).await,
            Err(StorageError::NotADirectory(_))
        ));
    }
}
