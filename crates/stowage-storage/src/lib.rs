//! Repository storage for Stowage.
//!
//! A [`Storage`] owns every [`Repository`] of a node under one base
//! directory:
//!
//! ```text
//! <base>/id                                 node storage identity (UUID)
//! <base>/keys/                              node key material
//! <base>/tmp/                               anonymous spool files of transfers
//! <base>/repos/<id[0:2]>/<id[2:4]>/<id>/    one repository per id
//! ```
//!
//! Open repository handles are kept in a bounded LRU pool; evicted
//! repositories stay on disk and are reopened lazily. Each repository sits
//! on a [`Backend`]: either the plain filesystem or an append-only log.

mod archive;
mod backend;
mod error;
mod id;
mod path;
mod repository;
mod storage;

pub use archive::{pack, unpack};
pub use backend::{Backend, BackendKind, EntryKind, EntryStat, ReadStream, WriteMode, WriteStream};
pub use error::{Result, StorageError};
pub use id::RepoId;
pub use path::EntryPath;
pub use repository::{PopulateFn, Repository, Template};
pub use storage::{Storage, StorageConfig, DEFAULT_POOL_SIZE};
