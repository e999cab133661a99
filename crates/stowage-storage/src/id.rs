//! Repository identifiers.

use crate::{Result, StorageError};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a repository within a [`Storage`](crate::Storage).
///
/// Always a UUID, which keeps the id safe to use as a path component when
/// it arrives from a remote peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoId(Uuid);

impl RepoId {
    /// Wraps an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Returns the path of this repository relative to the repos directory:
    /// `<id[0:2]>/<id[2:4]>/<id>`.
    #[must_use]
    pub fn relative_path(&self) -> std::path::PathBuf {
        let id = self.to_string();
        [&id[0..2], &id[2..4], id.as_str()].iter().collect()
    }
}

impl FromStr for RepoId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| StorageError::InvalidId(format!("{s}: {e}")))
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl fmt::Debug for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RepoId({})", self.0.hyphenated())
    }
}
