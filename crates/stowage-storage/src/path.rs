//! Entry names inside a repository.

use crate::{Result, StorageError};
use std::fmt;

/// A normalized, root-relative entry name.
///
/// Names are `/`-separated. Empty and `.` segments are dropped and `..`
/// pops a segment; popping past the root is rejected. The root itself is
/// the empty path.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryPath(String);

impl EntryPath {
    /// The repository root.
    #[must_use]
    pub const fn root() -> Self {
        Self(String::new())
    }

    /// Normalizes `name` against the repository root.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidPath`] if the name escapes the root or
    /// contains a NUL byte.
    pub fn resolve(name: &str) -> Result<Self> {
        if name.contains('\0') {
            return Err(StorageError::InvalidPath(name.escape_default().to_string()));
        }

        let mut segments: Vec<&str> = Vec::new();
        for segment in name.split(['/', '\\']) {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(StorageError::InvalidPath(name.to_string()));
                    }
                }
                other => segments.push(other),
            }
        }

        Ok(Self(segments.join("/")))
    }

    /// Returns `true` for the repository root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the normalized name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the parent entry, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        Some(match self.0.rfind('/') {
            Some(idx) => Self(self.0[..idx].to_string()),
            None => Self::root(),
        })
    }

    /// Returns the last segment of the name.
    #[must_use]
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// Appends a single segment.
    #[must_use]
    pub fn join(&self, segment: &str) -> Self {
        if self.is_root() {
            Self(segment.to_string())
        } else {
            Self(format!("{}/{segment}", self.0))
        }
    }

    /// Iterates over all proper ancestors, outermost first, excluding the root.
    pub fn ancestors(&self) -> impl Iterator<Item = EntryPath> + '_ {
        self.0
            .match_indices('/')
            .map(move |(idx, _)| Self(self.0[..idx].to_string()))
    }

    /// Iterates over the segments of the name.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }
}

impl fmt::Display for EntryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            f.write_str("/")
        } else {
            f.write_str(&self.0)
        }
    }
}

impl fmt::Debug for EntryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryPath({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalizes_redundant_segments() {
        assert_eq!(EntryPath::resolve("/a//./b/").unwrap().as_str(), "a/b");
        assert_eq!(EntryPath::resolve("a/b/../c").unwrap().as_str(), "a/c");
        assert!(EntryPath::resolve("").unwrap().is_root());
        assert!(EntryPath::resolve("/").unwrap().is_root());
        assert!(EntryPath::resolve("a/..").unwrap().is_root());
    }

    #[test]
    fn rejects_escape_from_root() {
        assert!(matches!(
            EntryPath::resolve("../secret"),
            Err(StorageError::InvalidPath(_))
        ));
        assert!(matches!(
            EntryPath::resolve("a/../../b"),
            Err(StorageError::InvalidPath(_))
        ));
        assert!(EntryPath::resolve("a\0b").is_err());
    }

    #[test]
    fn parent_and_ancestors() {
        let path = EntryPath::resolve("x/y/z").unwrap();
        assert_eq!(path.parent().unwrap().as_str(), "x/y");
        assert_eq!(path.file_name(), "z");

        let ancestors: Vec<String> = path.ancestors().map(|p| p.as_str().to_string()).collect();
        assert_eq!(ancestors, vec!["x".to_string(), "x/y".to_string()]);

        assert!(EntryPath::resolve("top").unwrap().parent().unwrap().is_root());
        assert!(EntryPath::root().parent().is_none());
    }
}
