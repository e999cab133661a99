//! Persistence of the node keypair.

use crate::Result;
use std::path::{Path, PathBuf};
use stowage_identity::Keypair;
use tokio::io::AsyncWriteExt;
use tracing::info;
use zeroize::Zeroizing;

/// File name of the node secret key inside the keys directory.
pub const KEY_FILE: &str = "node.key";

/// Path of the key file inside `keys_dir`.
#[must_use]
pub fn key_path(keys_dir: &Path) -> PathBuf {
    keys_dir.join(KEY_FILE)
}

/// Loads the node keypair from `keys_dir`, generating and storing a new one
/// on first start.
///
/// The secret is stored hex encoded, readable only by the owner on Unix.
///
/// # Errors
///
/// Fails if the key file cannot be read or written, or holds an invalid key.
pub async fn load_or_generate(keys_dir: &Path) -> Result<Keypair> {
    let path = key_path(keys_dir);

    if tokio::fs::try_exists(&path).await? {
        let encoded = Zeroizing::new(tokio::fs::read_to_string(&path).await?);
        let keypair = Keypair::from_secret_hex(&encoded)?;
        info!(public_key = %keypair.public_key(), "loaded node key");
        return Ok(keypair);
    }

    let keypair = Keypair::generate();
    let encoded = Zeroizing::new(hex::encode(*keypair.secret_bytes()));

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(&path).await?;
    file.write_all(encoded.as_bytes()).await?;
    file.sync_all().await?;

    info!(public_key = %keypair.public_key(), path = %path.display(), "generated node key");
    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NodeError;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn generates_once_then_loads() {
        let dir = tempfile::tempdir().unwrap();

        let first = load_or_generate(dir.path()).await.unwrap();
        let second = load_or_generate(dir.path()).await.unwrap();
        assert_eq!(first.public_key(), second.public_key());

        let stored = std::fs::read_to_string(key_path(dir.path())).unwrap();
        assert_eq!(stored, hex::encode(*first.secret_bytes()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        load_or_generate(dir.path()).await.unwrap();

        let mode = std::fs::metadata(key_path(dir.path()))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn corrupt_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(key_path(dir.path()), "zz").unwrap();

        let err = load_or_generate(dir.path()).await.unwrap_err();
        assert!(matches!(err, NodeError::Identity(_)));
    }
}
