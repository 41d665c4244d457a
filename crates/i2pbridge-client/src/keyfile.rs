//! Private key files
//!
//! A keyfile holds the router's private key serialization verbatim. New
//! files are written to a temporary sibling first and then linked into
//! place, so readers never observe a partial key and an existing file is
//! never replaced.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;

use crate::error::{BridgeError, Result};

/// Contents of `path`, or `None` if it does not exist
pub async fn read_key(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents.trim().to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BridgeError::Keyfile(e)),
    }
}

/// Whether a keyfile already exists at `path`
pub async fn exists(path: &Path) -> Result<bool> {
    fs::try_exists(path).await.map_err(BridgeError::Keyfile)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("keyfile"));
    name.push(format!(".{}.tmp", std::process::id()));
    path.with_file_name(name)
}

/// Write `key` to a new file at `path`.
///
/// Fails with `KeyfileExists` instead of replacing an existing file.
pub async fn write_new(path: &Path, key: &str) -> Result<()> {
    let temp = temp_path(path);
    fs::write(&temp, key).await.map_err(BridgeError::Keyfile)?;

    let linked = fs::hard_link(&temp, path).await;
    let _ = fs::remove_file(&temp).await;

    match linked {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            Err(BridgeError::KeyfileExists(path.to_path_buf()))
        }
        Err(e) => Err(BridgeError::Keyfile(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spam.key");

        assert_eq!(read_key(&path).await.unwrap(), None);
        assert!(!exists(&path).await.unwrap());

        write_new(&path, "privkey~").await.unwrap();
        assert_eq!(read_key(&path).await.unwrap().as_deref(), Some("privkey~"));
        assert!(!temp_path(&path).exists());
    }

    #[tokio::test]
    async fn test_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spam.key");
        std::fs::write(&path, "original").unwrap();

        let err = write_new(&path, "replacement").await.unwrap_err();
        assert!(matches!(err, BridgeError::KeyfileExists(_)));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "original");
    }

    #[tokio::test]
    async fn test_trailing_newline_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("spam.key");
        std::fs::write(&path, "privkey~\n").unwrap();

        assert_eq!(read_key(&path).await.unwrap().as_deref(), Some("privkey~"));
    }
}
