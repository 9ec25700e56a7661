//! File-based master key provider for `KasaDB`.
//!
//! The key file holds the 32-byte master key as hex on a single line. It is
//! suitable for development and single-host deployments; production setups
//! usually fetch the key from a secret manager instead.

#![warn(clippy::pedantic, clippy::nursery)]

use kasadb::error::KeyProviderError;
use kasadb::key_provider::MasterKeyProvider;
use kasadb::keys::{MasterKey, KEY_SIZE};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Master key provider reading a hex key file.
///
/// ```text
/// master.key   (64 hex characters, 0600 permissions)
/// ```
#[derive(Debug, Clone)]
pub struct FileKeyProvider {
    path: PathBuf,
}

impl FileKeyProvider {
    /// Creates a provider for an existing key file.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::NotFound` if the file does not exist.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, KeyProviderError> {
        let path = path.into();
        if !path.is_file() {
            return Err(KeyProviderError::NotFound(path.display().to_string()));
        }
        Ok(Self { path })
    }

    /// Writes a fresh random master key to `path` and returns its provider.
    ///
    /// An existing file is never overwritten.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::CreationFailed` if the file already exists,
    /// or `KeyProviderError::Io` if it cannot be written.
    pub fn init(path: impl Into<PathBuf>) -> Result<Self, KeyProviderError> {
        let path = path.into();

        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        OsRng.fill_bytes(&mut key[..]);
        let encoded = Zeroizing::new(hex::encode(&key[..]));

        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&path).map_err(|err| match err.kind() {
            ErrorKind::AlreadyExists => {
                KeyProviderError::CreationFailed(format!("key file already exists: {}", path.display()))
            }
            _ => KeyProviderError::Io(err),
        })?;
        file.write_all(encoded.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;

        Ok(Self { path })
    }

    /// Returns the key file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MasterKeyProvider for FileKeyProvider {
    fn master_key(&self) -> Result<MasterKey, KeyProviderError> {
        let contents = Zeroizing::new(fs::read_to_string(&self.path).map_err(|err| match err.kind() {
            ErrorKind::NotFound => KeyProviderError::NotFound(self.path.display().to_string()),
            _ => KeyProviderError::Io(err),
        })?);

        let bytes = hex::decode(contents.trim())
            .map_err(|e| KeyProviderError::InvalidKey(format!("key file is not hex: {e}")))?;
        MasterKey::from_bytes(bytes).map_err(|e| KeyProviderError::InvalidKey(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_then_read() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("master.key");

        let provider = FileKeyProvider::init(&path).unwrap();
        assert!(provider.master_key().is_ok());

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim().len(), KEY_SIZE * 2);

        let reopened = FileKeyProvider::new(&path).unwrap();
        assert!(reopened.master_key().is_ok());
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("master.key");

        FileKeyProvider::init(&path).unwrap();
        let before = fs::read_to_string(&path).unwrap();

        assert!(matches!(FileKeyProvider::init(&path), Err(KeyProviderError::CreationFailed(_))));
        assert_eq!(fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let result = FileKeyProvider::new(dir.path().join("absent.key"));
        assert!(matches!(result, Err(KeyProviderError::NotFound(_))));
    }

    #[test]
    fn test_invalid_contents() {
        let dir = TempDir::new().expect("Failed to create temp dir");

        let not_hex = dir.path().join("not-hex.key");
        fs::write(&not_hex, "zz".repeat(32)).unwrap();
        let result = FileKeyProvider::new(&not_hex).unwrap().master_key();
        assert!(matches!(result, Err(KeyProviderError::InvalidKey(_))));

        let short = dir.path().join("short.key");
        fs::write(&short, hex::encode([1u8; 16])).unwrap();
        let result = FileKeyProvider::new(&short).unwrap().master_key();
        assert!(matches!(result, Err(KeyProviderError::InvalidKey(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("master.key");
        FileKeyProvider::init(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
