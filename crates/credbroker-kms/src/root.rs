//! Root key providers.
//!
//! The root key wraps every per-scope data key and is the only key material
//! that lives outside the keyring database. A [`RootKeyProvider`] resolves
//! it on demand:
//!
//! - [`StaticRootKey`] holds the key in memory (tests, or a key injected via
//!   an environment variable as base64).
//! - [`FileRootKey`] reads the key from a file, generating it with owner-only
//!   permissions the first time.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use zeroize::Zeroizing;

use crate::crypto;
use crate::error::{KmsError, Result};

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Abstraction over where the root key comes from.
pub trait RootKeyProvider: Send + Sync {
    /// Resolve the 256-bit root key.
    ///
    /// Returns [`KmsError::RootKeyUnavailable`] if it cannot be produced.
    fn root_key(&self) -> Result<Zeroizing<Vec<u8>>>;
}

// ---------------------------------------------------------------------------
// Static
// ---------------------------------------------------------------------------

/// A root key held in memory.
pub struct StaticRootKey {
    key: Zeroizing<Vec<u8>>,
}

impl StaticRootKey {
    /// Use `key` (exactly [`crypto::KEY_LEN`] bytes) as the root key.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != crypto::KEY_LEN {
            return Err(KmsError::RootKeyUnavailable {
                reason: format!("root key must be {} bytes, got {}", crypto::KEY_LEN, key.len()),
            });
        }
        Ok(Self {
            key: Zeroizing::new(key.to_vec()),
        })
    }

    /// Decode a base64 root key.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = Zeroizing::new(BASE64.decode(encoded.trim()).map_err(|e| {
            KmsError::RootKeyUnavailable {
                reason: format!("root key is not valid base64: {e}"),
            }
        })?);
        Self::new(&bytes)
    }

    /// Generate a random root key (tests and throwaway deployments).
    pub fn generate() -> Result<Self> {
        let key = crypto::random_bytes(crypto::KEY_LEN)?;
        Ok(Self { key })
    }
}

impl RootKeyProvider for StaticRootKey {
    fn root_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        Ok(self.key.clone())
    }
}

// ---------------------------------------------------------------------------
// File-based
// ---------------------------------------------------------------------------

/// Root key stored as raw bytes in a file readable only by its owner.
pub struct FileRootKey {
    key_file: PathBuf,
}

impl FileRootKey {
    /// Create a provider backed by `key_file`. The file is created lazily.
    pub fn new(key_file: impl Into<PathBuf>) -> Self {
        Self {
            key_file: key_file.into(),
        }
    }

    /// Default key file location: `<dir>/root.key`.
    pub fn default_path(dir: &Path) -> PathBuf {
        dir.join("root.key")
    }

    fn read(&self) -> Result<Zeroizing<Vec<u8>>> {
        let data = Zeroizing::new(std::fs::read(&self.key_file)?);
        if data.len() != crypto::KEY_LEN {
            return Err(KmsError::RootKeyUnavailable {
                reason: format!(
                    "root key file {} holds {} bytes, expected {}",
                    self.key_file.display(),
                    data.len(),
                    crypto::KEY_LEN
                ),
            });
        }
        tracing::debug!(path = %self.key_file.display(), "read root key file");
        Ok(data)
    }

    fn create(&self) -> Result<Zeroizing<Vec<u8>>> {
        let key = crypto::random_bytes(crypto::KEY_LEN)?;

        if let Some(parent) = self.key_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.key_file, key.as_slice())?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.key_file, perms)?;
        }

        tracing::info!(path = %self.key_file.display(), "generated root key file");
        Ok(key)
    }
}

impl RootKeyProvider for FileRootKey {
    fn root_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        if self.key_file.exists() {
            self.read()
        } else {
            self.create()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_key_rejects_wrong_length() {
        assert!(matches!(
            StaticRootKey::new(&[0u8; 16]),
            Err(KmsError::RootKeyUnavailable { .. })
        ));
    }

    #[test]
    fn static_key_from_base64() {
        let encoded = BASE64.encode([7u8; 32]);
        let provider = StaticRootKey::from_base64(&encoded).unwrap();
        assert_eq!(provider.root_key().unwrap().as_slice(), &[7u8; 32]);

        assert!(StaticRootKey::from_base64("not base64!").is_err());
    }

    #[test]
    fn file_key_is_created_once_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileRootKey::new(FileRootKey::default_path(dir.path()));

        let first = provider.root_key().unwrap();
        let second = provider.root_key().unwrap();
        assert_eq!(first.len(), crypto::KEY_LEN);
        assert_eq!(first.as_slice(), second.as_slice());
    }

    #[cfg(unix)]
    #[test]
    fn file_key_has_owner_only_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("root.key");
        FileRootKey::new(&path).root_key().unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn corrupted_file_key_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("root.key");
        std::fs::write(&path, b"short").unwrap();

        let result = FileRootKey::new(&path).root_key();
        assert!(matches!(result, Err(KmsError::RootKeyUnavailable { .. })));
    }
}
