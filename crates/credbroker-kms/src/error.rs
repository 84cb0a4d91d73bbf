//! Key management error types.
//!
//! All subsystems of the crate surface errors through [`KmsError`]. Callers
//! that only care whether a scope's key material could be resolved use
//! [`KmsError::is_key_unavailable`] instead of matching variants.

/// Unified error type for the credbroker key management service.
#[derive(Debug, thiserror::Error)]
pub enum KmsError {
    // -- Key resolution -----------------------------------------------------
    /// The scope has no keyring, or the referenced key version is missing or
    /// destroyed.
    #[error("key unavailable for scope {scope_id}: {reason}")]
    KeyUnavailable { scope_id: String, reason: String },

    /// The root key protecting every data key could not be resolved.
    #[error("root key unavailable: {reason}")]
    RootKeyUnavailable { reason: String },

    /// The current key version of a scope cannot be destroyed.
    #[error("key version {version} is the current version for scope {scope_id}")]
    KeyVersionInUse { scope_id: String, version: u32 },

    // -- Crypto errors ------------------------------------------------------
    /// Encryption failed (e.g. invalid key length, ring internal error).
    #[error("encryption failed: {reason}")]
    EncryptionFailed { reason: String },

    /// Decryption failed (wrong key, corrupted ciphertext, foreign scope).
    #[error("decryption failed: {reason}")]
    DecryptionFailed { reason: String },

    /// The ciphertext envelope could not be parsed.
    #[error("malformed ciphertext: {reason}")]
    MalformedCiphertext { reason: String },

    // -- Underlying errors --------------------------------------------------
    /// SQLite error from the keyring database.
    #[error("keyring database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error from the filesystem (root key file operations).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for unexpected internal errors.
    #[error("internal kms error: {0}")]
    Internal(String),
}

impl KmsError {
    /// Whether the failure means the protecting key could not be resolved.
    pub fn is_key_unavailable(&self) -> bool {
        matches!(
            self,
            Self::KeyUnavailable { .. } | Self::RootKeyUnavailable { .. }
        )
    }

    pub(crate) fn unavailable(scope_id: &str, reason: impl Into<String>) -> Self {
        Self::KeyUnavailable {
            scope_id: scope_id.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<tokio::task::JoinError> for KmsError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("blocking task failed: {err}"))
    }
}

/// Convenience alias used throughout the kms crate.
pub type Result<T> = std::result::Result<T, KmsError>;
