//! Envelope encryption for credbroker.
//!
//! Sensitive configuration fields are sealed with a per-scope data key.
//! Data keys are sealed with a root key and persisted in a SQLite keyring,
//! so rotating a scope's key only requires re-sealing ciphertext, never a
//! full decrypt-everything migration.
//!
//! # Modules
//!
//! - [`crypto`]: AES-256-GCM seal/open and secure random bytes.
//! - [`root`]: where the root key comes from (memory or a 0600 key file).
//! - [`keyring`]: SQLite table of wrapped data keys per scope and version.
//! - [`kms`]: the [`KeyManager`] contract and its [`Kms`] implementation.
//! - [`secret`]: [`SecretString`] for transient plaintext.
//! - [`error`]: unified error type.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use credbroker_kms::{KeyManager, Kms, StaticRootKey};
//!
//! # async fn example() -> credbroker_kms::Result<()> {
//! let kms = Kms::open("data/keyring.db", Arc::new(StaticRootKey::generate()?))?;
//! kms.create_scope_keys("p_1234567890").await?;
//!
//! let ciphertext = kms.encrypt("p_1234567890", b"s.vault-token").await?;
//! kms.rotate("p_1234567890").await?;
//! let rewrapped = kms.rewrap("p_1234567890", &ciphertext).await?;
//! assert_eq!(kms.key_version_of(&rewrapped)?, 2);
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod error;
pub mod keyring;
pub mod kms;
pub mod root;
pub mod secret;

pub use error::{KmsError, Result};
pub use keyring::{KeyState, KeyVersionInfo, Keyring};
pub use kms::{KeyManager, Kms};
pub use root::{FileRootKey, RootKeyProvider, StaticRootKey};
pub use secret::SecretString;
