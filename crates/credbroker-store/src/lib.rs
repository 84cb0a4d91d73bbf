//! # credbroker-store
//!
//! Versioned, audited persistence for credential stores and credential
//! libraries.
//!
//! Every mutation runs in one SQLite transaction that holds the
//! version-checked write and its oplog entry, so the audit trail and the data
//! can never disagree. Secret fields are sealed by a
//! [`KeyManager`](credbroker_kms::KeyManager) before the transaction opens
//! and are stored only as ciphertext.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  Repository  (stores, libraries, rewrap job) │
//! ├──────────────────────────────────────────────┤
//! │  FieldMask │ validation │ public_id │ Oplog  │
//! ├──────────────────────────────────────────────┤
//! │  Database (rusqlite WAL, immediate tx)       │
//! │  Migrations (versioned, transactional)       │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use credbroker_jobs::Scheduler;
//! use credbroker_kms::{Kms, StaticRootKey};
//! use credbroker_store::{Context, CredentialStore, Database, Repository, RepositoryConfig};
//!
//! let db = Database::open_and_migrate("data/credbroker.db").await?;
//! let kms = Kms::open("data/keyring.db", Arc::new(StaticRootKey::generate()?))?;
//! let scheduler = Scheduler::new();
//! let repo = Repository::new(db, Arc::new(kms), &scheduler, RepositoryConfig::default())?;
//!
//! let ctx = Context::background();
//! let store = repo
//!     .create_credential_store(&ctx, &CredentialStore::new("p_1234567890", "https://vault:8200", "s.token"))
//!     .await?;
//! ```

pub mod context;
pub mod db;
pub mod error;
pub mod field_mask;
pub mod migration;
pub mod models;
pub mod oplog;
pub mod options;
pub mod public_id;
pub mod repository;
pub mod validation;

// ── re-exports ───────────────────────────────────────────────────────

pub use context::Context;
pub use db::Database;
pub use error::{ErrorKind, StoreError, StoreResult};
pub use field_mask::{FieldMask, FieldSpec, UpdatePlan};
pub use models::{CredentialLibrary, CredentialStore, HttpMethod, LibraryFields, VaultClientConfig};
pub use oplog::{OpKind, Oplog, OplogEntry, ResourceType};
pub use options::{ListOptions, OptionValue, RepositoryConfig, StoreSettings};
pub use repository::{LIBRARY_FIELDS, REWRAP_JOB, Repository, STORE_FIELDS};
