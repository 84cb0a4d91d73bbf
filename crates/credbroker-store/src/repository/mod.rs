//! The credential repository.
//!
//! [`Repository`] is a stateless façade over the shared database. Each
//! mutating call validates its input, encrypts secret fields, then opens one
//! transaction that applies the version-checked write and appends the oplog
//! entry. Reads go straight to the database and never touch the oplog.
//!
//! - [`store`]: credential store operations, client config and rewrap.
//! - [`library`]: credential library operations.

mod library;
mod store;

use std::sync::Arc;

use credbroker_jobs::{Job, JobRegistry};
use credbroker_kms::KeyManager;
use rusqlite::Row;
use tracing::info;

use crate::context::Context;
use crate::db::Database;
use crate::error::{OpContext, StoreError, StoreResult};
use crate::models::{CredentialLibrary, CredentialStore, HttpMethod, LibraryFields, from_micros};
use crate::oplog::Oplog;
use crate::options::{ListOptions, RepositoryConfig, resolve_limit};

pub use library::LIBRARY_FIELDS;
pub use store::STORE_FIELDS;

/// Name of the recurring job that re-seals stored secrets under the
/// current key version of their scope.
pub const REWRAP_JOB: &str = "credential_store_rewrap";

/// Versioned, audited CRUD over credential stores and libraries.
///
/// Cheap to clone; clones share the database and key manager.
#[derive(Clone)]
pub struct Repository {
    db: Database,
    kms: Arc<dyn KeyManager>,
    config: RepositoryConfig,
}

impl Repository {
    /// Build a repository and register its recurring jobs with `jobs`.
    pub fn new(
        db: Database,
        kms: Arc<dyn KeyManager>,
        jobs: &dyn JobRegistry,
        config: RepositoryConfig,
    ) -> StoreResult<Self> {
        let repo = Self { db, kms, config };

        let job_repo = repo.clone();
        let job = Job::new(
            REWRAP_JOB,
            "re-seal credential store secrets under the current scope key",
            repo.config.rewrap_interval,
            move || {
                let repo = job_repo.clone();
                async move {
                    repo.rewrap_all_scopes(&Context::background())
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                }
            },
        );
        jobs.register_job(job).map_err(|source| StoreError::Jobs {
            op: "new_repository",
            source,
        })?;

        info!(
            default_limit = repo.config.default_limit,
            rewrap_interval_secs = repo.config.rewrap_interval.as_secs(),
            "credential repository ready"
        );
        Ok(repo)
    }

    /// Reader over the audit trail this repository writes.
    pub fn oplog(&self) -> Oplog {
        Oplog::new(self.db.clone())
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    fn limit(&self, opts: &ListOptions) -> i64 {
        resolve_limit(self.config.default_limit, opts)
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const STORE_COLUMNS: &str = "public_id, scope_id, name, description, vault_address, namespace, \
     ca_cert, tls_server_name, tls_skip_verify, ct_token, client_certificate, \
     ct_client_certificate_key, version, create_time, update_time";

const LIBRARY_COLUMNS: &str = "public_id, store_id, name, description, vault_path, http_method, \
     http_request_body, version, create_time, update_time";

/// A credential store row as persisted, ciphertext included.
struct StoreRow {
    public_id: String,
    scope_id: String,
    name: Option<String>,
    description: Option<String>,
    vault_address: String,
    namespace: Option<String>,
    ca_cert: Option<String>,
    tls_server_name: Option<String>,
    tls_skip_verify: bool,
    ct_token: Vec<u8>,
    client_certificate: Option<String>,
    ct_client_certificate_key: Option<Vec<u8>>,
    version: u32,
    create_time: i64,
    update_time: i64,
}

impl StoreRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            public_id: row.get(0)?,
            scope_id: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            vault_address: row.get(4)?,
            namespace: row.get(5)?,
            ca_cert: row.get(6)?,
            tls_server_name: row.get(7)?,
            tls_skip_verify: row.get(8)?,
            ct_token: row.get(9)?,
            client_certificate: row.get(10)?,
            ct_client_certificate_key: row.get(11)?,
            version: row.get(12)?,
            create_time: row.get(13)?,
            update_time: row.get(14)?,
        })
    }

    /// Snapshot without plaintext; ciphertext is reported by key version.
    fn to_store(&self, kms: &dyn KeyManager, op: &'static str) -> StoreResult<CredentialStore> {
        let token_key_version = kms.key_version_of(&self.ct_token).op_err(op)?;
        let key_version = self
            .ct_client_certificate_key
            .as_deref()
            .map(|ct| kms.key_version_of(ct))
            .transpose()
            .op_err(op)?;
        Ok(CredentialStore {
            public_id: self.public_id.clone(),
            scope_id: self.scope_id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            address: self.vault_address.clone(),
            namespace: self.namespace.clone(),
            ca_cert: self.ca_cert.clone(),
            tls_server_name: self.tls_server_name.clone(),
            tls_skip_verify: self.tls_skip_verify,
            client_certificate: self.client_certificate.clone(),
            token: None,
            client_certificate_key: None,
            token_key_version: Some(token_key_version),
            client_certificate_key_version: key_version,
            version: self.version,
            create_time: Some(from_micros(self.create_time)),
            update_time: Some(from_micros(self.update_time)),
        })
    }
}

/// A credential library row as persisted.
struct LibraryRow {
    public_id: String,
    store_id: String,
    name: Option<String>,
    description: Option<String>,
    vault_path: String,
    http_method: String,
    http_request_body: Option<Vec<u8>>,
    version: u32,
    create_time: i64,
    update_time: i64,
}

impl LibraryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            public_id: row.get(0)?,
            store_id: row.get(1)?,
            name: row.get(2)?,
            description: row.get(3)?,
            vault_path: row.get(4)?,
            http_method: row.get(5)?,
            http_request_body: row.get(6)?,
            version: row.get(7)?,
            create_time: row.get(8)?,
            update_time: row.get(9)?,
        })
    }

    fn into_library(self, op: &'static str) -> StoreResult<CredentialLibrary> {
        let http_method = HttpMethod::parse(&self.http_method).ok_or_else(|| StoreError::Internal {
            op,
            msg: format!("unknown http method {:?}", self.http_method),
        })?;
        Ok(CredentialLibrary {
            public_id: self.public_id,
            store_id: self.store_id,
            version: self.version,
            create_time: Some(from_micros(self.create_time)),
            update_time: Some(from_micros(self.update_time)),
            fields: LibraryFields {
                name: self.name,
                description: self.description,
                vault_path: self.vault_path,
                http_method,
                http_request_body: self.http_request_body,
            },
        })
    }
}

/// Empty strings are stored as `NULL`.
fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|s| !s.is_empty()).cloned()
}
