//! Domain types for credential stores and credential libraries.
//!
//! Values returned by the repository are snapshots: every mutation hands back
//! a fresh value and never touches the caller's candidate. Snapshots never
//! carry plaintext secrets; ciphertext is reported by key version only.

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use credbroker_kms::SecretString;
use serde::{Deserialize, Serialize};

/// HTTP method used to fetch a credential from the secrets engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }

    /// Parse a method name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("GET") {
            Some(Self::Get)
        } else if s.eq_ignore_ascii_case("POST") {
            Some(Self::Post)
        } else {
            None
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Credential library
// ---------------------------------------------------------------------------

/// The persisted, user-editable columns of a credential library.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryFields {
    /// Unique among the libraries of one store when set.
    pub name: Option<String>,
    pub description: Option<String>,
    /// Path on the secrets engine. Required.
    pub vault_path: String,
    pub http_method: HttpMethod,
    /// Only allowed together with [`HttpMethod::Post`].
    pub http_request_body: Option<Vec<u8>>,
}

/// A retrievable secret shape under a credential store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialLibrary {
    /// Minted by the repository on create; empty on a create candidate.
    pub public_id: String,
    pub store_id: String,
    /// Starts at 1 and grows by exactly 1 per successful update.
    pub version: u32,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
    pub fields: LibraryFields,
}

impl CredentialLibrary {
    /// A create candidate for a library under `store_id`.
    pub fn new(store_id: impl Into<String>, fields: LibraryFields) -> Self {
        Self {
            store_id: store_id.into(),
            fields,
            ..Self::default()
        }
    }

    /// Audit payload for this snapshot.
    pub(crate) fn oplog_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "public_id": self.public_id,
            "store_id": self.store_id,
            "version": self.version,
            "name": self.fields.name,
            "description": self.fields.description,
            "vault_path": self.fields.vault_path,
            "http_method": self.fields.http_method.as_str(),
            "http_request_body": self.fields.http_request_body.as_deref().map(|b| STANDARD.encode(b)),
        })
    }
}

// ---------------------------------------------------------------------------
// Credential store
// ---------------------------------------------------------------------------

/// Connection settings for a remote secrets engine, owned by one scope.
///
/// `token` and `client_certificate_key` are write-only: they are read from a
/// candidate on create and update, encrypted, and never populated on a
/// snapshot returned by the repository.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CredentialStore {
    pub public_id: String,
    pub scope_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    /// Address of the secrets engine. Required.
    pub address: String,
    pub namespace: Option<String>,
    /// PEM bundle used to verify the engine's TLS certificate.
    pub ca_cert: Option<String>,
    pub tls_server_name: Option<String>,
    pub tls_skip_verify: bool,
    pub client_certificate: Option<String>,
    #[serde(skip)]
    pub token: Option<SecretString>,
    #[serde(skip)]
    pub client_certificate_key: Option<SecretString>,
    /// Key version protecting the stored token.
    pub token_key_version: Option<u32>,
    /// Key version protecting the stored client certificate key, if any.
    pub client_certificate_key_version: Option<u32>,
    pub version: u32,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
}

impl CredentialStore {
    /// A create candidate in `scope_id` pointing at `address`.
    pub fn new(
        scope_id: impl Into<String>,
        address: impl Into<String>,
        token: impl Into<SecretString>,
    ) -> Self {
        Self {
            scope_id: scope_id.into(),
            address: address.into(),
            token: Some(token.into()),
            ..Self::default()
        }
    }

    /// Audit payload for this snapshot. Secrets appear only as key versions.
    pub(crate) fn oplog_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "public_id": self.public_id,
            "scope_id": self.scope_id,
            "version": self.version,
            "name": self.name,
            "description": self.description,
            "address": self.address,
            "namespace": self.namespace,
            "ca_cert": self.ca_cert,
            "tls_server_name": self.tls_server_name,
            "tls_skip_verify": self.tls_skip_verify,
            "client_certificate": self.client_certificate,
            "token_key_version": self.token_key_version,
            "client_certificate_key_version": self.client_certificate_key_version,
        })
    }
}

/// Everything needed to open a client session against a store's secrets
/// engine, with secrets decrypted.
#[derive(Debug, Clone)]
pub struct VaultClientConfig {
    pub store_id: String,
    pub address: String,
    pub namespace: Option<String>,
    pub ca_cert: Option<String>,
    pub tls_server_name: Option<String>,
    pub tls_skip_verify: bool,
    pub token: SecretString,
    pub client_certificate: Option<String>,
    pub client_certificate_key: Option<SecretString>,
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Timestamps are stored as microseconds since the Unix epoch.
pub(crate) fn to_micros(t: &DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

/// The current time truncated to the stored precision, so a value handed
/// back from create compares equal to the same value read back later.
pub(crate) fn now() -> DateTime<Utc> {
    from_micros(to_micros(&Utc::now()))
}
