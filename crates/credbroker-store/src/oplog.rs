//! Append-only audit trail of repository mutations.
//!
//! [`Oplog::append`] takes the caller's open [`Transaction`], so an entry is
//! persisted exactly when the data change it describes commits. The table
//! itself rejects updates and deletes through triggers.

use std::fmt;

use chrono::{DateTime, Utc};
use rusqlite::{Transaction, params};
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::{OpContext, StoreError, StoreResult};
use crate::models::{from_micros, to_micros};

/// The kind of mutation an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The resource type an entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    CredentialStore,
    CredentialLibrary,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CredentialStore => "credential_store",
            Self::CredentialLibrary => "credential_library",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "credential_store" => Some(Self::CredentialStore),
            "credential_library" => Some(Self::CredentialLibrary),
            _ => None,
        }
    }
}

/// The resource a mutation touched.
#[derive(Debug, Clone, Copy)]
pub struct ResourceRef<'a> {
    pub id: &'a str,
    pub resource_type: ResourceType,
    pub scope_id: &'a str,
}

/// A persisted oplog entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OplogEntry {
    /// Insertion sequence, strictly increasing across the whole log.
    pub seq: i64,
    pub resource_id: String,
    pub resource_type: ResourceType,
    pub scope_id: String,
    pub op_kind: OpKind,
    pub payload: serde_json::Value,
    pub create_time: DateTime<Utc>,
}

/// Reader over the oplog; writes happen through [`Oplog::append`].
#[derive(Clone)]
pub struct Oplog {
    db: Database,
}

impl Oplog {
    /// Create a reader backed by `db`.
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append one entry inside the caller's transaction and return its
    /// sequence number.
    pub fn append(
        tx: &Transaction<'_>,
        op: &'static str,
        kind: OpKind,
        resource: ResourceRef<'_>,
        payload: &serde_json::Value,
    ) -> StoreResult<i64> {
        let payload = serde_json::to_string(payload).op_err(op)?;
        tx.execute(
            "INSERT INTO oplog_entries (resource_id, resource_type, scope_id, op_kind, payload, create_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                resource.id,
                resource.resource_type.as_str(),
                resource.scope_id,
                kind.as_str(),
                payload,
                to_micros(&Utc::now()),
            ],
        )
        .op_err(op)?;
        let seq = tx.last_insert_rowid();

        tracing::debug!(
            seq,
            resource_id = resource.id,
            op_kind = %kind,
            "oplog entry appended"
        );
        Ok(seq)
    }

    /// Every entry for `resource_id`, in insertion order.
    pub async fn entries_for(&self, resource_id: &str) -> StoreResult<Vec<OplogEntry>> {
        const OP: &str = "oplog_entries_for";
        let resource_id = resource_id.to_string();
        self.db
            .execute(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT seq, resource_id, resource_type, scope_id, op_kind, payload, create_time
                         FROM oplog_entries WHERE resource_id = ?1 ORDER BY seq",
                    )
                    .op_err(OP)?;
                let rows = stmt
                    .query_map(params![resource_id], |row| {
                        Ok(EntryRow {
                            seq: row.get(0)?,
                            resource_id: row.get(1)?,
                            resource_type: row.get(2)?,
                            scope_id: row.get(3)?,
                            op_kind: row.get(4)?,
                            payload: row.get(5)?,
                            create_time: row.get(6)?,
                        })
                    })
                    .op_err(OP)?
                    .collect::<Result<Vec<_>, _>>()
                    .op_err(OP)?;
                rows.into_iter().map(|row| row.into_entry(OP)).collect()
            })
            .await
    }

    /// Whether at least one `kind` entry exists for `resource_id` created at
    /// or after `not_before`.
    pub async fn verify(
        &self,
        resource_id: &str,
        kind: OpKind,
        not_before: DateTime<Utc>,
    ) -> StoreResult<bool> {
        const OP: &str = "oplog_verify";
        let resource_id = resource_id.to_string();
        let since = to_micros(&not_before);
        self.db
            .execute(move |conn| {
                let found: bool = conn
                    .query_row(
                        "SELECT EXISTS(SELECT 1 FROM oplog_entries
                          WHERE resource_id = ?1 AND op_kind = ?2 AND create_time >= ?3)",
                        params![resource_id, kind.as_str(), since],
                        |row| row.get(0),
                    )
                    .op_err(OP)?;
                Ok(found)
            })
            .await
    }

    /// Number of entries recorded for `resource_id`.
    pub async fn count_for(&self, resource_id: &str) -> StoreResult<u64> {
        const OP: &str = "oplog_count_for";
        let resource_id = resource_id.to_string();
        self.db
            .execute(move |conn| {
                let count: i64 = conn
                    .query_row(
                        "SELECT count(*) FROM oplog_entries WHERE resource_id = ?1",
                        params![resource_id],
                        |row| row.get(0),
                    )
                    .op_err(OP)?;
                Ok(count.unsigned_abs())
            })
            .await
    }
}

struct EntryRow {
    seq: i64,
    resource_id: String,
    resource_type: String,
    scope_id: String,
    op_kind: String,
    payload: String,
    create_time: i64,
}

impl EntryRow {
    fn into_entry(self, op: &'static str) -> StoreResult<OplogEntry> {
        let resource_type =
            ResourceType::parse(&self.resource_type).ok_or_else(|| StoreError::Internal {
                op,
                msg: format!("unknown resource type {:?}", self.resource_type),
            })?;
        let op_kind = OpKind::parse(&self.op_kind).ok_or_else(|| StoreError::Internal {
            op,
            msg: format!("unknown op kind {:?}", self.op_kind),
        })?;
        Ok(OplogEntry {
            seq: self.seq,
            resource_id: self.resource_id,
            resource_type,
            scope_id: self.scope_id,
            op_kind,
            payload: serde_json::from_str(&self.payload).op_err(op)?,
            create_time: from_micros(self.create_time),
        })
    }
}
