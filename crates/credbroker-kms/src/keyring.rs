//! SQLite-backed keyring of wrapped data keys.
//!
//! Each scope owns an ordered list of key versions. A version row stores the
//! data key sealed under the root key; the plaintext data key never touches
//! disk. The highest active version is the scope's current version and is
//! the one used for new encryptions.
//!
//! # Schema
//!
//! ```sql
//! kms_data_keys(scope_id, version, wrapped_key, nonce, state, create_time)
//! ```
//!
//! `state` is either `active` or `destroyed`. Destroying a version erases
//! its wrapped key so data sealed under it becomes permanently unreadable.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{KmsError, Result};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Lifecycle state of a data key version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    Active,
    Destroyed,
}

impl KeyState {
    /// Convert to the string stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Destroyed => "destroyed",
        }
    }

    /// Parse from the string stored in SQLite.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "destroyed" => Some(Self::Destroyed),
            _ => None,
        }
    }
}

/// A wrapped data key as persisted in the keyring.
#[derive(Debug, Clone)]
pub struct WrappedKey {
    pub scope_id: String,
    pub version: u32,
    pub wrapped_key: Vec<u8>,
    pub nonce: Vec<u8>,
    pub state: KeyState,
    pub create_time: DateTime<Utc>,
}

/// Metadata about a key version, without key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyVersionInfo {
    pub version: u32,
    pub state: KeyState,
    pub create_time: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Keyring
// ---------------------------------------------------------------------------

/// Synchronous keyring over a single SQLite connection.
///
/// The async [`Kms`](crate::Kms) owns a keyring behind a mutex and calls it
/// from blocking tasks.
pub struct Keyring {
    conn: Connection,
}

impl Keyring {
    /// Open (or create) a keyring database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::info!(path = %path.display(), "opening keyring database");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory keyring (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;

             CREATE TABLE IF NOT EXISTS kms_data_keys (
                 scope_id    TEXT    NOT NULL,
                 version     INTEGER NOT NULL CHECK(version > 0),
                 wrapped_key BLOB    NOT NULL,
                 nonce       BLOB    NOT NULL,
                 state       TEXT    NOT NULL DEFAULT 'active'
                                     CHECK(state IN ('active','destroyed')),
                 create_time INTEGER NOT NULL,
                 PRIMARY KEY (scope_id, version)
             );",
        )?;
        Ok(Self { conn })
    }

    // -- Reads --------------------------------------------------------------

    /// The highest active version for `scope_id`, if the scope has any keys.
    pub fn current_version(&self, scope_id: &str) -> Result<Option<u32>> {
        let version: Option<u32> = self.conn.query_row(
            "SELECT MAX(version) FROM kms_data_keys WHERE scope_id = ?1 AND state = 'active'",
            params![scope_id],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    /// Fetch a specific key version.
    pub fn get(&self, scope_id: &str, version: u32) -> Result<Option<WrappedKey>> {
        let key = self
            .conn
            .query_row(
                "SELECT scope_id, version, wrapped_key, nonce, state, create_time
                 FROM kms_data_keys WHERE scope_id = ?1 AND version = ?2",
                params![scope_id, version],
                row_to_wrapped_key,
            )
            .optional()?;
        Ok(key)
    }

    /// All versions of a scope, oldest first.
    pub fn versions(&self, scope_id: &str) -> Result<Vec<KeyVersionInfo>> {
        let mut stmt = self.conn.prepare(
            "SELECT scope_id, version, wrapped_key, nonce, state, create_time
             FROM kms_data_keys WHERE scope_id = ?1 ORDER BY version",
        )?;
        let rows = stmt
            .query_map(params![scope_id], row_to_wrapped_key)?
            .map(|row| row.map(|key| KeyVersionInfo::from(&key)))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // -- Writes -------------------------------------------------------------

    /// Append a new version for `scope_id` and return its number.
    pub fn insert_version(&mut self, scope_id: &str, wrapped_key: &[u8], nonce: &[u8]) -> Result<u32> {
        let tx = self.conn.transaction()?;
        let max: Option<u32> = tx.query_row(
            "SELECT MAX(version) FROM kms_data_keys WHERE scope_id = ?1",
            params![scope_id],
            |row| row.get(0),
        )?;
        let version = max.unwrap_or(0) + 1;
        tx.execute(
            "INSERT INTO kms_data_keys (scope_id, version, wrapped_key, nonce, state, create_time)
             VALUES (?1, ?2, ?3, ?4, 'active', ?5)",
            params![
                scope_id,
                version,
                wrapped_key,
                nonce,
                Utc::now().timestamp_micros()
            ],
        )?;
        tx.commit()?;

        tracing::debug!(scope_id, version, "inserted data key version");
        Ok(version)
    }

    /// Erase the wrapped key of a version. Returns `false` if no such version.
    pub fn mark_destroyed(&mut self, scope_id: &str, version: u32) -> Result<bool> {
        let rows = self.conn.execute(
            "UPDATE kms_data_keys SET state = 'destroyed', wrapped_key = x'', nonce = x''
             WHERE scope_id = ?1 AND version = ?2",
            params![scope_id, version],
        )?;
        Ok(rows > 0)
    }
}

fn row_to_wrapped_key(row: &rusqlite::Row<'_>) -> rusqlite::Result<WrappedKey> {
    let state: String = row.get(4)?;
    let micros: i64 = row.get(5)?;
    Ok(WrappedKey {
        scope_id: row.get(0)?,
        version: row.get(1)?,
        wrapped_key: row.get(2)?,
        nonce: row.get(3)?,
        state: KeyState::parse(&state).unwrap_or(KeyState::Destroyed),
        create_time: Utc
            .timestamp_micros(micros)
            .single()
            .unwrap_or_else(Utc::now),
    })
}

impl From<&WrappedKey> for KeyVersionInfo {
    fn from(key: &WrappedKey) -> Self {
        Self {
            version: key.version,
            state: key.state,
            create_time: key.create_time,
        }
    }
}

/// Shorthand for the error returned when a version row is absent or erased.
pub(crate) fn missing_version(scope_id: &str, version: u32) -> KmsError {
    KmsError::unavailable(scope_id, format!("key version {version} not found"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_are_sequential_per_scope() {
        let mut ring = Keyring::open_in_memory().unwrap();
        assert_eq!(ring.current_version("o_1").unwrap(), None);

        assert_eq!(ring.insert_version("o_1", b"w1", b"n1").unwrap(), 1);
        assert_eq!(ring.insert_version("o_1", b"w2", b"n2").unwrap(), 2);
        assert_eq!(ring.insert_version("p_1", b"w1", b"n1").unwrap(), 1);

        assert_eq!(ring.current_version("o_1").unwrap(), Some(2));
        assert_eq!(ring.current_version("p_1").unwrap(), Some(1));
    }

    #[test]
    fn destroyed_version_loses_material() {
        let mut ring = Keyring::open_in_memory().unwrap();
        ring.insert_version("o_1", b"w1", b"n1").unwrap();
        ring.insert_version("o_1", b"w2", b"n2").unwrap();

        assert!(ring.mark_destroyed("o_1", 1).unwrap());
        assert!(!ring.mark_destroyed("o_1", 9).unwrap());

        let key = ring.get("o_1", 1).unwrap().unwrap();
        assert_eq!(key.state, KeyState::Destroyed);
        assert!(key.wrapped_key.is_empty());

        let versions = ring.versions("o_1").unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[1].state, KeyState::Active);
    }

    #[test]
    fn keyring_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyring.db");
        {
            let mut ring = Keyring::open(&path).unwrap();
            ring.insert_version("o_1", b"w1", b"n1").unwrap();
        }
        let ring = Keyring::open(&path).unwrap();
        assert_eq!(ring.current_version("o_1").unwrap(), Some(1));
        assert_eq!(ring.get("o_1", 1).unwrap().unwrap().wrapped_key, b"w1");
    }
}
