//! Schema migration system.
//!
//! Migrations are stored as static SQL strings keyed by version number.
//! The current version is tracked in a `_migrations` table so migrations
//! are idempotent and only run once.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

/// A single migration definition.
struct Migration {
    /// Monotonically increasing version number (1, 2, 3, ...).
    version: u32,
    /// Human-readable description.
    description: &'static str,
    /// Raw SQL to execute. May contain multiple statements separated by `;`.
    sql: &'static str,
}

/// All migrations in order. Add new migrations to the end of this array.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "credential stores and credential libraries",
        sql: r#"
            CREATE TABLE credential_stores (
                public_id                 TEXT PRIMARY KEY,
                scope_id                  TEXT NOT NULL CHECK(length(scope_id) > 0),
                name                      TEXT,
                description               TEXT,
                vault_address             TEXT NOT NULL CHECK(length(vault_address) > 0),
                namespace                 TEXT,
                ca_cert                   TEXT,
                tls_server_name           TEXT,
                tls_skip_verify           INTEGER NOT NULL DEFAULT 0,
                ct_token                  BLOB NOT NULL,
                client_certificate        TEXT,
                ct_client_certificate_key BLOB,
                version                   INTEGER NOT NULL DEFAULT 1 CHECK(version > 0),
                create_time               INTEGER NOT NULL,
                update_time               INTEGER NOT NULL,
                UNIQUE (scope_id, name),
                CHECK (ct_client_certificate_key IS NULL OR client_certificate IS NOT NULL)
            );
            CREATE INDEX idx_credential_stores_scope ON credential_stores(scope_id, create_time);

            CREATE TABLE credential_libraries (
                public_id         TEXT PRIMARY KEY,
                store_id          TEXT NOT NULL
                                  REFERENCES credential_stores(public_id) ON DELETE CASCADE,
                name              TEXT,
                description       TEXT,
                vault_path        TEXT NOT NULL CHECK(length(vault_path) > 0),
                http_method       TEXT NOT NULL DEFAULT 'GET' CHECK(http_method IN ('GET','POST')),
                http_request_body BLOB,
                version           INTEGER NOT NULL DEFAULT 1 CHECK(version > 0),
                create_time       INTEGER NOT NULL,
                update_time       INTEGER NOT NULL,
                UNIQUE (store_id, name),
                CHECK (http_request_body IS NULL OR http_method = 'POST')
            );
            CREATE INDEX idx_credential_libraries_store ON credential_libraries(store_id, create_time);
        "#,
    },
    Migration {
        version: 2,
        description: "oplog: append-only audit of every mutation",
        sql: r#"
            CREATE TABLE oplog_entries (
                seq           INTEGER PRIMARY KEY AUTOINCREMENT,
                resource_id   TEXT NOT NULL,
                resource_type TEXT NOT NULL
                              CHECK(resource_type IN ('credential_store','credential_library')),
                scope_id      TEXT NOT NULL,
                op_kind       TEXT NOT NULL CHECK(op_kind IN ('create','update','delete')),
                payload       TEXT NOT NULL,
                create_time   INTEGER NOT NULL
            );
            CREATE INDEX idx_oplog_resource ON oplog_entries(resource_id, seq);

            CREATE TRIGGER oplog_entries_no_update BEFORE UPDATE ON oplog_entries
            BEGIN
                SELECT RAISE(ABORT, 'oplog entries are immutable');
            END;

            CREATE TRIGGER oplog_entries_no_delete BEFORE DELETE ON oplog_entries
            BEGIN
                SELECT RAISE(ABORT, 'oplog entries are immutable');
            END;
        "#,
    },
    Migration {
        version: 3,
        description: "immutable identity and parent columns",
        sql: r#"
            CREATE TRIGGER credential_stores_immutable_columns
            BEFORE UPDATE OF public_id, scope_id, create_time ON credential_stores
            WHEN NEW.public_id IS NOT OLD.public_id
              OR NEW.scope_id IS NOT OLD.scope_id
              OR NEW.create_time IS NOT OLD.create_time
            BEGIN
                SELECT RAISE(ABORT, 'public_id, scope_id and create_time are immutable');
            END;

            CREATE TRIGGER credential_libraries_immutable_columns
            BEFORE UPDATE OF public_id, store_id, create_time ON credential_libraries
            WHEN NEW.public_id IS NOT OLD.public_id
              OR NEW.store_id IS NOT OLD.store_id
              OR NEW.create_time IS NOT OLD.create_time
            BEGIN
                SELECT RAISE(ABORT, 'public_id, store_id and create_time are immutable');
            END;
        "#,
    },
];

// ── public API ───────────────────────────────────────────────────────

/// Run all pending migrations against `conn`.
///
/// This is a **synchronous** function; call it from `spawn_blocking`.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        debug!(current_version = current, "database schema is up to date");
        return Ok(());
    }

    info!(
        current_version = current,
        pending = pending.len(),
        "running pending migrations"
    );

    for migration in pending {
        apply(conn, migration)?;
    }

    info!(
        new_version = MIGRATIONS.last().map(|m| m.version).unwrap_or(0),
        "all migrations applied"
    );
    Ok(())
}

/// Return the latest applied migration version, or 0 if none.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    let version: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::Migration {
            version: 0,
            message: format!("failed to read current version: {e}"),
        })?;
    Ok(version)
}

// ── internals ────────────────────────────────────────────────────────

/// Create the `_migrations` bookkeeping table if it does not exist.
fn ensure_migrations_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })?;
    Ok(())
}

/// Apply a single migration inside a transaction.
fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    info!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );

    // `conn.transaction()` needs `&mut Connection`, so the transaction is
    // managed by hand.
    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("failed to begin transaction: {e}"),
        })?;

    let result = (|| -> StoreResult<()> {
        conn.execute_batch(migration.sql)
            .map_err(|e| StoreError::Migration {
                version: migration.version,
                message: format!("SQL execution failed: {e}"),
            })?;

        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![migration.version, migration.description, now],
        )
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("failed to record migration: {e}"),
        })?;

        Ok(())
    })();

    match &result {
        Ok(()) => {
            conn.execute_batch("COMMIT;")
                .map_err(|e| StoreError::Migration {
                    version: migration.version,
                    message: format!("failed to commit: {e}"),
                })?;
            info!(
                version = migration.version,
                "migration applied successfully"
            );
        }
        Err(err) => {
            warn!(version = migration.version, %err, "migration failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
        }
    }

    result
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        conn
    }

    fn insert_store(conn: &Connection, id: &str, scope: &str) {
        conn.execute(
            "INSERT INTO credential_stores
                 (public_id, scope_id, vault_address, ct_token, create_time, update_time)
             VALUES (?1, ?2, 'https://vault:8200', x'01', 1, 1)",
            rusqlite::params![id, scope],
        )
        .unwrap();
    }

    #[test]
    fn migrations_are_ordered() {
        for window in MIGRATIONS.windows(2) {
            assert!(
                window[1].version > window[0].version,
                "migration versions must be strictly increasing: {} >= {}",
                window[0].version,
                window[1].version,
            );
        }
    }

    /// The expected latest migration version (update when adding migrations).
    const LATEST_VERSION: u32 = 3;

    #[test]
    fn run_all_on_fresh_db() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        let version = current_version(&conn).unwrap();
        assert_eq!(version, LATEST_VERSION);
    }

    #[test]
    fn run_all_is_idempotent() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        run_all(&conn).unwrap();

        let version = current_version(&conn).unwrap();
        assert_eq!(version, LATEST_VERSION);
    }

    #[test]
    fn migrations_create_all_tables() {
        let conn = setup_conn();
        run_all(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE '\\_%' ESCAPE '\\' AND name != 'sqlite_sequence' ORDER BY name",
                )
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap()
        };
        assert_eq!(
            tables,
            vec!["credential_libraries", "credential_stores", "oplog_entries"]
        );
    }

    #[test]
    fn oplog_rows_cannot_change() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        conn.execute(
            "INSERT INTO oplog_entries (resource_id, resource_type, scope_id, op_kind, payload, create_time)
             VALUES ('csvlt_1234567890', 'credential_store', 'p_1', 'create', '{}', 1)",
            [],
        )
        .unwrap();

        assert!(conn.execute("UPDATE oplog_entries SET op_kind = 'delete'", []).is_err());
        assert!(conn.execute("DELETE FROM oplog_entries", []).is_err());
    }

    #[test]
    fn library_store_id_is_immutable() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        insert_store(&conn, "csvlt_aaaaaaaaaa", "p_1");
        insert_store(&conn, "csvlt_bbbbbbbbbb", "p_1");
        conn.execute(
            "INSERT INTO credential_libraries (public_id, store_id, vault_path, create_time, update_time)
             VALUES ('clvlt_1234567890', 'csvlt_aaaaaaaaaa', 'secret/db', 1, 1)",
            [],
        )
        .unwrap();

        let result = conn.execute(
            "UPDATE credential_libraries SET store_id = 'csvlt_bbbbbbbbbb'",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn deleting_store_cascades_to_libraries() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        insert_store(&conn, "csvlt_aaaaaaaaaa", "p_1");
        conn.execute(
            "INSERT INTO credential_libraries (public_id, store_id, vault_path, create_time, update_time)
             VALUES ('clvlt_1234567890', 'csvlt_aaaaaaaaaa', 'secret/db', 1, 1)",
            [],
        )
        .unwrap();

        conn.execute("DELETE FROM credential_stores", []).unwrap();
        let count: i64 = conn
            .query_row("SELECT count(*) FROM credential_libraries", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn get_method_rejects_body() {
        let conn = setup_conn();
        run_all(&conn).unwrap();
        insert_store(&conn, "csvlt_aaaaaaaaaa", "p_1");

        let result = conn.execute(
            "INSERT INTO credential_libraries
                 (public_id, store_id, vault_path, http_method, http_request_body, create_time, update_time)
             VALUES ('clvlt_1234567890', 'csvlt_aaaaaaaaaa', 'secret/db', 'GET', x'7b7d', 1, 1)",
            [],
        );
        assert!(result.is_err());
    }
}
