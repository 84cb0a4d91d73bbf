//! SQLite database setup with WAL mode, mmap, and performance pragmas.
//!
//! The [`Database`] struct wraps a `rusqlite::Connection` behind an
//! `Arc<Mutex<>>` and exposes async methods that use
//! `tokio::task::spawn_blocking` to avoid blocking the async runtime.
//!
//! Writes go through [`Database::transaction`], which opens an immediate
//! transaction, hands it to the caller's closure and commits only if the
//! closure succeeded and the operation's [`Context`] is still live.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, info, warn};

use crate::context::Context;
use crate::error::{OpContext, StoreError, StoreResult};
use crate::migration;

/// Thread-safe handle to a SQLite database.
///
/// All read/write operations go through [`Database::execute`] or
/// [`Database::transaction`], which dispatch onto the blocking thread pool
/// via `tokio::task::spawn_blocking`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) a database at `path` and apply performance pragmas.
    ///
    /// This call blocks briefly (file I/O), so call it during startup before
    /// entering the main async loop, or wrap it in `spawn_blocking` yourself.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Internal {
                op: "open_database",
                msg: format!("failed to create {}: {e}", parent.display()),
            })?;
        }

        let conn = Connection::open(path)?;
        Self::apply_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database, useful for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory database");

        let conn = Connection::open_in_memory()?;
        Self::apply_pragmas(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open the database and run all pending migrations.
    pub async fn open_and_migrate(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = tokio::task::spawn_blocking(move || Self::open(&path)).await??;
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run all pending schema migrations.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        self.execute(|conn| migration::run_all(conn)).await
    }

    /// Execute an arbitrary closure against the connection on the blocking pool.
    ///
    /// Used for reads; writes that must be audited go through
    /// [`Database::transaction`].
    ///
    /// # Example
    ///
    /// ```ignore
    /// let count: i64 = db.execute(|conn| {
    ///     let count = conn.query_row("SELECT count(*) FROM credential_stores", [], |row| row.get(0))?;
    ///     Ok(count)
    /// }).await?;
    /// ```
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await?
    }

    /// Execute a mutable closure on the blocking pool.
    pub async fn execute_mut<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::TaskJoin(format!("mutex poisoned: {e}")))?;
            f(&mut conn)
        })
        .await?
    }

    /// Run `f` inside one immediate transaction.
    ///
    /// The transaction commits only if `f` returns `Ok` and `ctx` is still
    /// live afterwards; otherwise it is dropped, which rolls it back. `ctx` is
    /// also checked before the transaction begins.
    pub async fn transaction<F, T>(&self, ctx: &Context, op: &'static str, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Transaction<'_>) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        ctx.check(op)?;
        let ctx = ctx.clone();
        self.execute_mut(move |conn| {
            ctx.check(op)?;
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .op_err(op)?;

            let out = match f(&tx) {
                Ok(out) => out,
                Err(err) => {
                    warn!(op, error = %err, "transaction rolled back");
                    return Err(err);
                }
            };

            if let Err(err) = ctx.check(op) {
                warn!(op, "operation canceled before commit, rolling back");
                return Err(err);
            }
            tx.commit().op_err(op)?;
            Ok(out)
        })
        .await
    }

    // ── pragmas ──────────────────────────────────────────────────────

    /// Apply all performance pragmas to a fresh connection.
    fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
        debug!("applying SQLite performance pragmas");

        // WAL mode: concurrent readers, non-blocking writes.
        conn.pragma_update(None, "journal_mode", "WAL")?;

        // NORMAL sync is safe with WAL: only the last transaction can be lost
        // on power failure, never the file.
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        // 64 MiB memory-mapped I/O.
        conn.pragma_update(None, "mmap_size", 67_108_864_i64)?;

        // Negative value means KiB: -16000 = ~16 MiB page cache.
        conn.pragma_update(None, "cache_size", -16_000_i32)?;

        conn.pragma_update(None, "temp_store", "MEMORY")?;

        // Library -> store references and cascading deletes.
        conn.pragma_update(None, "foreign_keys", "ON")?;

        // Busy timeout so concurrent writers wait instead of failing immediately.
        conn.pragma_update(None, "busy_timeout", 5_000_i32)?;

        info!("database pragmas applied (WAL, foreign keys on)");
        Ok(())
    }
}

// ── tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    async fn migrated() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.run_migrations().await.unwrap();
        db
    }

    async fn store_count(db: &Database) -> i64 {
        db.execute(|conn| {
            let c: i64 = conn.query_row("SELECT count(*) FROM credential_stores", [], |row| {
                row.get(0)
            })?;
            Ok(c)
        })
        .await
        .unwrap()
    }

    fn insert_store(tx: &Transaction<'_>, id: &str) -> StoreResult<()> {
        tx.execute(
            "INSERT INTO credential_stores
                 (public_id, scope_id, vault_address, ct_token, create_time, update_time)
             VALUES (?1, 'p_1234567890', 'https://vault:8200', x'01', 1, 1)",
            [id],
        )
        .op_err("test")?;
        Ok(())
    }

    #[tokio::test]
    async fn foreign_keys_are_enforced() {
        let db = Database::open_in_memory().unwrap();
        let on: i64 = db
            .execute(|conn| {
                let v: i64 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
                Ok(v)
            })
            .await
            .unwrap();
        assert_eq!(on, 1);
    }

    #[tokio::test]
    async fn transaction_commits_on_success() {
        let db = migrated().await;
        db.transaction(&Context::background(), "test", |tx| {
            insert_store(tx, "csvlt_aaaaaaaaaa")
        })
        .await
        .unwrap();
        assert_eq!(store_count(&db).await, 1);
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_error() {
        let db = migrated().await;
        let err = db
            .transaction(&Context::background(), "test", |tx| {
                insert_store(tx, "csvlt_aaaaaaaaaa")?;
                insert_store(tx, "csvlt_aaaaaaaaaa")
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotUnique);
        assert_eq!(store_count(&db).await, 0);
    }

    #[tokio::test]
    async fn cancel_during_transaction_rolls_back() {
        let db = migrated().await;
        let ctx = Context::background();
        let inner = ctx.clone();

        let err = db
            .transaction(&ctx, "test", move |tx| {
                insert_store(tx, "csvlt_aaaaaaaaaa")?;
                inner.cancel();
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Canceled);
        assert_eq!(store_count(&db).await, 0);
    }

    #[tokio::test]
    async fn canceled_context_never_starts() {
        let db = migrated().await;
        let ctx = Context::background();
        ctx.cancel();

        let err = db
            .transaction(&ctx, "test", |tx| insert_store(tx, "csvlt_aaaaaaaaaa"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Canceled);
        assert_eq!(store_count(&db).await, 0);
    }
}
