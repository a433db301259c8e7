//! SQLite implementation of `LeaseStore`.
//!
//! Leases survive restarts and are shared by every process pointed at the
//! same database file.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table that tracks the schema version.
//! When the schema needs to change, increment `CURRENT_SCHEMA_VERSION` and add
//! a migration in `run_migrations()`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use reviewsync_core::lease::{Lease, LeaseStore, LeaseStoreError};

const CURRENT_SCHEMA_VERSION: i64 = 1;

/// SQLite-backed lease store.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite operations
/// without blocking the async runtime.
#[derive(Clone)]
pub struct SqliteLeaseStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLeaseStore {
    /// Open (or create) the lease database at `path`.
    ///
    /// # Durability
    ///
    /// The database is configured with:
    /// - `journal_mode = WAL` for concurrent readers across processes
    /// - `synchronous = FULL` so a written lease survives power failure
    /// - `busy_timeout = 5000ms` to wait out other writers
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, LeaseStoreError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        LeaseStoreError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| LeaseStoreError::storage("open database", e.to_string()))?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| LeaseStoreError::storage("set journal_mode", e.to_string()))?;

        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(LeaseStoreError::storage(
                "configure journal_mode",
                format!(
                    "SQLite returned '{}' instead of 'wal'; the filesystem may not support shared memory",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|e| LeaseStoreError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| LeaseStoreError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| LeaseStoreError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, mostly useful for tests.
    pub fn in_memory() -> Result<Self, LeaseStoreError> {
        Self::new(":memory:")
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), LeaseStoreError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(LeaseStoreError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS leases (
                    key TEXT PRIMARY KEY,
                    holder TEXT NOT NULL,
                    acquired_at INTEGER NOT NULL
                );
                "#,
            )
            .map_err(|e| LeaseStoreError::storage("migration v1", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| LeaseStoreError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<F, T>(&self, operation: &'static str, f: F) -> Result<T, LeaseStoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| LeaseStoreError::storage(operation, format!("lock poisoned: {}", e)))?;
            f(&conn).map_err(|e| LeaseStoreError::storage(operation, e.to_string()))
        })
        .await
        .map_err(|e| LeaseStoreError::storage(operation, format!("task join error: {}", e)))?
    }
}

fn lease_from_row(key: String, holder: String, acquired_at_ms: i64) -> Lease {
    let acquired_at = DateTime::<Utc>::from_timestamp_millis(acquired_at_ms).unwrap_or_else(|| {
        warn!(
            "Lease on {} has invalid timestamp {}, treating it as stale",
            key, acquired_at_ms
        );
        DateTime::<Utc>::UNIX_EPOCH
    });
    Lease::new(key, holder, acquired_at)
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn read(&self, key: &str) -> Result<Option<Lease>, LeaseStoreError> {
        let key = key.to_string();
        self.with_conn("read lease", move |conn| {
            conn.query_row(
                "SELECT key, holder, acquired_at FROM leases WHERE key = ?1",
                params![key],
                |row| Ok(lease_from_row(row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
        })
        .await
    }

    async fn write(&self, lease: &Lease) -> Result<(), LeaseStoreError> {
        let lease = lease.clone();
        self.with_conn("write lease", move |conn| {
            conn.execute(
                "INSERT INTO leases (key, holder, acquired_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(key) DO UPDATE SET holder = excluded.holder, acquired_at = excluded.acquired_at",
                params![lease.key, lease.holder, lease.acquired_at.timestamp_millis()],
            )
            .map(|_| ())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), LeaseStoreError> {
        let key = key.to_string();
        self.with_conn("delete lease", move |conn| {
            conn.execute("DELETE FROM leases WHERE key = ?1", params![key])
                .map(|_| ())
        })
        .await
    }

    async fn delete_if_held(&self, key: &str, holder: &str) -> Result<bool, LeaseStoreError> {
        let (key, holder) = (key.to_string(), holder.to_string());
        self.with_conn("release lease", move |conn| {
            conn.execute(
                "DELETE FROM leases WHERE key = ?1 AND holder = ?2",
                params![key, holder],
            )
            .map(|deleted| deleted > 0)
        })
        .await
    }
}
