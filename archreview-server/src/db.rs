//! Shared SQLite database for the review store and the work queue.
//!
//! Both back-ends live in one database file so that a single connection
//! serializes their writes.
//!
//! # Schema Versioning
//!
//! The `schema_version` table records the applied schema version. To change
//! the schema, increment `CURRENT_SCHEMA_VERSION` and add a step to
//! `run_migrations()`. Steps run in order from the stored version.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use crate::store::RepositoryError;

pub(crate) const CURRENT_SCHEMA_VERSION: i64 = 3;

/// Handle to the open database, cheap to clone.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the database at `path` and bring its schema up to date.
    ///
    /// The connection runs with `journal_mode = WAL`, `synchronous = FULL` and
    /// a 5 second `busy_timeout`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RepositoryError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| RepositoryError::storage("open database", e.to_string()))?;

        #[cfg(unix)]
        if !is_in_memory {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path_ref, permissions) {
                warn!(
                    "Failed to set restrictive permissions on database file: {}",
                    e
                );
            }
        }

        // SQLite silently keeps another journal mode on filesystems without
        // shared memory support, so check what we actually got.
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal_mode", e.to_string()))?;
        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));
        if !journal_mode_ok {
            return Err(RepositoryError::storage(
                "configure journal_mode",
                format!(
                    "SQLite returned journal mode '{}' instead of 'wal'",
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
        .map_err(|e| RepositoryError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| RepositoryError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self, RepositoryError> {
        Self::open(":memory:")
    }

    pub(crate) fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }
}

fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), RepositoryError> {
    if from_version > CURRENT_SCHEMA_VERSION {
        return Err(RepositoryError::storage(
            "schema version",
            format!(
                "Database schema version {} is newer than supported version {}. \
                 Please upgrade the application.",
                from_version, CURRENT_SCHEMA_VERSION
            ),
        ));
    }

    if from_version == CURRENT_SCHEMA_VERSION {
        return Ok(());
    }

    // v1: review records
    if from_version < 1 {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS reviews (
                review_id TEXT PRIMARY KEY,
                ts_nanos INTEGER NOT NULL,
                status TEXT NOT NULL,
                claimed_at_nanos INTEGER,
                version INTEGER NOT NULL,
                review_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_reviews_order
                ON reviews(ts_nanos DESC, review_id DESC);
            CREATE INDEX IF NOT EXISTS idx_reviews_status
                ON reviews(status, ts_nanos DESC, review_id DESC);
            "#,
        )
        .map_err(|e| RepositoryError::storage("migration v1", e.to_string()))?;
    }

    // v2: work queue and dead-letter channel
    if from_version < 2 {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS work_items (
                message_id TEXT PRIMARY KEY,
                review_id TEXT NOT NULL,
                receive_count INTEGER NOT NULL DEFAULT 0,
                enqueued_at INTEGER NOT NULL,
                visible_at INTEGER NOT NULL,
                receipt TEXT UNIQUE
            );

            CREATE INDEX IF NOT EXISTS idx_work_items_visible
                ON work_items(visible_at, enqueued_at);
            CREATE INDEX IF NOT EXISTS idx_work_items_review
                ON work_items(review_id);

            CREATE TABLE IF NOT EXISTS dead_letters (
                message_id TEXT PRIMARY KEY,
                review_id TEXT NOT NULL,
                receive_count INTEGER NOT NULL,
                enqueued_at INTEGER NOT NULL,
                dead_lettered_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_dead_letters_recent
                ON dead_letters(dead_lettered_at DESC);
            "#,
        )
        .map_err(|e| RepositoryError::storage("migration v2", e.to_string()))?;
    }

    // v3: dead-letter lookup by review
    if from_version < 3 {
        conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_dead_letters_review ON dead_letters(review_id);",
        )
        .map_err(|e| RepositoryError::storage("migration v3", e.to_string()))?;
    }

    conn.execute(
        "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
        params![CURRENT_SCHEMA_VERSION],
    )
    .map_err(|e| RepositoryError::storage("update schema version", e.to_string()))?;

    Ok(())
}

// =============================================================================
// Helpers shared by the SQLite back-ends
// =============================================================================

/// Lock the connection, mapping a poisoned mutex to a storage error.
pub(crate) fn lock<'a>(
    conn: &'a Mutex<Connection>,
    operation: &'static str,
) -> Result<MutexGuard<'a, Connection>, RepositoryError> {
    conn.lock()
        .map_err(|_| RepositoryError::storage(operation, "database connection lock poisoned"))
}

/// Nanoseconds since the epoch; representable until the year 2262.
pub(crate) fn to_nanos(at: DateTime<Utc>, operation: &'static str) -> Result<i64, RepositoryError> {
    at.timestamp_nanos_opt().ok_or_else(|| {
        RepositoryError::storage(operation, format!("timestamp {} out of range", at))
    })
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_nanos(value: i64) -> DateTime<Utc> {
    Utc.timestamp_nanos(value)
}

pub(crate) fn from_millis(value: i64, what: &str) -> Result<DateTime<Utc>, RepositoryError> {
    Utc.timestamp_millis_opt(value)
        .single()
        .ok_or_else(|| RepositoryError::corruption(what.to_string()))
}

pub(crate) fn u64_to_i64(value: u64, operation: &'static str) -> Result<i64, RepositoryError> {
    i64::try_from(value).map_err(|_| {
        RepositoryError::storage(
            operation,
            format!("value {} exceeds maximum storable value ({})", value, i64::MAX),
        )
    })
}

/// Convert a usize limit for a SQLite LIMIT clause without wrapping.
pub(crate) fn usize_to_i64_limit(
    limit: usize,
    operation: &'static str,
) -> Result<i64, RepositoryError> {
    i64::try_from(limit).map_err(|_| {
        RepositoryError::storage(
            operation,
            format!("limit {} exceeds maximum storable value ({})", limit, i64::MAX),
        )
    })
}
