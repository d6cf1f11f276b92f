//! SQLite implementation of `ReviewRepository`.
//!
//! Each review is stored as a JSON document alongside the columns needed for
//! ordering, filtering and conditional writes. Synchronous rusqlite calls run
//! inside `tokio::task::spawn_blocking`.
//!
//! # Forward Compatibility
//!
//! New `Review` fields must carry `#[serde(default)]` so that documents
//! written by older versions still decode.


use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{error, warn};

use super::{Cursor, ListFilter, Page, RepositoryError, ReviewRepository};
use crate::db::{from_nanos, lock, to_nanos, u64_to_i64, usize_to_i64_limit, Database};
use archreview_core::{Review, ReviewId, ReviewStatus};

/// SQLite-backed review store.
pub struct SqliteReviewRepository {
    db: Database,
}

impl SqliteReviewRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a repository over a fresh in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Ok(Self::new(Database::open_in_memory()?))
    }
}

/// Column values derived from a review.
struct ReviewRow {
    review_id: String,
    ts_nanos: i64,
    status: &'static str,
    claimed_at_nanos: Option<i64>,
    version: i64,
    review_json: String,
}

impl ReviewRow {
    fn from_review(review: &Review, operation: &'static str) -> Result<Self, RepositoryError> {
        Ok(Self {
            review_id: review.review_id.to_string(),
            ts_nanos: to_nanos(review.timestamp, operation)?,
            status: review.status.as_str(),
            claimed_at_nanos: review
                .claimed_at
                .map(|at| to_nanos(at, operation))
                .transpose()?,
            version: u64_to_i64(review.version, operation)?,
            review_json: serde_json::to_string(review)
                .map_err(|e| RepositoryError::storage(operation, e.to_string()))?,
        })
    }
}

fn decode_review(json: &str) -> Result<Review, RepositoryError> {
    serde_json::from_str(json).map_err(|_| RepositoryError::corruption("review JSON"))
}

/// Decode rows from a listing, skipping any that no longer parse.
fn decode_rows(rows: Vec<(String, String)>, operation: &str) -> Vec<Review> {
    rows.into_iter()
        .filter_map(|(review_id, json)| match decode_review(&json) {
            Ok(review) => Some(review),
            Err(e) => {
                warn!("Skipping review {} during {}: {}", review_id, operation, e);
                None
            }
        })
        .collect()
}

fn query_pairs(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
    operation: &'static str,
) -> Result<Vec<(String, String)>, RepositoryError> {
    query_rows(conn, sql, params, operation, |row| Ok((row.get(0)?, row.get(1)?)))
}

/// Run `sql`, logging and skipping rows that cannot be read.
fn query_rows<T>(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
    operation: &'static str,
    map: impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
) -> Result<Vec<T>, RepositoryError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?;
    let rows = stmt
        .query_map(params, map)
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?;

    let mut result = Vec::new();
    for row in rows {
        match row {
            Ok(pair) => result.push(pair),
            Err(e) => error!("Failed to read row during {}: {}", operation, e),
        }
    }
    Ok(result)
}

#[async_trait]
impl ReviewRepository for SqliteReviewRepository {
    async fn insert(&self, review: &Review) -> Result<(), RepositoryError> {
        let conn = self.db.connection();
        let row = ReviewRow::from_review(review, "insert")?;
        let review_id = review.review_id;

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn, "insert")?;
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO reviews
                        (review_id, ts_nanos, status, claimed_at_nanos, version, review_json)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        row.review_id,
                        row.ts_nanos,
                        row.status,
                        row.claimed_at_nanos,
                        row.version,
                        row.review_json
                    ],
                )
                .map_err(|e| RepositoryError::storage("insert", e.to_string()))?;

            if inserted == 0 {
                Err(RepositoryError::AlreadyExists(review_id))
            } else {
                Ok(())
            }
        })
        .await
        .map_err(|e| RepositoryError::storage("insert", e.to_string()))?
    }

    async fn get(&self, id: ReviewId) -> Result<Option<Review>, RepositoryError> {
        let conn = self.db.connection();
        let review_id = id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn, "get")?;
            let json: Option<String> = conn
                .query_row(
                    "SELECT review_json FROM reviews WHERE review_id = ?1",
                    params![review_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| RepositoryError::storage("get", e.to_string()))?;

            json.map(|json| decode_review(&json)).transpose()
        })
        .await
        .map_err(|e| RepositoryError::storage("get", e.to_string()))?
    }

    async fn delete(&self, id: ReviewId) -> Result<bool, RepositoryError> {
        let conn = self.db.connection();
        let review_id = id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn, "delete")?;
            let deleted = conn
                .execute(
                    "DELETE FROM reviews WHERE review_id = ?1",
                    params![review_id],
                )
                .map_err(|e| RepositoryError::storage("delete", e.to_string()))?;
            Ok(deleted > 0)
        })
        .await
        .map_err(|e| RepositoryError::storage("delete", e.to_string()))?
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        review: &Review,
    ) -> Result<bool, RepositoryError> {
        let conn = self.db.connection();
        let row = ReviewRow::from_review(review, "compare_and_swap")?;
        let expected = u64_to_i64(expected_version, "compare_and_swap")?;

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn, "compare_and_swap")?;
            conn.execute(
                "UPDATE reviews
                 SET status = ?1, claimed_at_nanos = ?2, version = ?3, review_json = ?4
                 WHERE review_id = ?5 AND version = ?6",
                params![
                    row.status,
                    row.claimed_at_nanos,
                    row.version,
                    row.review_json,
                    row.review_id,
                    expected
                ],
            )
            .map_err(|e| RepositoryError::storage("compare_and_swap", e.to_string()))?;

            Ok(conn.changes() > 0)
        })
        .await
        .map_err(|e| RepositoryError::storage("compare_and_swap", e.to_string()))?
    }

    async fn list(
        &self,
        filter: ListFilter,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<Page, RepositoryError> {
        let conn = self.db.connection();
        let fetch = usize_to_i64_limit(limit.saturating_add(1), "list")?;
        let status = filter.status.map(|s| s.as_str());
        let cursor = match after {
            Some(c) => Some((to_nanos(c.timestamp, "list")?, c.review_id.to_string())),
            None => None,
        };

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn, "list")?;
            let (cursor_ts, cursor_id) = match &cursor {
                Some((ts, id)) => (Some(*ts), Some(id.as_str())),
                None => (None, None),
            };

            // Row-value comparison keeps the (timestamp, id) order strict.
            let mut rows: Vec<(String, i64, String)> = query_rows(
                &conn,
                "SELECT review_id, ts_nanos, review_json FROM reviews
                 WHERE (?1 IS NULL OR status = ?1)
                   AND (?2 IS NULL OR (ts_nanos, review_id) < (?2, ?3))
                 ORDER BY ts_nanos DESC, review_id DESC
                 LIMIT ?4",
                params![status, cursor_ts, cursor_id, fetch],
                "list",
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;

            // The cursor comes from the raw rows so that a row skipped while
            // decoding neither ends the listing nor shifts the next page.
            let has_more = rows.len() > limit;
            rows.truncate(limit);
            let next = match rows.last() {
                Some((review_id, ts_nanos, _)) if has_more => Some(Cursor {
                    timestamp: from_nanos(*ts_nanos),
                    review_id: review_id.parse().map_err(|_| {
                        RepositoryError::corruption(format!("review id '{}'", review_id))
                    })?,
                }),
                _ => None,
            };

            let rows = rows
                .into_iter()
                .map(|(review_id, _, json)| (review_id, json))
                .collect();
            Ok(Page {
                items: decode_rows(rows, "list"),
                next,
            })
        })
        .await
        .map_err(|e| RepositoryError::storage("list", e.to_string()))?
    }

    async fn find_stale_in_progress(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<Review>, RepositoryError> {
        let conn = self.db.connection();
        let before = to_nanos(claimed_before, "find_stale_in_progress")?;

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn, "find_stale_in_progress")?;
            let rows = query_pairs(
                &conn,
                "SELECT review_id, review_json FROM reviews
                 WHERE status = ?1
                   AND (claimed_at_nanos IS NULL OR claimed_at_nanos < ?2)
                 ORDER BY claimed_at_nanos ASC",
                params![ReviewStatus::InProgress.as_str(), before],
                "find_stale_in_progress",
            )?;
            Ok(decode_rows(rows, "find_stale_in_progress"))
        })
        .await
        .map_err(|e| RepositoryError::storage("find_stale_in_progress", e.to_string()))?
    }

    async fn count_by_status(&self) -> Result<BTreeMap<ReviewStatus, u64>, RepositoryError> {
        let conn = self.db.connection();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn, "count_by_status")?;
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM reviews GROUP BY status")
                .map_err(|e| RepositoryError::storage("count_by_status", e.to_string()))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
                .map_err(|e| RepositoryError::storage("count_by_status", e.to_string()))?;

            let mut counts = BTreeMap::new();
            for row in rows {
                let (status, count) =
                    row.map_err(|e| RepositoryError::storage("count_by_status", e.to_string()))?;
                match status.parse::<ReviewStatus>() {
                    Ok(status) => {
                        counts.insert(status, u64::try_from(count).unwrap_or(0));
                    }
                    Err(_) => warn!("Ignoring {} reviews with unknown status '{}'", count, status),
                }
            }
            Ok(counts)
        })
        .await
        .map_err(|e| RepositoryError::storage("count_by_status", e.to_string()))?
    }
}
