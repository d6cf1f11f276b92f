//! Review store abstraction.
//!
//! The store is the system of record for reviews. Writes that change a
//! review's status go through [`ReviewRepository::compare_and_swap`], which
//! only applies when the stored `version` still matches the one the caller
//! read.

mod memory;
pub mod sqlite;

pub use memory::InMemoryReviewRepository;
pub use sqlite::SqliteReviewRepository;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use archreview_core::{Review, ReviewId, ReviewStatus};

/// Errors from a storage back-end.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error("storage error during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },
    #[error("corrupt {0} in storage")]
    Corruption(String),
    #[error("review {0} already exists")]
    AlreadyExists(ReviewId),
}

impl RepositoryError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        Self::Corruption(what.into())
    }
}

/// Position in the listing order, exclusive.
///
/// Reviews are listed newest first by `(timestamp, reviewId)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub timestamp: DateTime<Utc>,
    pub review_id: ReviewId,
}

impl Cursor {
    pub fn of(review: &Review) -> Self {
        Self {
            timestamp: review.timestamp,
            review_id: review.review_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub status: Option<ReviewStatus>,
}

impl ListFilter {
    pub fn status(status: ReviewStatus) -> Self {
        Self {
            status: Some(status),
        }
    }

    pub fn matches(&self, review: &Review) -> bool {
        self.status.map_or(true, |status| review.status == status)
    }
}

/// One page of a listing. `next` is set when more items may follow.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<Review>,
    pub next: Option<Cursor>,
}

impl Page {
    /// Build a page from up to `limit + 1` ordered rows.
    pub(crate) fn from_rows(mut rows: Vec<Review>, limit: usize) -> Self {
        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let next = if has_more {
            rows.last().map(Cursor::of)
        } else {
            None
        };
        Self { items: rows, next }
    }
}

/// Durable keyed storage for reviews.
#[async_trait]
pub trait ReviewRepository: Send + Sync {
    /// Insert a new review. Fails with `AlreadyExists` if the id is taken.
    async fn insert(&self, review: &Review) -> Result<(), RepositoryError>;

    async fn get(&self, id: ReviewId) -> Result<Option<Review>, RepositoryError>;

    /// Remove a review. Only used to compensate a failed submission.
    async fn delete(&self, id: ReviewId) -> Result<bool, RepositoryError>;

    /// Replace the stored review if its version is still `expected_version`.
    ///
    /// Returns `false` without writing when the review is missing or another
    /// writer got there first.
    async fn compare_and_swap(
        &self,
        expected_version: u64,
        review: &Review,
    ) -> Result<bool, RepositoryError>;

    /// List reviews strictly after `after`, newest first.
    async fn list(
        &self,
        filter: ListFilter,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<Page, RepositoryError>;

    /// `IN_PROGRESS` reviews claimed before `claimed_before`.
    async fn find_stale_in_progress(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<Review>, RepositoryError>;

    /// Number of reviews per status. Statuses with no reviews are omitted.
    async fn count_by_status(&self) -> Result<BTreeMap<ReviewStatus, u64>, RepositoryError>;
}
