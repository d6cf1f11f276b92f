//! In-memory implementation of `ReviewRepository`.
//!
//! All reviews are lost on restart. Used with `STORAGE_BACKEND=memory` and in
//! tests.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{Cursor, ListFilter, Page, RepositoryError, ReviewRepository};
use archreview_core::{Review, ReviewId, ReviewStatus};

pub struct InMemoryReviewRepository {
    reviews: RwLock<HashMap<ReviewId, Review>>,
}

impl InMemoryReviewRepository {
    pub fn new() -> Self {
        Self {
            reviews: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryReviewRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReviewRepository for InMemoryReviewRepository {
    async fn insert(&self, review: &Review) -> Result<(), RepositoryError> {
        let mut reviews = self.reviews.write().await;
        if reviews.contains_key(&review.review_id) {
            return Err(RepositoryError::AlreadyExists(review.review_id));
        }
        reviews.insert(review.review_id, review.clone());
        Ok(())
    }

    async fn get(&self, id: ReviewId) -> Result<Option<Review>, RepositoryError> {
        let reviews = self.reviews.read().await;
        Ok(reviews.get(&id).cloned())
    }

    async fn delete(&self, id: ReviewId) -> Result<bool, RepositoryError> {
        let mut reviews = self.reviews.write().await;
        Ok(reviews.remove(&id).is_some())
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        review: &Review,
    ) -> Result<bool, RepositoryError> {
        let mut reviews = self.reviews.write().await;
        match reviews.get_mut(&review.review_id) {
            Some(stored) if stored.version == expected_version => {
                *stored = review.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(
        &self,
        filter: ListFilter,
        after: Option<Cursor>,
        limit: usize,
    ) -> Result<Page, RepositoryError> {
        let reviews = self.reviews.read().await;
        let mut rows: Vec<&Review> = reviews
            .values()
            .filter(|review| filter.matches(review))
            .filter(|review| after.map_or(true, |cursor| Cursor::of(review) < cursor))
            .collect();
        rows.sort_by(|a, b| Cursor::of(b).cmp(&Cursor::of(a)));

        let rows = rows
            .into_iter()
            .take(limit.saturating_add(1))
            .cloned()
            .collect();
        Ok(Page::from_rows(rows, limit))
    }

    async fn find_stale_in_progress(
        &self,
        claimed_before: DateTime<Utc>,
    ) -> Result<Vec<Review>, RepositoryError> {
        let reviews = self.reviews.read().await;
        let mut stale: Vec<Review> = reviews
            .values()
            .filter(|review| review.status == ReviewStatus::InProgress)
            .filter(|review| review.claimed_at.map_or(true, |at| at < claimed_before))
            .cloned()
            .collect();
        stale.sort_by_key(|review| review.claimed_at);
        Ok(stale)
    }

    async fn count_by_status(&self) -> Result<BTreeMap<ReviewStatus, u64>, RepositoryError> {
        let reviews = self.reviews.read().await;
        let mut counts = BTreeMap::new();
        for review in reviews.values() {
            *counts.entry(review.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
