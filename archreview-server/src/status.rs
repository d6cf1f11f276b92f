//! Status types for the operator status endpoint.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ServiceError;
use crate::queue::{QueueDepth, WorkQueue};
use crate::store::ReviewRepository;
use archreview_core::ReviewStatus;

/// Review counts per status. Every status is present, zero or not.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewCounts {
    pub total: u64,
    pub pending: u64,
    pub in_progress: u64,
    pub completed: u64,
    pub failed: u64,
}

impl ReviewCounts {
    pub fn from_counts(counts: &BTreeMap<ReviewStatus, u64>) -> Self {
        let get = |status| counts.get(&status).copied().unwrap_or(0);
        Self {
            total: counts.values().sum(),
            pending: get(ReviewStatus::Pending),
            in_progress: get(ReviewStatus::InProgress),
            completed: get(ReviewStatus::Completed),
            failed: get(ReviewStatus::Failed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSummary {
    pub service: &'static str,
    pub version: String,
    pub reviews: ReviewCounts,
    pub queue: QueueDepth,
    pub generated_at: DateTime<Utc>,
}

impl StatusSummary {
    pub async fn collect(
        store: &dyn ReviewRepository,
        queue: &dyn WorkQueue,
        version: String,
    ) -> Result<Self, ServiceError> {
        let counts = store.count_by_status().await?;
        let queue = queue.depth().await?;
        Ok(Self {
            service: "archreview",
            version,
            reviews: ReviewCounts::from_counts(&counts),
            queue,
            generated_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryWorkQueue;
    use crate::store::InMemoryReviewRepository;
    use archreview_core::{Review, ReviewSubject};
    use std::time::Duration;

    #[test]
    fn test_missing_statuses_count_as_zero() {
        let mut counts = BTreeMap::new();
        counts.insert(ReviewStatus::Completed, 4);
        counts.insert(ReviewStatus::Failed, 1);
        let summary = ReviewCounts::from_counts(&counts);
        assert_eq!(
            summary,
            ReviewCounts {
                total: 5,
                pending: 0,
                in_progress: 0,
                completed: 4,
                failed: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_collect() {
        let store = InMemoryReviewRepository::new();
        let queue = InMemoryWorkQueue::default();
        for _ in 0..3 {
            let subject = ReviewSubject::parse("123456789012", "us-west-2", None).unwrap();
            let review = Review::new_pending(subject, Utc::now());
            store.insert(&review).await.unwrap();
            queue.enqueue(review.review_id).await.unwrap();
        }
        queue.receive(1, Duration::from_secs(60)).await.unwrap();

        let summary = StatusSummary::collect(&store, &queue, "abc12345".to_string())
            .await
            .unwrap();
        assert_eq!(summary.reviews.pending, 3);
        assert_eq!(summary.reviews.total, 3);
        assert_eq!(summary.queue.visible, 2);
        assert_eq!(summary.queue.in_flight, 1);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["service"], "archreview");
        assert_eq!(json["reviews"]["inProgress"], 0);
        assert_eq!(json["queue"]["deadLettered"], 0);
    }
}
