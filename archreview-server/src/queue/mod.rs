//! Work queue with at-least-once delivery.
//!
//! A delivered item stays invisible for the visibility timeout passed to
//! [`WorkQueue::receive`]. Unless it is acknowledged within that window it
//! becomes visible again. Each delivery carries a fresh [`Receipt`]; an
//! `ack` or `release` with the receipt of an earlier delivery does nothing.
//!
//! An item that has already been received `max_receive_count` times moves to
//! the dead-letter channel instead of being delivered again.

mod memory;
mod sqlite;

pub use memory::InMemoryWorkQueue;
pub use sqlite::SqliteWorkQueue;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::store::RepositoryError;
use archreview_core::ReviewId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("queue error during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },
    #[error("corrupt {0} in queue")]
    Corruption(String),
}

impl QueueError {
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

impl From<RepositoryError> for QueueError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Corruption(what) => Self::Corruption(what),
            RepositoryError::Storage { operation, message } => Self::Storage { operation, message },
            other => Self::storage("database", other.to_string()),
        }
    }
}

/// Identity of a queued item, stable across deliveries and dead-lettering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle for one delivery of an item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Receipt(pub String);

impl Receipt {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for Receipt {
    fn default() -> Self {
        Self::new()
    }
}

/// An item handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message_id: MessageId,
    pub review_id: ReviewId,
    pub receipt: Receipt,
    /// How many times the item has been delivered, this delivery included.
    pub receive_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// An item that exhausted its receive budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub message_id: MessageId,
    pub review_id: ReviewId,
    pub receive_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueDepth {
    /// Items ready for delivery.
    pub visible: u64,
    /// Items delivered and not yet acknowledged or released.
    pub in_flight: u64,
    /// Items waiting for a later delivery after a release.
    pub delayed: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    pub max_receive_count: u32,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_receive_count: 3,
        }
    }
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Add a work item for `review_id`.
    async fn enqueue(&self, review_id: ReviewId) -> Result<MessageId, QueueError>;

    /// Deliver up to `max_items` visible items, hiding each for `visibility_timeout`.
    async fn receive(
        &self,
        max_items: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Delivery>, QueueError>;

    /// Remove a delivered item. Returns `false` if the receipt is stale.
    async fn ack(&self, receipt: &Receipt) -> Result<bool, QueueError>;

    /// Make a delivered item visible again after `delay`. Returns `false` if
    /// the receipt is stale.
    async fn release(&self, receipt: &Receipt, delay: Duration) -> Result<bool, QueueError>;

    /// Whether any live item (visible, delayed or in flight) references `review_id`.
    async fn has_outstanding(&self, review_id: ReviewId) -> Result<bool, QueueError>;

    /// Whether an item for `review_id` sits in the dead-letter channel.
    async fn has_dead_letter(&self, review_id: ReviewId) -> Result<bool, QueueError>;

    /// Most recently dead-lettered items first.
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError>;

    /// Move a dead-lettered item back to the queue with a fresh receive budget.
    /// Returns `false` if no such dead letter exists.
    async fn redrive(&self, message_id: &MessageId) -> Result<bool, QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;
}

/// `now + duration`, saturating instead of overflowing.
pub(crate) fn after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Behaviour every `WorkQueue` implementation must share.

    use super::*;

    fn review() -> ReviewId {
        ReviewId::new()
    }

    const LONG: Duration = Duration::from_secs(600);

    pub async fn delivers_once_while_invisible(queue: &dyn WorkQueue) {
        let id = review();
        let message_id = queue.enqueue(id).await.unwrap();

        let first = queue.receive(10, LONG).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].message_id, message_id);
        assert_eq!(first[0].review_id, id);
        assert_eq!(first[0].receive_count, 1);

        assert!(queue.receive(10, LONG).await.unwrap().is_empty());
        assert!(queue.has_outstanding(id).await.unwrap());

        assert!(queue.ack(&first[0].receipt).await.unwrap());
        assert!(!queue.has_outstanding(id).await.unwrap());
        assert_eq!(queue.depth().await.unwrap(), QueueDepth::default());
    }

    pub async fn redelivers_after_visibility_timeout(queue: &dyn WorkQueue) {
        let id = review();
        queue.enqueue(id).await.unwrap();

        let first = queue.receive(1, Duration::from_millis(20)).await.unwrap();
        assert_eq!(first.len(), 1);
        tokio::time::sleep(Duration::from_millis(60)).await;

        let second = queue.receive(1, LONG).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message_id, first[0].message_id);
        assert_eq!(second[0].receive_count, 2);
        assert_ne!(second[0].receipt, first[0].receipt);

        // The first worker's receipt is stale now.
        assert!(!queue.ack(&first[0].receipt).await.unwrap());
        assert!(!queue
            .release(&first[0].receipt, Duration::ZERO)
            .await
            .unwrap());
        assert!(queue.ack(&second[0].receipt).await.unwrap());
    }

    pub async fn release_makes_item_visible(queue: &dyn WorkQueue) {
        let id = review();
        queue.enqueue(id).await.unwrap();

        let first = queue.receive(1, LONG).await.unwrap();
        assert!(queue.release(&first[0].receipt, Duration::ZERO).await.unwrap());
        let second = queue.receive(1, LONG).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].receive_count, 2);
    }

    pub async fn release_with_delay_hides_item(queue: &dyn WorkQueue) {
        queue.enqueue(review()).await.unwrap();
        let first = queue.receive(1, LONG).await.unwrap();
        assert!(queue.release(&first[0].receipt, LONG).await.unwrap());

        assert!(queue.receive(1, LONG).await.unwrap().is_empty());
        let depth = queue.depth().await.unwrap();
        assert_eq!(depth.delayed, 1);
        assert_eq!(depth.visible, 0);
        assert_eq!(depth.in_flight, 0);
    }

    pub async fn dead_letters_after_max_receives(queue: &dyn WorkQueue) {
        let id = review();
        let message_id = queue.enqueue(id).await.unwrap();

        for attempt in 1..=3 {
            let delivery = queue.receive(1, LONG).await.unwrap();
            assert_eq!(delivery.len(), 1, "attempt {attempt}");
            assert_eq!(delivery[0].receive_count, attempt);
            queue
                .release(&delivery[0].receipt, Duration::ZERO)
                .await
                .unwrap();
        }

        assert!(queue.receive(1, LONG).await.unwrap().is_empty());
        assert!(!queue.has_outstanding(id).await.unwrap());
        assert!(queue.has_dead_letter(id).await.unwrap());
        assert!(!queue.has_dead_letter(review()).await.unwrap());

        let dead = queue.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_id, message_id);
        assert_eq!(dead[0].review_id, id);
        assert_eq!(dead[0].receive_count, 3);
        assert_eq!(queue.depth().await.unwrap().dead_lettered, 1);

        assert!(queue.redrive(&message_id).await.unwrap());
        assert!(!queue.redrive(&message_id).await.unwrap());
        assert!(queue.dead_letters(10).await.unwrap().is_empty());
        assert!(!queue.has_dead_letter(id).await.unwrap());

        let redriven = queue.receive(1, LONG).await.unwrap();
        assert_eq!(redriven.len(), 1);
        assert_eq!(redriven[0].message_id, message_id);
        assert_eq!(redriven[0].receive_count, 1);
    }

    pub async fn poisoned_item_does_not_block_others(queue: &dyn WorkQueue) {
        let poisoned = review();
        queue.enqueue(poisoned).await.unwrap();
        let healthy = review();
        queue.enqueue(healthy).await.unwrap();

        let first = queue.receive(1, LONG).await.unwrap();
        assert_eq!(first[0].review_id, poisoned);
        queue
            .release(&first[0].receipt, Duration::ZERO)
            .await
            .unwrap();

        let batch = queue.receive(10, LONG).await.unwrap();
        let ids: Vec<_> = batch.iter().map(|d| d.review_id).collect();
        assert!(ids.contains(&healthy));
        assert!(ids.contains(&poisoned));
    }

    pub async fn receive_respects_max_items(queue: &dyn WorkQueue) {
        for _ in 0..5 {
            queue.enqueue(review()).await.unwrap();
        }
        assert_eq!(queue.receive(2, LONG).await.unwrap().len(), 2);
        assert_eq!(queue.receive(0, LONG).await.unwrap().len(), 0);
        let depth = queue.depth().await.unwrap();
        assert_eq!(depth.visible, 3);
        assert_eq!(depth.in_flight, 2);
    }
}
