//! SQLite implementation of `WorkQueue`, sharing the database with the store.
//!
//! Times are stored as unix milliseconds. Each `receive` runs in a single
//! transaction so that two pollers can never be handed the same item.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::{error, warn};

use super::{
    after, DeadLetter, Delivery, MessageId, QueueDepth, QueueError, QueuePolicy, Receipt,
    WorkQueue,
};
use crate::db::{from_millis, lock, to_millis, usize_to_i64_limit, Database};
use archreview_core::ReviewId;

pub struct SqliteWorkQueue {
    db: Database,
    policy: QueuePolicy,
}

impl SqliteWorkQueue {
    pub fn new(db: Database, policy: QueuePolicy) -> Self {
        Self { db, policy }
    }
}

fn parse_review_id(raw: &str) -> Result<ReviewId, QueueError> {
    raw.parse()
        .map_err(|_| QueueError::corruption(format!("review id '{}'", raw)))
}

fn count_to_u32(value: i64) -> Result<u32, QueueError> {
    u32::try_from(value).map_err(|_| QueueError::corruption(format!("receive count {}", value)))
}

#[async_trait]
impl WorkQueue for SqliteWorkQueue {
    async fn enqueue(&self, review_id: ReviewId) -> Result<MessageId, QueueError> {
        let conn = self.db.connection();
        let message_id = MessageId::new();
        let id = message_id.0.clone();
        let now = to_millis(Utc::now());

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn, "enqueue")?;
            conn.execute(
                "INSERT INTO work_items (message_id, review_id, receive_count, enqueued_at, visible_at)
                 VALUES (?1, ?2, 0, ?3, ?3)",
                params![id, review_id.to_string(), now],
            )
            .map_err(|e| QueueError::storage("enqueue", e.to_string()))?;
            Ok::<_, QueueError>(())
        })
        .await
        .map_err(|e| QueueError::storage("enqueue", e.to_string()))??;

        Ok(message_id)
    }

    async fn receive(
        &self,
        max_items: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        if max_items == 0 {
            return Ok(Vec::new());
        }

        let conn = self.db.connection();
        let max_receive_count = i64::from(self.policy.max_receive_count);
        let now_at = Utc::now();
        let now = to_millis(now_at);
        let hidden_until = to_millis(after(now_at, visibility_timeout));
        let limit = usize_to_i64_limit(max_items, "receive")?;

        tokio::task::spawn_blocking(move || {
            let mut conn = lock(&conn, "receive")?;
            let tx = conn
                .transaction()
                .map_err(|e| QueueError::storage("receive", e.to_string()))?;

            // Exhausted items are dead-lettered before they can be picked.
            let exhausted = tx
                .execute(
                    "INSERT INTO dead_letters
                        (message_id, review_id, receive_count, enqueued_at, dead_lettered_at)
                     SELECT message_id, review_id, receive_count, enqueued_at, ?1
                     FROM work_items
                     WHERE visible_at <= ?1 AND receive_count >= ?2",
                    params![now, max_receive_count],
                )
                .map_err(|e| QueueError::storage("receive", e.to_string()))?;
            if exhausted > 0 {
                tx.execute(
                    "DELETE FROM work_items WHERE visible_at <= ?1 AND receive_count >= ?2",
                    params![now, max_receive_count],
                )
                .map_err(|e| QueueError::storage("receive", e.to_string()))?;
                warn!("Moved {} exhausted work item(s) to dead letters", exhausted);
            }

            let candidates: Vec<(String, String, i64, i64)> = {
                let mut stmt = tx
                    .prepare(
                        "SELECT message_id, review_id, receive_count, enqueued_at
                         FROM work_items
                         WHERE visible_at <= ?1
                         ORDER BY visible_at ASC, rowid ASC
                         LIMIT ?2",
                    )
                    .map_err(|e| QueueError::storage("receive", e.to_string()))?;
                let rows = stmt
                    .query_map(params![now, limit], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })
                    .map_err(|e| QueueError::storage("receive", e.to_string()))?;
                rows.collect::<Result<_, _>>()
                    .map_err(|e| QueueError::storage("receive", e.to_string()))?
            };

            let mut deliveries = Vec::with_capacity(candidates.len());
            for (message_id, review_id, receive_count, enqueued_at) in candidates {
                let review_id = match parse_review_id(&review_id) {
                    Ok(id) => id,
                    Err(e) => {
                        error!("Dropping work item {}: {}", message_id, e);
                        tx.execute(
                            "DELETE FROM work_items WHERE message_id = ?1",
                            params![message_id],
                        )
                        .map_err(|e| QueueError::storage("receive", e.to_string()))?;
                        continue;
                    }
                };

                let receipt = Receipt::new();
                tx.execute(
                    "UPDATE work_items
                     SET receive_count = receive_count + 1, visible_at = ?1, receipt = ?2
                     WHERE message_id = ?3",
                    params![hidden_until, receipt.0, message_id],
                )
                .map_err(|e| QueueError::storage("receive", e.to_string()))?;

                deliveries.push(Delivery {
                    message_id: MessageId(message_id),
                    review_id,
                    receipt,
                    receive_count: count_to_u32(receive_count + 1)?,
                    enqueued_at: from_millis(enqueued_at, "work item enqueue time")?,
                });
            }

            tx.commit()
                .map_err(|e| QueueError::storage("receive", e.to_string()))?;
            Ok(deliveries)
        })
        .await
        .map_err(|e| QueueError::storage("receive", e.to_string()))?
    }

    async fn ack(&self, receipt: &Receipt) -> Result<bool, QueueError> {
        let conn = self.db.connection();
        let receipt = receipt.0.clone();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn, "ack")?;
            let deleted = conn
                .execute(
                    "DELETE FROM work_items WHERE receipt = ?1",
                    params![receipt],
                )
                .map_err(|e| QueueError::storage("ack", e.to_string()))?;
            Ok(deleted > 0)
        })
        .await
        .map_err(|e| QueueError::storage("ack", e.to_string()))?
    }

    async fn release(&self, receipt: &Receipt, delay: Duration) -> Result<bool, QueueError> {
        let conn = self.db.connection();
        let receipt = receipt.0.clone();
        let visible_at = to_millis(after(Utc::now(), delay));

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn, "release")?;
            let updated = conn
                .execute(
                    "UPDATE work_items SET visible_at = ?1, receipt = NULL WHERE receipt = ?2",
                    params![visible_at, receipt],
                )
                .map_err(|e| QueueError::storage("release", e.to_string()))?;
            Ok(updated > 0)
        })
        .await
        .map_err(|e| QueueError::storage("release", e.to_string()))?
    }

    async fn has_outstanding(&self, review_id: ReviewId) -> Result<bool, QueueError> {
        let conn = self.db.connection();
        let review_id = review_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn, "has_outstanding")?;
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM work_items WHERE review_id = ?1 LIMIT 1",
                    params![review_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| QueueError::storage("has_outstanding", e.to_string()))?;
            Ok(found.is_some())
        })
        .await
        .map_err(|e| QueueError::storage("has_outstanding", e.to_string()))?
    }

    async fn has_dead_letter(&self, review_id: ReviewId) -> Result<bool, QueueError> {
        let conn = self.db.connection();
        let review_id = review_id.to_string();

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn, "has_dead_letter")?;
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM dead_letters WHERE review_id = ?1 LIMIT 1",
                    params![review_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| QueueError::storage("has_dead_letter", e.to_string()))?;
            Ok(found.is_some())
        })
        .await
        .map_err(|e| QueueError::storage("has_dead_letter", e.to_string()))?
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let conn = self.db.connection();
        let limit = usize_to_i64_limit(limit, "dead_letters")?;

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn, "dead_letters")?;
            let mut stmt = conn
                .prepare(
                    "SELECT message_id, review_id, receive_count, enqueued_at, dead_lettered_at
                     FROM dead_letters
                     ORDER BY dead_lettered_at DESC, rowid DESC
                     LIMIT ?1",
                )
                .map_err(|e| QueueError::storage("dead_letters", e.to_string()))?;
            let rows = stmt
                .query_map(params![limit], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })
                .map_err(|e| QueueError::storage("dead_letters", e.to_string()))?;

            let mut dead = Vec::new();
            for row in rows {
                let (message_id, review_id, receive_count, enqueued_at, dead_lettered_at) =
                    row.map_err(|e| QueueError::storage("dead_letters", e.to_string()))?;
                let decoded = (|| {
                    Ok::<_, QueueError>(DeadLetter {
                        review_id: parse_review_id(&review_id)?,
                        receive_count: count_to_u32(receive_count)?,
                        enqueued_at: from_millis(enqueued_at, "dead letter enqueue time")?,
                        dead_lettered_at: from_millis(dead_lettered_at, "dead letter time")?,
                        message_id: MessageId(message_id.clone()),
                    })
                })();
                match decoded {
                    Ok(letter) => dead.push(letter),
                    Err(e) => warn!("Skipping dead letter {}: {}", message_id, e),
                }
            }
            Ok(dead)
        })
        .await
        .map_err(|e| QueueError::storage("dead_letters", e.to_string()))?
    }

    async fn redrive(&self, message_id: &MessageId) -> Result<bool, QueueError> {
        let conn = self.db.connection();
        let message_id = message_id.0.clone();
        let now = to_millis(Utc::now());

        tokio::task::spawn_blocking(move || {
            let mut conn = lock(&conn, "redrive")?;
            let tx = conn
                .transaction()
                .map_err(|e| QueueError::storage("redrive", e.to_string()))?;

            let moved = tx
                .execute(
                    "INSERT INTO work_items (message_id, review_id, receive_count, enqueued_at, visible_at)
                     SELECT message_id, review_id, 0, enqueued_at, ?2
                     FROM dead_letters WHERE message_id = ?1",
                    params![message_id, now],
                )
                .map_err(|e| QueueError::storage("redrive", e.to_string()))?;
            if moved == 0 {
                return Ok(false);
            }

            tx.execute(
                "DELETE FROM dead_letters WHERE message_id = ?1",
                params![message_id],
            )
            .map_err(|e| QueueError::storage("redrive", e.to_string()))?;
            tx.commit()
                .map_err(|e| QueueError::storage("redrive", e.to_string()))?;
            Ok(true)
        })
        .await
        .map_err(|e| QueueError::storage("redrive", e.to_string()))?
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let conn = self.db.connection();
        let now = to_millis(Utc::now());

        tokio::task::spawn_blocking(move || {
            let conn = lock(&conn, "depth")?;
            let (visible, in_flight, delayed): (i64, i64, i64) = conn
                .query_row(
                    "SELECT
                        COALESCE(SUM(CASE WHEN receipt IS NULL AND visible_at <= ?1 THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN receipt IS NOT NULL THEN 1 ELSE 0 END), 0),
                        COALESCE(SUM(CASE WHEN receipt IS NULL AND visible_at > ?1 THEN 1 ELSE 0 END), 0)
                     FROM work_items",
                    params![now],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .map_err(|e| QueueError::storage("depth", e.to_string()))?;
            let dead_lettered: i64 = conn
                .query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))
                .map_err(|e| QueueError::storage("depth", e.to_string()))?;

            let non_negative = |v: i64| u64::try_from(v).unwrap_or(0);
            Ok(QueueDepth {
                visible: non_negative(visible),
                in_flight: non_negative(in_flight),
                delayed: non_negative(delayed),
                dead_lettered: non_negative(dead_lettered),
            })
        })
        .await
        .map_err(|e| QueueError::storage("depth", e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::conformance;

    fn queue() -> SqliteWorkQueue {
        SqliteWorkQueue::new(
            Database::open_in_memory().unwrap(),
            QueuePolicy::default(),
        )
    }

    #[tokio::test]
    async fn test_delivers_once_while_invisible() {
        conformance::delivers_once_while_invisible(&queue()).await;
    }

    #[tokio::test]
    async fn test_redelivers_after_visibility_timeout() {
        conformance::redelivers_after_visibility_timeout(&queue()).await;
    }

    #[tokio::test]
    async fn test_release_makes_item_visible() {
        conformance::release_makes_item_visible(&queue()).await;
    }

    #[tokio::test]
    async fn test_release_with_delay_hides_item() {
        conformance::release_with_delay_hides_item(&queue()).await;
    }

    #[tokio::test]
    async fn test_dead_letters_after_max_receives() {
        conformance::dead_letters_after_max_receives(&queue()).await;
    }

    #[tokio::test]
    async fn test_poisoned_item_does_not_block_others() {
        conformance::poisoned_item_does_not_block_others(&queue()).await;
    }

    #[tokio::test]
    async fn test_receive_respects_max_items() {
        conformance::receive_respects_max_items(&queue()).await;
    }

    #[tokio::test]
    async fn test_items_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archreview-state.db");
        let review_id = ReviewId::new();

        {
            let queue = SqliteWorkQueue::new(Database::open(&path).unwrap(), QueuePolicy::default());
            queue.enqueue(review_id).await.unwrap();
        }

        let queue = SqliteWorkQueue::new(Database::open(&path).unwrap(), QueuePolicy::default());
        assert!(queue.has_outstanding(review_id).await.unwrap());
        let delivered = queue.receive(1, Duration::from_secs(60)).await.unwrap();
        assert_eq!(delivered[0].review_id, review_id);
    }

    #[tokio::test]
    async fn test_custom_receive_budget() {
        let queue = SqliteWorkQueue::new(
            Database::open_in_memory().unwrap(),
            QueuePolicy {
                max_receive_count: 1,
            },
        );
        queue.enqueue(ReviewId::new()).await.unwrap();
        let first = queue.receive(1, Duration::from_secs(60)).await.unwrap();
        queue
            .release(&first[0].receipt, Duration::ZERO)
            .await
            .unwrap();
        assert!(queue
            .receive(1, Duration::from_secs(60))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(queue.depth().await.unwrap().dead_lettered, 1);
    }
}
