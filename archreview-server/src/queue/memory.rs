//! In-memory implementation of `WorkQueue`. Items are lost on restart.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use super::{
    after, DeadLetter, Delivery, MessageId, QueueDepth, QueueError, QueuePolicy, Receipt,
    WorkQueue,
};
use archreview_core::ReviewId;

#[derive(Debug, Clone)]
struct Item {
    seq: u64,
    review_id: ReviewId,
    receive_count: u32,
    enqueued_at: DateTime<Utc>,
    visible_at: DateTime<Utc>,
    receipt: Option<Receipt>,
}

#[derive(Default)]
struct State {
    next_seq: u64,
    items: HashMap<MessageId, Item>,
    dead: HashMap<MessageId, DeadLetter>,
}

impl State {
    fn push(&mut self, message_id: MessageId, review_id: ReviewId, enqueued_at: DateTime<Utc>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.items.insert(
            message_id,
            Item {
                seq,
                review_id,
                receive_count: 0,
                enqueued_at,
                visible_at: Utc::now(),
                receipt: None,
            },
        );
    }

    fn find_by_receipt(&mut self, receipt: &Receipt) -> Option<(MessageId, &mut Item)> {
        self.items
            .iter_mut()
            .find(|(_, item)| item.receipt.as_ref() == Some(receipt))
            .map(|(id, item)| (id.clone(), item))
    }
}

pub struct InMemoryWorkQueue {
    policy: QueuePolicy,
    state: Mutex<State>,
}

impl InMemoryWorkQueue {
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(State::default()),
        }
    }
}

impl Default for InMemoryWorkQueue {
    fn default() -> Self {
        Self::new(QueuePolicy::default())
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, review_id: ReviewId) -> Result<MessageId, QueueError> {
        let message_id = MessageId::new();
        let mut state = self.state.lock().await;
        state.push(message_id.clone(), review_id, Utc::now());
        Ok(message_id)
    }

    async fn receive(
        &self,
        max_items: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let mut visible: Vec<(DateTime<Utc>, u64, MessageId)> = state
            .items
            .iter()
            .filter(|(_, item)| item.visible_at <= now)
            .map(|(id, item)| (item.visible_at, item.seq, id.clone()))
            .collect();
        visible.sort();

        let mut deliveries = Vec::new();
        for (_, _, message_id) in visible {
            if deliveries.len() >= max_items {
                break;
            }
            let Some(item) = state.items.get_mut(&message_id) else {
                continue;
            };

            if item.receive_count >= self.policy.max_receive_count {
                let dead = DeadLetter {
                    message_id: message_id.clone(),
                    review_id: item.review_id,
                    receive_count: item.receive_count,
                    enqueued_at: item.enqueued_at,
                    dead_lettered_at: now,
                };
                warn!(
                    "Moving message {} for review {} to dead letters after {} receives",
                    message_id, dead.review_id, dead.receive_count
                );
                state.items.remove(&message_id);
                state.dead.insert(message_id, dead);
                continue;
            }

            let receipt = Receipt::new();
            item.receive_count += 1;
            item.visible_at = after(now, visibility_timeout);
            item.receipt = Some(receipt.clone());
            deliveries.push(Delivery {
                message_id,
                review_id: item.review_id,
                receipt,
                receive_count: item.receive_count,
                enqueued_at: item.enqueued_at,
            });
        }

        Ok(deliveries)
    }

    async fn ack(&self, receipt: &Receipt) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        match state.find_by_receipt(receipt).map(|(id, _)| id) {
            Some(message_id) => {
                state.items.remove(&message_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release(&self, receipt: &Receipt, delay: Duration) -> Result<bool, QueueError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        match state.find_by_receipt(receipt) {
            Some((_, item)) => {
                item.visible_at = after(now, delay);
                item.receipt = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn has_outstanding(&self, review_id: ReviewId) -> Result<bool, QueueError> {
        let state = self.state.lock().await;
        Ok(state.items.values().any(|item| item.review_id == review_id))
    }

    async fn has_dead_letter(&self, review_id: ReviewId) -> Result<bool, QueueError> {
        let state = self.state.lock().await;
        Ok(state.dead.values().any(|dead| dead.review_id == review_id))
    }

    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let state = self.state.lock().await;
        let mut dead: Vec<DeadLetter> = state.dead.values().cloned().collect();
        dead.sort_by(|a, b| b.dead_lettered_at.cmp(&a.dead_lettered_at));
        dead.truncate(limit);
        Ok(dead)
    }

    async fn redrive(&self, message_id: &MessageId) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        match state.dead.remove(message_id) {
            Some(dead) => {
                state.push(message_id.clone(), dead.review_id, dead.enqueued_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let now = Utc::now();
        let state = self.state.lock().await;
        let mut depth = QueueDepth {
            dead_lettered: state.dead.len() as u64,
            ..QueueDepth::default()
        };
        for item in state.items.values() {
            if item.receipt.is_some() {
                depth.in_flight += 1;
            } else if item.visible_at <= now {
                depth.visible += 1;
            } else {
                depth.delayed += 1;
            }
        }
        Ok(depth)
    }
}
