//! Review worker: consumes work items and drives reviews to a terminal status.
//!
//! A work item is only a pointer to a review. The worker claims the review
//! with a conditional write, so of two workers racing on the same review only
//! one invokes the agent. A redelivered item for a review that has already
//! moved past `PENDING` is acknowledged without side effects. One that finds
//! a live `IN_PROGRESS` claim is released until that claim goes stale, so a
//! crashed worker's review is picked up by the queue's own redelivery.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::lifecycle::{apply, stale_before, Transition, TransitionError};
use crate::notifier::ChangeNotifier;
use crate::queue::{after, Delivery, MessageId, QueueError, WorkQueue};
use crate::store::{RepositoryError, ReviewRepository};
use archreview_core::{AgentError, AgentRequest, Review, ReviewAgent, ReviewId, ReviewStatus};

/// Added to a deferral so the redelivery lands after the claim is stale.
const CLAIM_EXPIRY_MARGIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub agent_timeout: Duration,
    /// Age after which an `IN_PROGRESS` claim may be taken over.
    pub stale_after: Duration,
    pub visibility_timeout: Duration,
    /// Delay before a failed item is offered again.
    pub retry_delay: Duration,
    pub batch_size: usize,
    /// Idle wait when the queue is empty.
    pub batch_window: Duration,
}

/// What processing one work item did.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    Completed(Review),
    Failed(Review),
    /// The review was not claimable; nothing was changed.
    Skipped { status: ReviewStatus },
    /// Another worker holds a live claim; try again once it is stale.
    Deferred { retry_after: Duration },
    NotFound,
}

impl ProcessOutcome {
    /// Whether the work item should be acknowledged.
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_) | Self::Deferred { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemFailure {
    pub item_identifier: MessageId,
}

/// Result of a batch, listing only the items that must be retried.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub batch_item_failures: Vec<BatchItemFailure>,
    #[serde(skip)]
    pub processed: usize,
}

pub struct ReviewWorker {
    store: Arc<dyn ReviewRepository>,
    queue: Arc<dyn WorkQueue>,
    agent: Arc<dyn ReviewAgent>,
    notifier: ChangeNotifier,
    settings: WorkerSettings,
}

impl ReviewWorker {
    pub fn new(
        store: Arc<dyn ReviewRepository>,
        queue: Arc<dyn WorkQueue>,
        agent: Arc<dyn ReviewAgent>,
        notifier: ChangeNotifier,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            queue,
            agent,
            notifier,
            settings,
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Process one review end to end.
    pub async fn process(&self, review_id: ReviewId) -> Result<ProcessOutcome, WorkerError> {
        let Some(current) = self.store.get(review_id).await? else {
            warn!("Work item references unknown review {}", review_id);
            return Ok(ProcessOutcome::NotFound);
        };

        let now = Utc::now();
        let claim = Transition::Claim {
            stale_before: stale_before(now, self.settings.stale_after),
        };
        let claimed = match apply(&current, claim, now) {
            Ok(claimed) => claimed,
            Err(TransitionError::ClaimHeld { claimed_at }) => {
                let retry_after = claim_expiry(claimed_at, self.settings.stale_after, now);
                debug!(
                    "Review {} is being processed since {}, retrying in {:?}",
                    review_id, claimed_at, retry_after
                );
                return Ok(ProcessOutcome::Deferred { retry_after });
            }
            Err(_) => {
                debug!(
                    "Review {} is {}, skipping duplicate delivery",
                    review_id, current.status
                );
                return Ok(ProcessOutcome::Skipped {
                    status: current.status,
                });
            }
        };

        if current.status == ReviewStatus::InProgress {
            warn!(
                "Taking over stale claim on review {} (attempt {})",
                review_id, claimed.attempts
            );
        }

        if !self
            .store
            .compare_and_swap(current.version, &claimed)
            .await?
        {
            let status = self
                .store
                .get(review_id)
                .await?
                .map_or(current.status, |r| r.status);
            debug!("Lost claim race for review {}", review_id);
            return Ok(ProcessOutcome::Skipped { status });
        }
        info!("Claimed review {} (attempt {})", review_id, claimed.attempts);
        self.notifier.publish(&claimed);

        let request = AgentRequest::new(review_id, &claimed.subject());
        let result = match tokio::time::timeout(
            self.settings.agent_timeout,
            self.agent.review(&request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AgentError::Timeout(self.settings.agent_timeout)),
        };

        let finish = match result {
            Ok(outcome) => Transition::Complete(outcome),
            Err(e) => {
                warn!("Review agent failed for review {}: {}", review_id, e);
                Transition::Fail {
                    error: e.to_string(),
                }
            }
        };

        let finished = match apply(&claimed, finish, Utc::now()) {
            Ok(finished) => finished,
            Err(e) => {
                warn!("Rejecting agent result for review {}: {}", review_id, e);
                apply(
                    &claimed,
                    Transition::Fail {
                        error: format!("agent returned an invalid result: {}", e),
                    },
                    Utc::now(),
                )
                .map_err(|e| RepositoryError::storage("finish review", e.to_string()))?
            }
        };

        if !self
            .store
            .compare_and_swap(claimed.version, &finished)
            .await?
        {
            warn!(
                "Review {} changed while the agent was running; discarding result",
                review_id
            );
            let status = self
                .store
                .get(review_id)
                .await?
                .map_or(claimed.status, |r| r.status);
            return Ok(ProcessOutcome::Skipped { status });
        }
        self.notifier.publish(&finished);

        if finished.status == ReviewStatus::Completed {
            info!(
                "Review {} completed with score {}",
                review_id,
                finished.score.unwrap_or_default()
            );
            Ok(ProcessOutcome::Completed(finished))
        } else {
            info!("Review {} failed", review_id);
            Ok(ProcessOutcome::Failed(finished))
        }
    }

    /// Process each delivery independently and settle it with the queue.
    ///
    /// Successes are acknowledged one by one. Failures are released with the
    /// retry delay, deferrals until the blocking claim expires; both are
    /// reported in `batch_item_failures`.
    pub async fn process_batch(&self, deliveries: Vec<Delivery>) -> BatchReport {
        let mut report = BatchReport::default();

        for delivery in deliveries {
            report.processed += 1;
            let retry = match self.process(delivery.review_id).await {
                Ok(ProcessOutcome::Deferred { retry_after }) => Some(retry_after),
                Ok(outcome) if outcome.is_success() => None,
                Ok(_) => Some(self.settings.retry_delay),
                Err(e) => {
                    error!(
                        "Error processing message {} for review {}: {}",
                        delivery.message_id, delivery.review_id, e
                    );
                    Some(self.settings.retry_delay)
                }
            };

            let settled = match retry {
                None => self.queue.ack(&delivery.receipt).await,
                Some(delay) => {
                    report.batch_item_failures.push(BatchItemFailure {
                        item_identifier: delivery.message_id.clone(),
                    });
                    self.queue.release(&delivery.receipt, delay).await
                }
            };

            match settled {
                Ok(true) => {}
                Ok(false) => warn!(
                    "Receipt for message {} expired before it was settled",
                    delivery.message_id
                ),
                Err(e) => error!(
                    "Failed to settle message {}: {}",
                    delivery.message_id, e
                ),
            }
        }

        report
    }

    /// Receive one batch and process it. Returns `None` when the queue was empty.
    pub async fn poll_once(&self) -> Result<Option<BatchReport>, WorkerError> {
        let deliveries = self
            .queue
            .receive(self.settings.batch_size, self.settings.visibility_timeout)
            .await?;
        if deliveries.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.process_batch(deliveries).await))
    }
}

/// Time until a claim taken at `claimed_at` counts as stale.
fn claim_expiry(claimed_at: DateTime<Utc>, stale_after: Duration, now: DateTime<Utc>) -> Duration {
    let stale_at = after(claimed_at, stale_after);
    (stale_at - now)
        .to_std()
        .unwrap_or(Duration::ZERO)
        + CLAIM_EXPIRY_MARGIN
}

/// Run `concurrency` independent worker loops until `shutdown` fires.
pub fn spawn_worker_pool(
    worker: Arc<ReviewWorker>,
    concurrency: usize,
    shutdown: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    (0..concurrency.max(1))
        .map(|index| {
            let worker = worker.clone();
            let shutdown = shutdown.subscribe();
            tokio::spawn(worker_loop(index, worker, shutdown))
        })
        .collect()
}

async fn worker_loop(index: usize, worker: Arc<ReviewWorker>, mut shutdown: broadcast::Receiver<()>) {
    info!("Worker {} started", index);
    let idle = worker.settings().batch_window;

    loop {
        let polled = tokio::select! {
            _ = shutdown.recv() => break,
            polled = worker.poll_once() => polled,
        };

        let wait = match polled {
            Ok(Some(report)) => {
                if !report.batch_item_failures.is_empty() {
                    warn!(
                        "Worker {}: {} of {} item(s) failed",
                        index,
                        report.batch_item_failures.len(),
                        report.processed
                    );
                }
                None
            }
            Ok(None) => Some(idle),
            Err(e) => {
                error!("Worker {} failed to poll the queue: {}", index, e);
                Some(idle)
            }
        };

        if let Some(wait) = wait {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    info!("Worker {} stopped", index);
}
