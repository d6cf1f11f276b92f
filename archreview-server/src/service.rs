//! Submission and query/read operations over the store and the queue.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::ServiceError;
use crate::lifecycle::{apply, stale_before, ReviewPatch, Transition};
use crate::notifier::ChangeNotifier;
use crate::queue::{DeadLetter, MessageId, WorkQueue};
use crate::store::{Cursor, ListFilter, ReviewRepository};
use archreview_core::{Region, Review, ReviewId, ReviewStatus, ReviewSubject};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

/// Body of a submission.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    #[serde(default)]
    pub aws_account_id: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub pillar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub review_id: ReviewId,
    pub status: ReviewStatus,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewPage {
    pub items: Vec<Review>,
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

/// Opaque continuation token for a listing.
pub fn encode_page_token(cursor: &Cursor) -> String {
    // Serializing a struct of a timestamp and a uuid cannot fail.
    let json = serde_json::to_vec(cursor).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

pub fn decode_page_token(token: &str) -> Result<Cursor, ServiceError> {
    let invalid = || ServiceError::Validation("nextToken is invalid".to_string());
    let bytes = URL_SAFE_NO_PAD.decode(token.trim()).map_err(|_| invalid())?;
    serde_json::from_slice(&bytes).map_err(|_| invalid())
}

pub fn clamp_limit(limit: Option<usize>) -> usize {
    limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE)
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub default_region: Region,
    /// Age after which an `IN_PROGRESS` claim may be taken over.
    pub stale_after: Duration,
}

pub struct ReviewService {
    store: Arc<dyn ReviewRepository>,
    queue: Arc<dyn WorkQueue>,
    notifier: ChangeNotifier,
    settings: ServiceSettings,
}

impl ReviewService {
    pub fn new(
        store: Arc<dyn ReviewRepository>,
        queue: Arc<dyn WorkQueue>,
        notifier: ChangeNotifier,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            store,
            queue,
            notifier,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn ReviewRepository> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    /// Validate, persist as `PENDING`, then enqueue.
    ///
    /// The record is written before the work item exists. If the enqueue
    /// fails the record is deleted again; if that also fails it stays
    /// `PENDING` and the reconciliation sweep enqueues it later. Either way
    /// the caller gets `TransientDelivery`.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Review, ServiceError> {
        let region = request
            .region
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or(self.settings.default_region.as_str());
        let subject = ReviewSubject::parse(
            &request.aws_account_id,
            region,
            request.pillar.as_deref(),
        )?;

        let review = Review::new_pending(subject, Utc::now());
        self.store.insert(&review).await?;

        if let Err(e) = self.queue.enqueue(review.review_id).await {
            warn!(
                "Failed to enqueue review {}: {}; removing record",
                review.review_id, e
            );
            match self.store.delete(review.review_id).await {
                Ok(_) => {}
                Err(delete_err) => error!(
                    "Failed to remove unqueued review {}: {}; reconciliation will enqueue it",
                    review.review_id, delete_err
                ),
            }
            return Err(ServiceError::TransientDelivery(e));
        }

        info!(
            "Submitted review {} for account {} in {}",
            review.review_id, review.aws_account_id, review.region
        );
        self.notifier.publish(&review);
        Ok(review)
    }

    pub async fn get(&self, id: ReviewId) -> Result<Review, ServiceError> {
        self.store
            .get(id)
            .await?
            .ok_or(ServiceError::NotFound(id))
    }

    pub async fn list(
        &self,
        status: Option<ReviewStatus>,
        limit: Option<usize>,
        next_token: Option<&str>,
    ) -> Result<ReviewPage, ServiceError> {
        let limit = clamp_limit(limit);
        let after = next_token
            .filter(|t| !t.is_empty())
            .map(decode_page_token)
            .transpose()?;

        let page = self
            .store
            .list(ListFilter { status }, after, limit)
            .await?;

        Ok(ReviewPage {
            count: page.items.len(),
            next_token: page.next.as_ref().map(encode_page_token),
            items: page.items,
        })
    }

    pub async fn list_by_status(
        &self,
        status: ReviewStatus,
        limit: Option<usize>,
        next_token: Option<&str>,
    ) -> Result<ReviewPage, ServiceError> {
        self.list(Some(status), limit, next_token).await
    }

    /// Apply a partial update through the lifecycle.
    ///
    /// A patch that resets a failed review to `PENDING` also re-enqueues it.
    pub async fn update(&self, id: ReviewId, patch: ReviewPatch) -> Result<Review, ServiceError> {
        let current = self.get(id).await?;
        let now = Utc::now();
        let transition = patch.into_transition(stale_before(now, self.settings.stale_after))?;
        let is_reset = transition == Transition::Reset;

        let next = apply(&current, transition, now)?;
        if !self.store.compare_and_swap(current.version, &next).await? {
            return Err(ServiceError::Conflict(id));
        }
        info!(
            "Review {} moved {} -> {}",
            id, current.status, next.status
        );
        self.notifier.publish(&next);

        if is_reset {
            self.enqueue_after_reset(next).await
        } else {
            Ok(next)
        }
    }

    /// Client-driven status change. Only the `FAILED -> PENDING` retry is accepted.
    pub async fn update_status(
        &self,
        id: ReviewId,
        status: ReviewStatus,
    ) -> Result<Review, ServiceError> {
        if status != ReviewStatus::Pending {
            let current = self.get(id).await?;
            return Err(ServiceError::InvalidTransition(
                crate::lifecycle::TransitionError::Illegal {
                    from: current.status,
                    transition: "set status of",
                },
            ));
        }
        self.update(id, ReviewPatch::status(ReviewStatus::Pending))
            .await
    }

    async fn enqueue_after_reset(&self, reset: Review) -> Result<Review, ServiceError> {
        let queue_err = match self.queue.enqueue(reset.review_id).await {
            Ok(message_id) => {
                info!(
                    "Re-enqueued review {} for retry as message {}",
                    reset.review_id, message_id
                );
                return Ok(reset);
            }
            Err(e) => e,
        };

        warn!(
            "Failed to re-enqueue review {}: {}; reverting to FAILED",
            reset.review_id, queue_err
        );
        let abandoned = apply(
            &reset,
            Transition::Abandon {
                error: format!("retry could not be queued: {}", queue_err),
            },
            Utc::now(),
        )?;
        match self.store.compare_and_swap(reset.version, &abandoned).await {
            Ok(true) => self.notifier.publish(&abandoned),
            Ok(false) => warn!(
                "Review {} changed while reverting a failed retry",
                reset.review_id
            ),
            Err(e) => error!(
                "Failed to revert review {}: {}; reconciliation will enqueue it",
                reset.review_id, e
            ),
        }
        Err(ServiceError::TransientDelivery(queue_err))
    }

    pub async fn dead_letters(&self, limit: Option<usize>) -> Result<Vec<DeadLetter>, ServiceError> {
        Ok(self.queue.dead_letters(clamp_limit(limit)).await?)
    }

    pub async fn redrive(&self, message_id: &MessageId) -> Result<(), ServiceError> {
        if self.queue.redrive(message_id).await? {
            info!("Redrove dead letter {}", message_id);
            Ok(())
        } else {
            Err(ServiceError::DeadLetterNotFound(message_id.clone()))
        }
    }
}
