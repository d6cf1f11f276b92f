//! Recovery sweeps for reviews that lost their work item.
//!
//! Two situations leave a review without a path forward:
//! - a worker crashed after claiming it, leaving it `IN_PROGRESS`;
//! - a submission wrote the record but the enqueue and the compensating
//!   delete both failed, leaving an orphaned `PENDING` record.
//!
//! A pass runs once at startup before the listener accepts requests, then
//! every `RECONCILE_INTERVAL_SECS`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::lifecycle::stale_before;
use crate::queue::WorkQueue;
use crate::store::{Cursor, ListFilter, ReviewRepository};
use archreview_core::{Review, ReviewStatus};

/// Page size used when walking `PENDING` reviews.
const SWEEP_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    /// Age after which an `IN_PROGRESS` claim is abandoned.
    pub stale_after: Duration,
    /// `PENDING` reviews younger than this are left alone; their item may
    /// still be on its way.
    pub orphan_grace: Duration,
}

/// Counts from one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub stale_requeued: usize,
    pub orphans_requeued: usize,
    /// Reviews left alone because their item is in the dead-letter channel.
    pub dead_lettered: usize,
    pub errors: usize,
}

/// Run one reconciliation pass. Errors are logged and counted, never returned.
pub async fn reconcile_once(
    store: &dyn ReviewRepository,
    queue: &dyn WorkQueue,
    settings: &ReconcileSettings,
) -> ReconcileReport {
    let mut report = ReconcileReport::default();
    let now = Utc::now();

    match store
        .find_stale_in_progress(stale_before(now, settings.stale_after))
        .await
    {
        Ok(stale) => {
            for review in stale {
                warn!(
                    "Review {} has been IN_PROGRESS since {:?}; re-queueing",
                    review.review_id, review.claimed_at
                );
                requeue(queue, &review, &mut report, |r| r.stale_requeued += 1).await;
            }
        }
        Err(e) => {
            error!("Failed to look up stale reviews: {}", e);
            report.errors += 1;
        }
    }

    let orphan_before = stale_before(now, settings.orphan_grace);
    let mut after: Option<Cursor> = None;
    loop {
        let page = match store
            .list(
                ListFilter::status(ReviewStatus::Pending),
                after,
                SWEEP_PAGE_SIZE,
            )
            .await
        {
            Ok(page) => page,
            Err(e) => {
                error!("Failed to list pending reviews: {}", e);
                report.errors += 1;
                break;
            }
        };

        for review in &page.items {
            if review.updated_at > orphan_before {
                continue;
            }
            debug!("Checking pending review {} for a work item", review.review_id);
            requeue(queue, review, &mut report, |r| r.orphans_requeued += 1).await;
        }

        match page.next {
            Some(cursor) => after = Some(cursor),
            None => break,
        }
    }

    if report.stale_requeued + report.orphans_requeued + report.errors == 0 {
        debug!(
            "Reconciliation found nothing to do ({} dead-lettered review(s) waiting)",
            report.dead_lettered
        );
    } else {
        info!(
            "Reconciliation re-queued {} stale and {} orphaned review(s), {} error(s)",
            report.stale_requeued, report.orphans_requeued, report.errors
        );
    }
    report
}

/// Enqueue `review` unless a live item for it already exists or its item
/// was dead-lettered. A dead-lettered review waits for an operator redrive.
async fn requeue(
    queue: &dyn WorkQueue,
    review: &Review,
    report: &mut ReconcileReport,
    count: impl FnOnce(&mut ReconcileReport),
) {
    let blocked = match queue.has_outstanding(review.review_id).await {
        Ok(true) => Ok(true),
        Ok(false) => queue.has_dead_letter(review.review_id).await.map(|dead| {
            if dead {
                debug!(
                    "Review {} has a dead-lettered item; leaving it for redrive",
                    review.review_id
                );
                report.dead_lettered += 1;
            }
            dead
        }),
        Err(e) => Err(e),
    };
    match blocked {
        Ok(true) => return,
        Ok(false) => {}
        Err(e) => {
            error!(
                "Failed to check work items for review {}: {}",
                review.review_id, e
            );
            report.errors += 1;
            return;
        }
    }

    match queue.enqueue(review.review_id).await {
        Ok(message_id) => {
            info!(
                "Re-queued {} review {} as message {}",
                review.status, review.review_id, message_id
            );
            count(report);
        }
        Err(e) => {
            error!("Failed to re-queue review {}: {}", review.review_id, e);
            report.errors += 1;
        }
    }
}

/// Run [`reconcile_once`] every `interval` until `shutdown` fires.
pub async fn reconciliation_loop(
    store: Arc<dyn ReviewRepository>,
    queue: Arc<dyn WorkQueue>,
    settings: ReconcileSettings,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    // The startup pass already ran; skip the immediate first tick.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => {
                reconcile_once(store.as_ref(), queue.as_ref(), &settings).await;
            }
        }
    }
    info!("Reconciliation loop stopped");
}
