//! Pure review lifecycle transitions.
//!
//! Every status change a review undergoes goes through [`apply`]. The function
//! has no side effects: callers persist the returned record with a conditional
//! write on the previous `version`, which is what makes concurrent workers
//! race-free.
//!
//! ```text
//! PENDING --Claim--> IN_PROGRESS --Complete--> COMPLETED
//!    ^                 |    ^
//!    |                 |    +-- Claim (only once the claim is stale)
//!    |                 +------Fail--------> FAILED
//!    +-----------------------Reset------------+
//! ```
//!
//! `Abandon` is the one edge outside the diagram: it compensates a reset whose
//! re-enqueue failed, putting the review back to `FAILED`.

use chrono::{DateTime, Utc};
use thiserror::Error;

use archreview_core::{
    Finding, Recommendation, Review, ReviewOutcome, ReviewStatus, ValidationError,
};

/// A requested lifecycle step.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Take ownership of a review for processing. An `IN_PROGRESS` review can
    /// only be claimed again when its `claimedAt` is before `stale_before`.
    Claim { stale_before: DateTime<Utc> },
    /// Record a successful agent result.
    Complete(ReviewOutcome),
    /// Record a failed or timed-out agent invocation.
    Fail { error: String },
    /// Explicit retry of a failed review.
    Reset,
    /// Undo a reset that could not be queued.
    Abandon { error: String },
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Claim { .. } => "claim",
            Self::Complete(_) => "complete",
            Self::Fail { .. } => "fail",
            Self::Reset => "reset",
            Self::Abandon { .. } => "abandon",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionError {
    #[error("cannot {transition} a review that is {from}")]
    Illegal {
        from: ReviewStatus,
        transition: &'static str,
    },
    #[error("review is already being processed (claimed at {claimed_at})")]
    ClaimHeld { claimed_at: DateTime<Utc> },
    #[error(transparent)]
    InvalidOutcome(#[from] ValidationError),
}

/// Apply `transition` to `review` at time `now`.
pub fn apply(
    review: &Review,
    transition: Transition,
    now: DateTime<Utc>,
) -> Result<Review, TransitionError> {
    let mut next = review.clone();

    match (review.status, transition) {
        (ReviewStatus::Pending, Transition::Claim { .. }) => {
            claim(&mut next, now);
        }
        (ReviewStatus::InProgress, Transition::Claim { stale_before }) => {
            match review.claimed_at {
                Some(claimed_at) if claimed_at >= stale_before => {
                    return Err(TransitionError::ClaimHeld { claimed_at });
                }
                // An IN_PROGRESS record without a claim time predates claim
                // tracking and is always stale.
                _ => claim(&mut next, now),
            }
        }
        (ReviewStatus::InProgress, Transition::Complete(outcome)) => {
            outcome.validate()?;
            next.status = ReviewStatus::Completed;
            next.score = Some(outcome.score);
            next.findings = Some(outcome.findings);
            next.recommendations = Some(outcome.recommendations);
            next.error_message = None;
        }
        (ReviewStatus::InProgress, Transition::Fail { error }) => {
            next.status = ReviewStatus::Failed;
            clear_results(&mut next);
            next.error_message = Some(error);
        }
        (ReviewStatus::Failed, Transition::Reset) => {
            next.status = ReviewStatus::Pending;
            clear_results(&mut next);
            next.error_message = None;
            next.claimed_at = None;
        }
        (ReviewStatus::Pending, Transition::Abandon { error }) => {
            next.status = ReviewStatus::Failed;
            clear_results(&mut next);
            next.error_message = Some(error);
        }
        (from, transition) => {
            return Err(TransitionError::Illegal {
                from,
                transition: transition.name(),
            });
        }
    }

    next.updated_at = advance(review.updated_at, now);
    next.version = review.version + 1;
    Ok(next)
}

/// `now`, or one millisecond past `previous` when the clock has not moved on.
fn advance(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if now > previous {
        now
    } else {
        previous + chrono::Duration::milliseconds(1)
    }
}

/// Claims taken before the returned instant are stale at `now`.
pub fn stale_before(now: DateTime<Utc>, stale_after: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(stale_after)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn claim(review: &mut Review, now: DateTime<Utc>) {
    review.status = ReviewStatus::InProgress;
    review.claimed_at = Some(now);
    review.attempts += 1;
}

fn clear_results(review: &mut Review) {
    review.score = None;
    review.findings = None;
    review.recommendations = None;
}

/// Partial update accepted by the general `update` operation.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ReviewPatch {
    pub status: Option<ReviewStatus>,
    pub score: Option<f64>,
    pub findings: Option<Vec<Finding>>,
    pub recommendations: Option<Vec<Recommendation>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PatchError {
    #[error("patch must set status")]
    MissingStatus,
    #[error("score, findings and recommendations are only accepted with status COMPLETED")]
    UnexpectedResults,
    #[error("status COMPLETED requires score, findings and recommendations")]
    IncompleteResults,
    #[error("errorMessage is only accepted with status FAILED")]
    UnexpectedErrorMessage,
}

impl ReviewPatch {
    pub fn status(status: ReviewStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    fn has_results(&self) -> bool {
        self.score.is_some() || self.findings.is_some() || self.recommendations.is_some()
    }

    /// The transition a patch asks for.
    pub fn into_transition(self, stale_before: DateTime<Utc>) -> Result<Transition, PatchError> {
        let status = self.status.ok_or(PatchError::MissingStatus)?;

        if status != ReviewStatus::Completed && self.has_results() {
            return Err(PatchError::UnexpectedResults);
        }
        if status != ReviewStatus::Failed && self.error_message.is_some() {
            return Err(PatchError::UnexpectedErrorMessage);
        }

        Ok(match status {
            ReviewStatus::Pending => Transition::Reset,
            ReviewStatus::InProgress => Transition::Claim { stale_before },
            ReviewStatus::Completed => match (self.score, self.findings, self.recommendations) {
                (Some(score), Some(findings), Some(recommendations)) => {
                    Transition::Complete(ReviewOutcome {
                        score,
                        findings,
                        recommendations,
                    })
                }
                _ => return Err(PatchError::IncompleteResults),
            },
            ReviewStatus::Failed => Transition::Fail {
                error: self
                    .error_message
                    .unwrap_or_else(|| "marked failed by operator".to_string()),
            },
        })
    }
}
