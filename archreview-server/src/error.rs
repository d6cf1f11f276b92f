use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::lifecycle::{PatchError, TransitionError};
use crate::queue::{MessageId, QueueError};
use crate::store::RepositoryError;
use archreview_core::{AgentError, ReviewId, ValidationError};

/// Errors surfaced by the review service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),
    #[error("review {0} not found")]
    NotFound(ReviewId),
    #[error("dead letter {0} not found")]
    DeadLetterNotFound(MessageId),
    #[error("work queue unavailable: {0}")]
    TransientDelivery(#[from] QueueError),
    #[error("review agent failed: {0}")]
    AgentInvocation(#[from] AgentError),
    #[error("review {0} was modified concurrently")]
    Conflict(ReviewId),
    #[error(transparent)]
    InvalidTransition(TransitionError),
    #[error(transparent)]
    Storage(#[from] RepositoryError),
}

impl From<ValidationError> for ServiceError {
    fn from(err: ValidationError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<PatchError> for ServiceError {
    fn from(err: PatchError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<TransitionError> for ServiceError {
    fn from(err: TransitionError) -> Self {
        match err {
            TransitionError::InvalidOutcome(e) => Self::Validation(e.to_string()),
            other => Self::InvalidTransition(other),
        }
    }
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) | Self::DeadLetterNotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) | Self::InvalidTransition(_) => StatusCode::CONFLICT,
            Self::TransientDelivery(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::AgentInvocation(_) => StatusCode::BAD_GATEWAY,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
