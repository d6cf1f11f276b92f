//! HTTP surface: review submission and reads, the live subscription stream,
//! and bearer-protected operator endpoints.

mod handlers;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use axum::{
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub use handlers::{DeadLetterList, ListParams, StatusChange, REVIEW_UPDATED_EVENT};

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/help", get(handlers::help))
        .route(
            "/reviews",
            post(handlers::submit_review).get(handlers::list_reviews),
        )
        .route(
            "/reviews/:review_id",
            get(handlers::get_review).patch(handlers::patch_review),
        )
        .route("/reviews/:review_id/status", put(handlers::put_review_status))
        .route("/subscriptions/reviews", get(handlers::subscribe_reviews))
        .route("/status", get(handlers::status))
        .route("/dead-letters", get(handlers::list_dead_letters))
        .route(
            "/dead-letters/:message_id/redrive",
            post(handlers::redrive_dead_letter),
        )
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Validate the authorization header against the operator token.
///
/// Returns `Ok(())` if authorized, or an error response if not.
#[allow(clippy::result_large_err)] // Response is large but this is idiomatic in Axum handlers
pub(crate) fn validate_auth(headers: &HeaderMap, auth_token: &Option<String>) -> Result<(), Response> {
    // If no auth token is configured, the endpoint is disabled
    let Some(expected_token) = auth_token else {
        return Err(auth_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "Operator API is disabled (OPS_AUTH_TOKEN not configured)",
        ));
    };

    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match auth_header {
        Some(value) => match value.strip_prefix("Bearer ") {
            Some(provided_token) if provided_token == expected_token => Ok(()),
            Some(_) => Err(auth_error(StatusCode::UNAUTHORIZED, "Invalid token")),
            None => Err(auth_error(
                StatusCode::UNAUTHORIZED,
                "Invalid Authorization header format. Expected: Bearer <token>",
            )),
        },
        None => Err(auth_error(
            StatusCode::UNAUTHORIZED,
            "Missing Authorization header. Expected: Bearer <token>",
        )),
    }
}

fn auth_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
