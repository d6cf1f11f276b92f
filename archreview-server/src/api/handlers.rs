//! HTTP handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tracing::warn;

use super::validate_auth;
use crate::error::ServiceError;
use crate::lifecycle::ReviewPatch;
use crate::queue::{DeadLetter, MessageId};
use crate::service::{ReviewPage, SubmitRequest, SubmitResponse};
use crate::status::StatusSummary;
use crate::AppState;
use archreview_core::{Review, ReviewId, ReviewStatus};

/// SSE event name carrying a review update.
pub const REVIEW_UPDATED_EVENT: &str = "reviewUpdated";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListParams {
    pub limit: Option<usize>,
    pub next_token: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusChange {
    pub status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeParams {
    pub review_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitParams {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterList {
    pub items: Vec<DeadLetter>,
    pub count: usize,
}

fn parse_review_id(raw: &str) -> Result<ReviewId, ServiceError> {
    Ok(raw.parse::<ReviewId>()?)
}

fn bad_json(rejection: JsonRejection) -> ServiceError {
    ServiceError::Validation(format!("invalid request body: {}", rejection.body_text()))
}

fn bad_query(rejection: QueryRejection) -> ServiceError {
    ServiceError::Validation(format!("invalid query string: {}", rejection.body_text()))
}

pub(super) async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "archreview",
        "timestamp": chrono::Utc::now(),
    }))
}

pub(super) async fn help() -> Json<serde_json::Value> {
    let endpoint = |method: &str, path: &str, description: &str, authentication: &str| {
        json!({
            "method": method,
            "path": path,
            "description": description,
            "authentication": authentication,
        })
    };

    Json(json!({
        "service": "archreview",
        "version": crate::get_version(),
        "description": "Asynchronous architecture reviews: submit a review, follow its status, read the result",
        "endpoints": [
            endpoint("GET", "/health", "Liveness check", "None"),
            endpoint("GET", "/help", "This document", "None"),
            endpoint("POST", "/reviews", "Submit a review {awsAccountId, region?, pillar?}", "None"),
            endpoint("GET", "/reviews", "List reviews, newest first (?limit, ?nextToken, ?status)", "None"),
            endpoint("GET", "/reviews/:reviewId", "Fetch one review", "None"),
            endpoint("PUT", "/reviews/:reviewId/status", "Retry a failed review with {\"status\":\"PENDING\"}", "None"),
            endpoint("PATCH", "/reviews/:reviewId", "Apply a lifecycle update", "Bearer OPS_AUTH_TOKEN"),
            endpoint("GET", "/subscriptions/reviews", "Server-sent reviewUpdated events (?reviewId)", "None"),
            endpoint("GET", "/status", "Review counts and queue depth", "Bearer OPS_AUTH_TOKEN"),
            endpoint("GET", "/dead-letters", "Work items that exhausted their retries (?limit)", "Bearer OPS_AUTH_TOKEN"),
            endpoint("POST", "/dead-letters/:messageId/redrive", "Return a dead letter to the queue", "Bearer OPS_AUTH_TOKEN"),
        ],
        "configuration": {
            "required_env_vars": ["AGENT_URL"],
            "optional_env_vars": [
                "PORT (default: 3000)",
                "STATE_DIR (default: current directory)",
                "STORAGE_BACKEND (default: sqlite)",
                "AGENT_TIMEOUT_SECS (default: 900)",
                "QUEUE_VISIBILITY_TIMEOUT_SECS (default: 960)",
                "QUEUE_MAX_RECEIVE_COUNT (default: 3)",
                "QUEUE_RETRY_DELAY_SECS (default: 30)",
                "WORKER_CONCURRENCY (default: 4)",
                "WORKER_BATCH_SIZE (default: 1)",
                "WORKER_BATCH_WINDOW_MS (default: 5000)",
                "RECONCILE_INTERVAL_SECS (default: 60)",
                "STALE_MARGIN_SECS (default: 60)",
                "OPS_AUTH_TOKEN (unset disables operator endpoints)",
                "DEFAULT_REGION (default: us-east-1)"
            ]
        }
    }))
}

/// Handler: POST /reviews
pub(super) async fn submit_review(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), ServiceError> {
    let Json(request) = payload.map_err(bad_json)?;
    let review = state.service.submit(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            review_id: review.review_id,
            status: review.status,
            message: "Review submitted".to_string(),
        }),
    ))
}

/// Handler: GET /reviews
pub(super) async fn list_reviews(
    State(state): State<Arc<AppState>>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> Result<Json<ReviewPage>, ServiceError> {
    let Query(params) = params.map_err(bad_query)?;
    let status = params
        .status
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(str::parse::<ReviewStatus>)
        .transpose()?;

    let page = state
        .service
        .list(status, params.limit, params.next_token.as_deref())
        .await?;
    Ok(Json(page))
}

/// Handler: GET /reviews/:reviewId
pub(super) async fn get_review(
    State(state): State<Arc<AppState>>,
    Path(review_id): Path<String>,
) -> Result<Json<Review>, ServiceError> {
    let id = parse_review_id(&review_id)?;
    Ok(Json(state.service.get(id).await?))
}

/// Handler: PUT /reviews/:reviewId/status
pub(super) async fn put_review_status(
    State(state): State<Arc<AppState>>,
    Path(review_id): Path<String>,
    payload: Result<Json<StatusChange>, JsonRejection>,
) -> Result<Json<Review>, ServiceError> {
    let id = parse_review_id(&review_id)?;
    let Json(change) = payload.map_err(bad_json)?;
    let status = change.status.parse::<ReviewStatus>()?;
    Ok(Json(state.service.update_status(id, status).await?))
}

/// Handler: PATCH /reviews/:reviewId
///
/// Requires Bearer token authentication via OPS_AUTH_TOKEN.
pub(super) async fn patch_review(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(review_id): Path<String>,
    payload: Result<Json<ReviewPatch>, JsonRejection>,
) -> Result<Json<Review>, Response> {
    validate_auth(&headers, &state.ops_auth_token)?;

    let id = parse_review_id(&review_id).map_err(IntoResponse::into_response)?;
    let Json(patch) = payload.map_err(|e| bad_json(e).into_response())?;
    let review = state
        .service
        .update(id, patch)
        .await
        .map_err(IntoResponse::into_response)?;
    Ok(Json(review))
}

/// Handler: GET /subscriptions/reviews
///
/// Streams every update, or only those of `?reviewId=`, as server-sent events.
/// Updates published before the subscription starts are not replayed.
pub(super) async fn subscribe_reviews(
    State(state): State<Arc<AppState>>,
    params: Result<Query<SubscribeParams>, QueryRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServiceError> {
    let Query(params) = params.map_err(bad_query)?;
    let filter = params
        .review_id
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(parse_review_id)
        .transpose()?;

    let stream = state
        .service
        .notifier()
        .subscribe(filter)
        .into_stream()
        .filter_map(|review| async move {
            match Event::default()
                .event(REVIEW_UPDATED_EVENT)
                .id(review.version.to_string())
                .json_data(&review)
            {
                Ok(event) => Some(Ok(event)),
                Err(e) => {
                    warn!("Failed to encode update for review {}: {}", review.review_id, e);
                    None
                }
            }
        })
        .take_until(server_stopping(state.shutdown.clone()));

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Resolves once shutdown starts, or once its sender is gone.
async fn server_stopping(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopping| *stopping).await;
}

/// Handler: GET /status
///
/// Requires Bearer token authentication via OPS_AUTH_TOKEN.
pub(super) async fn status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<StatusSummary>, Response> {
    validate_auth(&headers, &state.ops_auth_token)?;

    let summary = StatusSummary::collect(
        state.service.store().as_ref(),
        state.service.queue().as_ref(),
        crate::get_version(),
    )
    .await
    .map_err(IntoResponse::into_response)?;
    Ok(Json(summary))
}

/// Handler: GET /dead-letters
///
/// Requires Bearer token authentication via OPS_AUTH_TOKEN.
pub(super) async fn list_dead_letters(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    params: Result<Query<LimitParams>, QueryRejection>,
) -> Result<Json<DeadLetterList>, Response> {
    validate_auth(&headers, &state.ops_auth_token)?;

    let Query(params) = params.map_err(|e| bad_query(e).into_response())?;
    let items = state
        .service
        .dead_letters(params.limit)
        .await
        .map_err(IntoResponse::into_response)?;
    Ok(Json(DeadLetterList {
        count: items.len(),
        items,
    }))
}

/// Handler: POST /dead-letters/:messageId/redrive
///
/// Requires Bearer token authentication via OPS_AUTH_TOKEN.
pub(super) async fn redrive_dead_letter(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(message_id): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    validate_auth(&headers, &state.ops_auth_token)?;

    let message_id = MessageId(message_id);
    state
        .service
        .redrive(&message_id)
        .await
        .map_err(IntoResponse::into_response)?;
    Ok(Json(json!({ "messageId": message_id, "redriven": true })))
}
