use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode},
    Router,
};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::watch;
use tower::ServiceExt;

use super::{router, validate_auth};
use crate::lifecycle::{apply, Transition};
use crate::notifier::ChangeNotifier;
use crate::queue::{InMemoryWorkQueue, QueuePolicy};
use crate::service::{ReviewService, ServiceSettings};
use crate::store::InMemoryReviewRepository;
use crate::AppState;
use archreview_core::{Region, Review, ReviewId, ReviewStatus};

const TOKEN: &str = "ops-secret";

struct TestApp {
    app: Router,
    service: Arc<ReviewService>,
    shutdown: watch::Sender<bool>,
}

fn test_app(ops_auth_token: Option<&str>) -> TestApp {
    let service = Arc::new(ReviewService::new(
        Arc::new(InMemoryReviewRepository::new()),
        Arc::new(InMemoryWorkQueue::new(QueuePolicy {
            max_receive_count: 1,
        })),
        ChangeNotifier::default(),
        ServiceSettings {
            default_region: Region::parse("us-east-1").unwrap(),
            stale_after: Duration::from_secs(960),
        },
    ));
    let (shutdown, shutdown_rx) = watch::channel(false);
    let state = Arc::new(AppState {
        service: service.clone(),
        ops_auth_token: ops_auth_token.map(str::to_string),
        shutdown: shutdown_rx,
    });
    TestApp {
        app: router(state),
        service,
        shutdown,
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn with_token(mut request: Request<Body>, token: &str) -> Request<Body> {
    request.headers_mut().insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
    );
    request
}

async fn submit(app: &Router) -> ReviewId {
    let (status, body) = send(
        app,
        json_request(
            Method::POST,
            "/reviews",
            json!({"awsAccountId": "123456789012", "region": "us-east-1"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["reviewId"].as_str().unwrap().parse().unwrap()
}

/// Drive a review to FAILED the way a worker would.
async fn fail_review(service: &ReviewService, id: ReviewId) -> Review {
    let store = service.store();
    let pending = store.get(id).await.unwrap().unwrap();
    let now = chrono::Utc::now();
    let claimed = apply(&pending, Transition::Claim { stale_before: now }, now).unwrap();
    assert!(store.compare_and_swap(pending.version, &claimed).await.unwrap());
    let failed = apply(
        &claimed,
        Transition::Fail {
            error: "agent exploded".to_string(),
        },
        now,
    )
    .unwrap();
    assert!(store.compare_and_swap(claimed.version, &failed).await.unwrap());
    failed
}

// =============================================================================
// validate_auth
// =============================================================================

fn headers_with(value: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
    headers
}

#[test]
fn test_validate_auth_disabled_without_token() {
    let err = validate_auth(&headers_with("Bearer x"), &None).unwrap_err();
    assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[test]
fn test_validate_auth_rejects_missing_and_malformed_headers() {
    let token = Some(TOKEN.to_string());
    assert_eq!(
        validate_auth(&HeaderMap::new(), &token).unwrap_err().status(),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        validate_auth(&headers_with(TOKEN), &token).unwrap_err().status(),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        validate_auth(&headers_with("Bearer wrong"), &token)
            .unwrap_err()
            .status(),
        StatusCode::UNAUTHORIZED
    );
}

#[test]
fn test_validate_auth_accepts_matching_token() {
    let token = Some(TOKEN.to_string());
    assert!(validate_auth(&headers_with("Bearer ops-secret"), &token).is_ok());
}

// =============================================================================
// Public endpoints
// =============================================================================

#[tokio::test]
async fn test_health() {
    let t = test_app(None);
    let (status, body) = send(&t.app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "archreview");
}

#[tokio::test]
async fn test_help_lists_endpoints() {
    let t = test_app(None);
    let (status, body) = send(&t.app, get("/help")).await;
    assert_eq!(status, StatusCode::OK);
    let paths: Vec<&str> = body["endpoints"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["path"].as_str())
        .collect();
    assert!(paths.contains(&"/reviews"));
    assert!(paths.contains(&"/subscriptions/reviews"));
}

#[tokio::test]
async fn test_submit_then_get_is_pending() {
    let t = test_app(None);
    let id = submit(&t.app).await;

    let (status, body) = send(&t.app, get(&format!("/reviews/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "PENDING");
    assert_eq!(body["awsAccountId"], "123456789012");
    assert!(body.get("score").is_none());
    assert!(t.service.queue().has_outstanding(id).await.unwrap());
}

#[tokio::test]
async fn test_submit_uses_default_region() {
    let t = test_app(None);
    let (status, body) = send(
        &t.app,
        json_request(
            Method::POST,
            "/reviews",
            json!({"awsAccountId": "123456789012", "pillar": "security"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "PENDING");

    let id: ReviewId = body["reviewId"].as_str().unwrap().parse().unwrap();
    let review = t.service.get(id).await.unwrap();
    assert_eq!(review.region.as_str(), "us-east-1");
}

#[tokio::test]
async fn test_invalid_submission_creates_nothing() {
    let t = test_app(None);
    let (status, body) = send(
        &t.app,
        json_request(
            Method::POST,
            "/reviews",
            json!({"awsAccountId": "abc", "region": "us-east-1"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("awsAccountId"));

    let (_, listing) = send(&t.app, get("/reviews")).await;
    assert_eq!(listing["count"], 0);
}

#[tokio::test]
async fn test_malformed_json_is_bad_request() {
    let t = test_app(None);
    let request = Request::builder()
        .method(Method::POST)
        .uri("/reviews")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&t.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_get_unknown_and_invalid_ids() {
    let t = test_app(None);
    let (status, _) = send(&t.app, get(&format!("/reviews/{}", ReviewId::new()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&t.app, get("/reviews/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_list_pages_through_everything() {
    let t = test_app(None);
    let mut submitted = Vec::new();
    for _ in 0..5 {
        submitted.push(submit(&t.app).await);
    }

    let mut seen = Vec::new();
    let mut uri = "/reviews?limit=2".to_string();
    loop {
        let (status, body) = send(&t.app, get(&uri)).await;
        assert_eq!(status, StatusCode::OK);
        let items = body["items"].as_array().unwrap();
        assert!(items.len() <= 2);
        assert_eq!(body["count"], items.len());
        seen.extend(
            items
                .iter()
                .map(|i| i["reviewId"].as_str().unwrap().parse::<ReviewId>().unwrap()),
        );
        match body["nextToken"].as_str() {
            Some(token) => uri = format!("/reviews?limit=2&nextToken={}", token),
            None => break,
        }
    }

    seen.sort();
    submitted.sort();
    assert_eq!(seen, submitted);
}

#[tokio::test]
async fn test_list_rejects_bad_token_and_status() {
    let t = test_app(None);
    let (status, _) = send(&t.app, get("/reviews?nextToken=%%%")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&t.app, get("/reviews?nextToken=bm90LWpzb24")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&t.app, get("/reviews?status=DONE")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&t.app, get("/reviews?limit=lots")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_list_by_status() {
    let t = test_app(None);
    let failed = submit(&t.app).await;
    submit(&t.app).await;
    fail_review(&t.service, failed).await;

    let (status, body) = send(&t.app, get("/reviews?status=FAILED")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["items"][0]["reviewId"], failed.to_string());
    assert_eq!(body["items"][0]["errorMessage"], "agent exploded");
}

#[tokio::test]
async fn test_retry_failed_review() {
    let t = test_app(None);
    let id = submit(&t.app).await;

    // Only FAILED reviews can be retried.
    let (status, _) = send(
        &t.app,
        json_request(
            Method::PUT,
            &format!("/reviews/{}/status", id),
            json!({"status": "PENDING"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Consume the original work item.
    let queue = t.service.queue();
    let delivery = queue.receive(1, Duration::from_secs(60)).await.unwrap();
    queue.ack(&delivery[0].receipt).await.unwrap();
    fail_review(&t.service, id).await;

    let (status, body) = send(
        &t.app,
        json_request(
            Method::PUT,
            &format!("/reviews/{}/status", id),
            json!({"status": "PENDING"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "PENDING");
    assert!(body.get("errorMessage").is_none());
    assert!(queue.has_outstanding(id).await.unwrap());
}

#[tokio::test]
async fn test_put_status_rejects_other_targets() {
    let t = test_app(None);
    let id = submit(&t.app).await;
    fail_review(&t.service, id).await;

    let (status, _) = send(
        &t.app,
        json_request(
            Method::PUT,
            &format!("/reviews/{}/status", id),
            json!({"status": "COMPLETED"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(
        &t.app,
        json_request(
            Method::PUT,
            &format!("/reviews/{}/status", id),
            json!({"status": "DONE"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_subscription_streams_updates() {
    let t = test_app(None);
    let id = submit(&t.app).await;

    let response = t
        .app
        .clone()
        .oneshot(get(&format!("/subscriptions/reviews?reviewId={}", id)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );
    let mut body = response.into_body().into_data_stream();

    // An update of another review is filtered out.
    let other = submit(&t.app).await;
    let failed = fail_review(&t.service, id).await;
    t.service
        .notifier()
        .publish(&t.service.get(other).await.unwrap());
    t.service.notifier().publish(&failed);

    let chunk = tokio::time::timeout(Duration::from_secs(1), body.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let text = String::from_utf8(chunk.to_vec()).unwrap();
    assert!(text.contains("event: reviewUpdated"));
    assert!(text.contains(&id.to_string()));
    assert!(text.contains("FAILED"));
}

#[tokio::test]
async fn test_subscription_ends_on_shutdown() {
    let t = test_app(None);
    let response = t
        .app
        .clone()
        .oneshot(get("/subscriptions/reviews"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let mut body = response.into_body().into_data_stream();

    t.shutdown.send(true).unwrap();
    let end = tokio::time::timeout(Duration::from_secs(1), body.next())
        .await
        .expect("stream stayed open after shutdown");
    assert!(end.is_none());
}

#[tokio::test]
async fn test_subscription_rejects_bad_filter() {
    let t = test_app(None);
    let (status, _) = send(&t.app, get("/subscriptions/reviews?reviewId=nope")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// =============================================================================
// Operator endpoints
// =============================================================================

#[tokio::test]
async fn test_operator_endpoints_disabled_without_token() {
    let t = test_app(None);
    for uri in ["/status", "/dead-letters"] {
        let (status, _) = send(&t.app, with_token(get(uri), TOKEN)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{}", uri);
    }
}

#[tokio::test]
async fn test_operator_endpoints_require_token() {
    let t = test_app(Some(TOKEN));
    let (status, _) = send(&t.app, get("/status")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&t.app, with_token(get("/status"), "nope")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let request = with_token(
        json_request(
            Method::PATCH,
            &format!("/reviews/{}", ReviewId::new()),
            json!({"status": "FAILED"}),
        ),
        "nope",
    );
    let (status, _) = send(&t.app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_status_summary() {
    let t = test_app(Some(TOKEN));
    submit(&t.app).await;
    submit(&t.app).await;

    let (status, body) = send(&t.app, with_token(get("/status"), TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "archreview");
    assert_eq!(body["reviews"]["pending"], 2);
    assert_eq!(body["reviews"]["total"], 2);
    assert_eq!(body["queue"]["visible"], 2);
}

#[tokio::test]
async fn test_patch_review_completes_in_progress_review() {
    let t = test_app(Some(TOKEN));
    let id = submit(&t.app).await;

    let claim = with_token(
        json_request(
            Method::PATCH,
            &format!("/reviews/{}", id),
            json!({"status": "IN_PROGRESS"}),
        ),
        TOKEN,
    );
    let (status, body) = send(&t.app, claim).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "IN_PROGRESS");

    let complete = with_token(
        json_request(
            Method::PATCH,
            &format!("/reviews/{}", id),
            json!({
                "status": "COMPLETED",
                "score": 88.5,
                "findings": [],
                "recommendations": []
            }),
        ),
        TOKEN,
    );
    let (status, body) = send(&t.app, complete).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "COMPLETED");
    assert_eq!(body["score"], 88.5);
}

#[tokio::test]
async fn test_patch_review_rejects_bad_patches() {
    let t = test_app(Some(TOKEN));
    let id = submit(&t.app).await;

    let unknown_field = with_token(
        json_request(
            Method::PATCH,
            &format!("/reviews/{}", id),
            json!({"status": "FAILED", "colour": "red"}),
        ),
        TOKEN,
    );
    let (status, _) = send(&t.app, unknown_field).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let results_while_pending = with_token(
        json_request(
            Method::PATCH,
            &format!("/reviews/{}", id),
            json!({"status": "IN_PROGRESS", "score": 10.0}),
        ),
        TOKEN,
    );
    let (status, _) = send(&t.app, results_while_pending).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let illegal = with_token(
        json_request(
            Method::PATCH,
            &format!("/reviews/{}", id),
            json!({"status": "PENDING"}),
        ),
        TOKEN,
    );
    let (status, _) = send(&t.app, illegal).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_dead_letters_and_redrive() {
    let t = test_app(Some(TOKEN));
    let id = submit(&t.app).await;

    // max_receive_count is 1: the second receive dead-letters the item.
    let queue = t.service.queue();
    let first = queue.receive(1, Duration::from_secs(60)).await.unwrap();
    queue.release(&first[0].receipt, Duration::ZERO).await.unwrap();
    assert!(queue.receive(1, Duration::from_secs(60)).await.unwrap().is_empty());

    let (status, body) = send(&t.app, with_token(get("/dead-letters"), TOKEN)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["items"][0]["reviewId"], id.to_string());
    let message_id = body["items"][0]["messageId"].as_str().unwrap().to_string();

    let redrive = with_token(
        Request::builder()
            .method(Method::POST)
            .uri(format!("/dead-letters/{}/redrive", message_id))
            .body(Body::empty())
            .unwrap(),
        TOKEN,
    );
    let (status, body) = send(&t.app, redrive).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["redriven"], true);
    assert!(queue.has_outstanding(id).await.unwrap());

    let again = with_token(
        Request::builder()
            .method(Method::POST)
            .uri(format!("/dead-letters/{}/redrive", message_id))
            .body(Body::empty())
            .unwrap(),
        TOKEN,
    );
    let (status, _) = send(&t.app, again).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_review_status_serializes_as_wire_name() {
    assert_eq!(
        serde_json::to_value(ReviewStatus::InProgress).unwrap(),
        json!("IN_PROGRESS")
    );
}
