//! Client for the external review agent.
//!
//! The agent is an opaque collaborator: it receives the subject of a review
//! and answers with a score, findings and recommendations. Callers are
//! expected to bound every invocation with their own timeout.

use async_trait::async_trait;
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::correlation::{CorrelationId, CorrelationMiddleware};
use crate::review::{Pillar, ReviewId, ReviewOutcome, ReviewSubject};

/// Payload sent to the review agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub review_id: ReviewId,
    pub account_id: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pillar: Option<Pillar>,
}

impl AgentRequest {
    pub fn new(review_id: ReviewId, subject: &ReviewSubject) -> Self {
        Self {
            review_id,
            account_id: subject.account_id.to_string(),
            region: subject.region.to_string(),
            pillar: subject.pillar,
        }
    }
}

/// Why an agent invocation produced no usable result.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent request failed: {0}")]
    Transport(String),
    #[error("agent returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("agent returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("agent did not answer within {0:?}")]
    Timeout(std::time::Duration),
    #[error("agent reported failure: {0}")]
    Reported(String),
}

/// The external review agent.
#[async_trait]
pub trait ReviewAgent: Send + Sync {
    async fn review(&self, request: &AgentRequest) -> Result<ReviewOutcome, AgentError>;
}

/// Review agent reached over HTTP.
#[derive(Clone)]
pub struct HttpReviewAgent {
    client: ClientWithMiddleware,
    endpoint: String,
}

impl HttpReviewAgent {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, AgentError> {
        Ok(Self {
            client: create_agent_client()?,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ReviewAgent for HttpReviewAgent {
    async fn review(&self, request: &AgentRequest) -> Result<ReviewOutcome, AgentError> {
        debug!("Invoking review agent for review {}", request.review_id);

        let response = self
            .client
            .post(&self.endpoint)
            .with_extension(CorrelationId(request.review_id.to_string()))
            .json(request)
            .send()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AgentError::Transport(e.to_string()))?;

        if !status.is_success() {
            return Err(AgentError::Status {
                status: status.as_u16(),
                body: truncate(&body, 512),
            });
        }

        parse_agent_response(&body)
    }
}

/// Decode and validate an agent response body.
pub fn parse_agent_response(body: &str) -> Result<ReviewOutcome, AgentError> {
    let outcome: ReviewOutcome =
        serde_json::from_str(body).map_err(|e| AgentError::InvalidResponse(e.to_string()))?;
    outcome
        .validate()
        .map_err(|e| AgentError::InvalidResponse(e.to_string()))?;
    Ok(outcome)
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}

pub fn create_agent_client() -> Result<ClientWithMiddleware, AgentError> {
    let client = Client::builder()
        .user_agent(concat!("archreview/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| AgentError::Transport(e.to_string()))?;

    Ok(ClientBuilder::new(client)
        .with(CorrelationMiddleware)
        .build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::post, Json, Router};
    use serde_json::json;

    fn subject() -> ReviewSubject {
        ReviewSubject::parse("123456789012", "us-east-1", Some("security")).unwrap()
    }

    async fn spawn_agent(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}/review", addr)
    }

    #[test]
    fn test_agent_request_wire_format() {
        let id = ReviewId::new();
        let request = AgentRequest::new(id, &subject());
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["accountId"], "123456789012");
        assert_eq!(value["region"], "us-east-1");
        assert_eq!(value["pillar"], "security");
        assert_eq!(value["reviewId"], id.to_string());
    }

    #[test]
    fn test_parse_agent_response_accepts_valid_result() {
        let body = json!({
            "score": 82.5,
            "findings": [{
                "id": "s3-encryption-logs",
                "pillar": "Security",
                "title": "S3 Bucket Not Encrypted",
                "description": "Bucket logs has no default encryption",
                "severity": "HIGH",
                "resourceArn": "arn:aws:s3:::logs",
                "service": "S3"
            }],
            "recommendations": [{
                "id": "s3-encryption-rec-logs",
                "title": "Enable S3 Bucket Encryption",
                "description": "Enable SSE for logs",
                "priority": "HIGH",
                "effort": "Low"
            }]
        })
        .to_string();

        let outcome = parse_agent_response(&body).unwrap();
        assert_eq!(outcome.score, 82.5);
        assert_eq!(outcome.findings.len(), 1);
        assert_eq!(outcome.findings[0].service.as_deref(), Some("S3"));
        assert_eq!(outcome.recommendations[0].links, None);
    }

    #[test]
    fn test_parse_agent_response_rejects_out_of_range_score() {
        let body = json!({"score": 140, "findings": [], "recommendations": []}).to_string();
        assert!(matches!(
            parse_agent_response(&body),
            Err(AgentError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_parse_agent_response_rejects_unknown_severity() {
        let body = json!({
            "score": 50,
            "findings": [{
                "id": "x", "pillar": "Security", "title": "t", "description": "d",
                "severity": "SEVERE"
            }],
            "recommendations": []
        })
        .to_string();
        assert!(parse_agent_response(&body).is_err());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("short", 10), "short");
    }

    #[tokio::test]
    async fn test_http_agent_round_trip() {
        let router = Router::new().route(
            "/review",
            post(|Json(request): Json<AgentRequest>| async move {
                assert_eq!(request.account_id, "123456789012");
                Json(json!({"score": 75.0, "findings": [], "recommendations": []}))
            }),
        );
        let endpoint = spawn_agent(router).await;

        let agent = HttpReviewAgent::new(endpoint).unwrap();
        let outcome = agent
            .review(&AgentRequest::new(ReviewId::new(), &subject()))
            .await
            .unwrap();
        assert_eq!(outcome.score, 75.0);
    }

    #[tokio::test]
    async fn test_http_agent_sends_review_id_as_correlation_id() {
        use crate::correlation::CORRELATION_ID_HEADER;
        use axum::http::HeaderMap;
        use std::sync::{Arc, Mutex};

        let seen: Arc<Mutex<Option<String>>> = Arc::default();
        let captured = seen.clone();
        let router = Router::new().route(
            "/review",
            post(move |headers: HeaderMap| async move {
                *captured.lock().unwrap() = headers
                    .get(CORRELATION_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Json(json!({"score": 60.0, "findings": [], "recommendations": []}))
            }),
        );
        let endpoint = spawn_agent(router).await;

        let id = ReviewId::new();
        let agent = HttpReviewAgent::new(endpoint).unwrap();
        agent
            .review(&AgentRequest::new(id, &subject()))
            .await
            .unwrap();
        assert_eq!(seen.lock().unwrap().clone(), Some(id.to_string()));
    }

    #[tokio::test]
    async fn test_http_agent_maps_error_status() {
        let router = Router::new().route(
            "/review",
            post(|| async { (StatusCode::BAD_GATEWAY, "model unavailable") }),
        );
        let endpoint = spawn_agent(router).await;

        let agent = HttpReviewAgent::new(endpoint).unwrap();
        let err = agent
            .review(&AgentRequest::new(ReviewId::new(), &subject()))
            .await
            .unwrap_err();
        match err {
            AgentError::Status { status, body } => {
                assert_eq!(status, 502);
                assert_eq!(body, "model unavailable");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_http_agent_unreachable_is_transport_error() {
        let agent = HttpReviewAgent::new("http://127.0.0.1:1/review").unwrap();
        let err = agent
            .review(&AgentRequest::new(ReviewId::new(), &subject()))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Transport(_)));
    }
}
