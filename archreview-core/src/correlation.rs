use std::time::Instant;

use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next, Result as MiddlewareResult};
use tracing::{debug, warn};
use uuid::Uuid;

/// Header carrying the id that ties an outbound call to the review it serves.
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

/// Headers whose values must never reach the logs.
pub const SENSITIVE_HEADERS: &[&str] = &["authorization", "cookie", "set-cookie", "x-api-key"];

/// Correlation id placed in request extensions by a caller.
#[derive(Clone, Debug)]
pub struct CorrelationId(pub String);

pub fn is_sensitive_header(header_name: &str) -> bool {
    let lower = header_name.to_lowercase();
    SENSITIVE_HEADERS.contains(&lower.as_str())
}

/// Render request headers for debug logs, redacting credentials.
pub fn describe_headers(headers: &reqwest::header::HeaderMap) -> String {
    let mut parts: Vec<String> = headers
        .iter()
        .map(|(name, value)| {
            let shown = if is_sensitive_header(name.as_str()) {
                "[REDACTED]"
            } else {
                value.to_str().unwrap_or("[BINARY]")
            };
            format!("{}={}", name, shown)
        })
        .collect();
    parts.sort();
    parts.join(", ")
}

/// Stamps every outbound request with a correlation id and logs its outcome.
pub struct CorrelationMiddleware;

#[async_trait::async_trait]
impl Middleware for CorrelationMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> MiddlewareResult<Response> {
        let existing = req
            .headers()
            .get(CORRELATION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let correlation_id = match existing {
            Some(id) => id,
            None => {
                let id = extensions
                    .get::<CorrelationId>()
                    .map(|id| id.0.clone())
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                // Uuids and caller ids that fail header validation are dropped.
                if let Ok(value) = id.parse() {
                    req.headers_mut().insert(CORRELATION_ID_HEADER, value);
                }
                id
            }
        };

        let method = req.method().clone();
        let url = req.url().clone();
        debug!(
            correlation_id = %correlation_id,
            "{} {} [{}]",
            method,
            url,
            describe_headers(req.headers())
        );

        let started = Instant::now();
        let response = next.run(req, extensions).await;
        let elapsed_ms = started.elapsed().as_millis();

        match &response {
            Ok(resp) => debug!(
                correlation_id = %correlation_id,
                status = resp.status().as_u16(),
                elapsed_ms,
                "{} {} completed",
                method,
                url
            ),
            Err(e) => warn!(
                correlation_id = %correlation_id,
                elapsed_ms,
                "{} {} failed: {}",
                method,
                url,
                e
            ),
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn test_sensitive_headers_are_case_insensitive() {
        assert!(is_sensitive_header("Authorization"));
        assert!(is_sensitive_header("X-API-KEY"));
        assert!(!is_sensitive_header("content-type"));
    }

    async fn echo_correlation_id(request: reqwest_middleware::RequestBuilder) -> Option<String> {
        request
            .send()
            .await
            .unwrap()
            .text()
            .await
            .ok()
            .filter(|id| !id.is_empty())
    }

    #[tokio::test]
    async fn test_middleware_stamps_correlation_id() {
        use axum::{http::HeaderMap, routing::get, Router};

        let router = Router::new().route(
            "/",
            get(|headers: HeaderMap| async move {
                headers
                    .get(CORRELATION_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string()
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let client = reqwest_middleware::ClientBuilder::new(reqwest::Client::new())
            .with(CorrelationMiddleware)
            .build();

        // From the caller's extension.
        let id = echo_correlation_id(
            client
                .get(&url)
                .with_extension(CorrelationId("review-42".to_string())),
        )
        .await;
        assert_eq!(id.as_deref(), Some("review-42"));

        // An explicit header wins.
        let id = echo_correlation_id(
            client
                .get(&url)
                .header(CORRELATION_ID_HEADER, "explicit")
                .with_extension(CorrelationId("ignored".to_string())),
        )
        .await;
        assert_eq!(id.as_deref(), Some("explicit"));

        // Otherwise a fresh uuid.
        let id = echo_correlation_id(client.get(&url)).await.unwrap();
        assert!(Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn test_describe_headers_redacts_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer hunter2"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        let described = describe_headers(&headers);
        assert!(described.contains("authorization=[REDACTED]"));
        assert!(described.contains("content-type=application/json"));
        assert!(!described.contains("hunter2"));
    }
}
