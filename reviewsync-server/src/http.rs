//! Shared outgoing HTTP client.

use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use axum::http;
use reqwest::{Client, Request, Response};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, Middleware, Next};
use tracing::debug;
use uuid::Uuid;

pub const CORRELATION_ID_HEADER: &str = "X-Correlation-Id";

/// Correlation id of the trigger an outgoing request belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

/// Tags every request with a correlation id and logs its outcome.
pub struct CorrelationMiddleware;

#[async_trait::async_trait]
impl Middleware for CorrelationMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        if !req.headers().contains_key(CORRELATION_ID_HEADER) {
            let correlation_id = extensions
                .get::<CorrelationId>()
                .cloned()
                .unwrap_or_default();
            if let Ok(value) = correlation_id.0.parse() {
                req.headers_mut().insert(CORRELATION_ID_HEADER, value);
            }
        }

        let method = req.method().clone();
        let url = req.url().clone();
        let started = Instant::now();

        let response = next.run(req, extensions).await;

        match &response {
            Ok(resp) => debug!(
                "{} {} -> {} in {}ms",
                method,
                url,
                resp.status(),
                started.elapsed().as_millis()
            ),
            Err(e) => debug!("{} {} failed: {}", method, url, e),
        }

        response
    }
}

pub fn create_http_client() -> Result<ClientWithMiddleware> {
    let client = Client::builder()
        .user_agent(format!("reviewsync/{}", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to create HTTP client")?;

    Ok(ClientBuilder::new(client).with(CorrelationMiddleware).build())
}

/// Turn a non-2xx response into an error carrying the response body.
pub async fn ensure_success(response: Response, what: &str) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let error_text = response.text().await.unwrap_or_default();
    Err(anyhow!("{} failed: {} - {}", what, status, error_text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn test_adds_correlation_id_header() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/ping")
                    .header_exists(CORRELATION_ID_HEADER);
                then.status(200);
            })
            .await;

        let client = create_http_client().unwrap();
        let response = client.get(server.url("/ping")).send().await.unwrap();

        assert!(response.status().is_success());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_keeps_existing_correlation_id() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/ping")
                    .header(CORRELATION_ID_HEADER, "abc-123");
                then.status(200);
            })
            .await;

        let client = create_http_client().unwrap();
        client
            .get(server.url("/ping"))
            .header(CORRELATION_ID_HEADER, "abc-123")
            .send()
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_ensure_success_reports_body() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/missing");
                then.status(404).body("not here");
            })
            .await;

        let client = create_http_client().unwrap();
        let response = client.get(server.url("/missing")).send().await.unwrap();
        let err = ensure_success(response, "Fetching thing").await.unwrap_err();

        let message = err.to_string();
        assert!(message.contains("404"));
        assert!(message.contains("not here"));
    }
}
