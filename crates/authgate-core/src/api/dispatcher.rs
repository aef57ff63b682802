//! Network call executor.
//!
//! `RequestDispatcher` is the seam between the gateway pipeline and the wire.
//! `HttpDispatcher` is the reqwest implementation; tests substitute their own.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::{ApiError, ApiRequest, ApiResponse};

/// Result of a single network call.
#[derive(Debug)]
pub enum DispatchOutcome {
    Success(ApiResponse),
    /// HTTP 401: the presented access credential was not accepted
    AuthorizationFailure,
    Failed(ApiError),
}

#[async_trait]
pub trait RequestDispatcher: Send + Sync {
    /// Perform the call exactly as described; no credential handling.
    async fn dispatch(&self, request: &ApiRequest) -> DispatchOutcome;
}

/// Dispatcher backed by a shared reqwest client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpDispatcher {
    client: Client,
    base_url: String,
}

impl HttpDispatcher {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

#[async_trait]
impl RequestDispatcher for HttpDispatcher {
    async fn dispatch(&self, request: &ApiRequest) -> DispatchOutcome {
        let url = self.url_for(&request.path);

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .headers(request.headers.clone());
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %url, error = %e, "Request failed before a response arrived");
                return DispatchOutcome::Failed(ApiError::from_send_error(e));
            }
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            debug!(url = %url, "Authorization failure");
            return DispatchOutcome::AuthorizationFailure;
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) if e.is_timeout() => return DispatchOutcome::Failed(ApiError::TransientNetwork(e)),
            Err(e) => {
                return DispatchOutcome::Failed(ApiError::InvalidResponse(format!(
                    "Failed to read response body from {}: {}",
                    url, e
                )))
            }
        };

        if status.is_success() {
            DispatchOutcome::Success(ApiResponse::new(status, body))
        } else {
            DispatchOutcome::Failed(ApiError::from_status(status, &body))
        }
    }
}
