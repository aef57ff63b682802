//! Request and response descriptors passed through the dispatch pipeline.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};

use super::ApiError;

/// A fully described outbound call, relative to the gateway's base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<serde_json::Value>,
    /// Overrides the configured per-request timeout when set
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Attach a JSON body
    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidRequest(format!("Failed to encode body: {}", e)))?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A successful (2xx) response with its body read into memory.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_str(&self.body).map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse JSON response: {}", e))
        })
    }
}

/// One pass of a request through the pipeline.
///
/// `retried` is set on the copy produced after a refresh and is never cleared,
/// so a request gets at most one post-refresh retry.
#[derive(Debug, Clone)]
pub struct RequestAttempt {
    request: Arc<ApiRequest>,
    retried: bool,
}

impl RequestAttempt {
    pub fn new(request: ApiRequest) -> Self {
        Self {
            request: Arc::new(request),
            retried: false,
        }
    }

    pub fn request(&self) -> &ApiRequest {
        &self.request
    }

    pub fn retried(&self) -> bool {
        self.retried
    }

    /// The follow-up attempt issued after a refresh.
    pub fn into_retry(self) -> Self {
        Self {
            request: self.request,
            retried: true,
        }
    }
}
