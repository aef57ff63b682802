use thiserror::Error;

/// Coarse classification used by the gateway to decide between backoff,
/// refresh, or plain propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connectivity, timeout or rate limiting. Eligible for backoff retry.
    TransientNetwork,
    /// The access credential was rejected. Only trigger for a refresh.
    AuthorizationExpired,
    /// The refresh credential was rejected. Fatal to the session.
    RefreshRejected,
    /// Any other non-2xx response.
    Domain,
    /// Failures that never reached the server (storage, encoding, decoding).
    Local,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Network error: {0}")]
    TransientNetwork(#[source] reqwest::Error),

    /// The call failed for a reason a retry will not fix (redirect loop,
    /// protocol error).
    #[error("Request failed: {0}")]
    RequestFailed(#[source] reqwest::Error),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Unauthorized - access token expired or revoked")]
    AuthorizationExpired,

    #[error("Refresh rejected: {0}")]
    RefreshRejected(String),

    #[error("Not signed in")]
    NotAuthenticated,

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::AuthorizationExpired,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            code => ApiError::UnexpectedStatus {
                status: code,
                body: truncated,
            },
        }
    }

    /// Classify a reqwest error raised before a response arrived. Only
    /// connectivity and timeouts are worth retrying.
    pub fn from_send_error(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            ApiError::TransientNetwork(e)
        } else if e.is_builder() {
            ApiError::InvalidRequest(e.to_string())
        } else {
            ApiError::RequestFailed(e)
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::TransientNetwork(_) | ApiError::RateLimited => ErrorKind::TransientNetwork,
            ApiError::AuthorizationExpired | ApiError::NotAuthenticated => {
                ErrorKind::AuthorizationExpired
            }
            ApiError::RefreshRejected(_) => ErrorKind::RefreshRejected,
            ApiError::AccessDenied(_)
            | ApiError::NotFound(_)
            | ApiError::ServerError(_)
            | ApiError::UnexpectedStatus { .. } => ErrorKind::Domain,
            ApiError::RequestFailed(_)
            | ApiError::InvalidResponse(_)
            | ApiError::InvalidRequest(_)
            | ApiError::Storage(_) => ErrorKind::Local,
        }
    }

    /// Whether the backoff policy may retry this error.
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientNetwork
    }
}
