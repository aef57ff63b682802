//! Backoff retry for transient network failures.
//!
//! Only `ErrorKind::TransientNetwork` failures are retried. Authorization
//! failures and domain errors pass straight through so that the refresh
//! protocol, not this policy, decides what happens to them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::dispatcher::{DispatchOutcome, RequestDispatcher};
use super::ApiRequest;

/// Default number of attempts (the first call included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay step in milliseconds; attempt `n` waits `n * step`.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay_step: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay_step: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay_step,
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Delay before attempt `failed_attempts + 1`, growing linearly.
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        self.delay_step * failed_attempts
    }
}

/// Wraps another dispatcher with the backoff policy.
pub struct RetryingDispatcher {
    inner: Arc<dyn RequestDispatcher>,
    policy: RetryPolicy,
}

impl RetryingDispatcher {
    pub fn new(inner: Arc<dyn RequestDispatcher>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

#[async_trait]
impl RequestDispatcher for RetryingDispatcher {
    async fn dispatch(&self, request: &ApiRequest) -> DispatchOutcome {
        let mut attempt = 1;
        loop {
            match self.inner.dispatch(request).await {
                DispatchOutcome::Failed(err)
                    if err.is_transient() && attempt < self.policy.max_attempts =>
                {
                    let backoff = self.policy.delay_after(attempt);
                    warn!(
                        path = %request.path,
                        retry = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Transient failure, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use reqwest::StatusCode;

    use super::*;
    use crate::api::{ApiError, ApiResponse};

    /// Replays a fixed script of outcomes and counts calls.
    struct Scripted {
        script: Mutex<VecDeque<DispatchOutcome>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(script: Vec<DispatchOutcome>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl RequestDispatcher for Scripted {
        async fn dispatch(&self, _request: &ApiRequest) -> DispatchOutcome {
            *self.calls.lock().unwrap() += 1;
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| DispatchOutcome::Success(ApiResponse::new(StatusCode::OK, "")))
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100))
    }

    #[test]
    fn test_linear_delay() {
        let policy = policy();
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_rate_limit_then_succeeds() {
        let inner = Scripted::new(vec![
            DispatchOutcome::Failed(ApiError::RateLimited),
            DispatchOutcome::Failed(ApiError::RateLimited),
        ]);
        let dispatcher = RetryingDispatcher::new(inner.clone(), policy());

        let started = tokio::time::Instant::now();
        let outcome = dispatcher.dispatch(&ApiRequest::get("/questions")).await;

        assert!(matches!(outcome, DispatchOutcome::Success(_)));
        assert_eq!(inner.calls(), 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let inner = Scripted::new(vec![
            DispatchOutcome::Failed(ApiError::RateLimited),
            DispatchOutcome::Failed(ApiError::RateLimited),
            DispatchOutcome::Failed(ApiError::RateLimited),
            DispatchOutcome::Failed(ApiError::RateLimited),
        ]);
        let dispatcher = RetryingDispatcher::new(inner.clone(), policy());

        let outcome = dispatcher.dispatch(&ApiRequest::get("/questions")).await;

        assert!(matches!(
            outcome,
            DispatchOutcome::Failed(ApiError::RateLimited)
        ));
        assert_eq!(inner.calls(), 3);
    }

    #[tokio::test]
    async fn test_auth_and_domain_failures_pass_through() {
        let inner = Scripted::new(vec![DispatchOutcome::AuthorizationFailure]);
        let dispatcher = RetryingDispatcher::new(inner.clone(), policy());
        let outcome = dispatcher.dispatch(&ApiRequest::get("/me")).await;
        assert!(matches!(outcome, DispatchOutcome::AuthorizationFailure));
        assert_eq!(inner.calls(), 1);

        let inner = Scripted::new(vec![DispatchOutcome::Failed(ApiError::NotFound(
            "gone".into(),
        ))]);
        let dispatcher = RetryingDispatcher::new(inner.clone(), policy());
        let outcome = dispatcher.dispatch(&ApiRequest::get("/me")).await;
        assert!(matches!(
            outcome,
            DispatchOutcome::Failed(ApiError::NotFound(_))
        ));
        assert_eq!(inner.calls(), 1);
    }
}
