//! Single-flight access token refresh.
//!
//! At most one refresh call is outstanding at a time. The first request that
//! fails authorization installs a shared handle to a spawned refresh task
//! before the network call goes out; every other failing request awaits that
//! same handle. Installing the handle, committing the refresh result and
//! ending the session all happen under the `slot` mutex, so a sign-out can
//! never be overwritten by a refresh that finishes late.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use super::credentials::RefreshRequest;
use super::{Credential, CredentialStore, SessionSignal, TokenGrant};
use crate::api::{ApiError, ApiRequest, DispatchOutcome, RequestDispatcher};

/// Why a refresh attempt did not produce a new credential.
///
/// Cloned to every request waiting on the same refresh.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    #[error("Refresh credential rejected: {0}")]
    Rejected(String),

    #[error("Refresh endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Malformed refresh response: {0}")]
    MalformedGrant(String),

    #[error("No credential to refresh")]
    NoCredential,

    #[error("Session ended while refreshing")]
    SignedOut,

    #[error("Credential storage failed: {0}")]
    Storage(String),
}

impl From<RefreshFailure> for ApiError {
    fn from(failure: RefreshFailure) -> Self {
        match failure {
            RefreshFailure::NoCredential | RefreshFailure::SignedOut => ApiError::NotAuthenticated,
            other => ApiError::RefreshRejected(other.to_string()),
        }
    }
}

type RefreshOutcome = Result<(), RefreshFailure>;

struct Flight {
    id: u64,
    outcome: Shared<BoxFuture<'static, RefreshOutcome>>,
    task: AbortHandle,
}

struct Inner {
    dispatcher: Arc<dyn RequestDispatcher>,
    store: Arc<CredentialStore>,
    signal: SessionSignal,
    refresh_path: String,
    slot: Mutex<Option<Flight>>,
    /// Bumped whenever a session begins or ends; a refresh started under an
    /// older epoch must not commit.
    epoch: AtomicU64,
    next_flight: AtomicU64,
}

pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        dispatcher: Arc<dyn RequestDispatcher>,
        store: Arc<CredentialStore>,
        signal: SessionSignal,
        refresh_path: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatcher,
                store,
                signal,
                refresh_path: refresh_path.into(),
                slot: Mutex::new(None),
                epoch: AtomicU64::new(0),
                next_flight: AtomicU64::new(0),
            }),
        }
    }

    /// Current session epoch. Capture it before dispatching a request and
    /// hand it back to [`recover`](Self::recover).
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    pub async fn is_refreshing(&self) -> bool {
        self.inner.slot.lock().await.is_some()
    }

    /// Recover from an authorization failure of a request that presented
    /// `presented_token`.
    ///
    /// Joins the in-flight refresh if there is one. If the stored credential
    /// has already moved past `presented_token`, returns immediately so the
    /// caller can retry with it. Otherwise starts a refresh.
    pub async fn recover(&self, presented_token: &str, epoch: u64) -> RefreshOutcome {
        self.join_or_start(epoch, Some(presented_token)).await
    }

    /// Refresh now, joining an in-flight refresh if there is one.
    pub async fn refresh_now(&self) -> RefreshOutcome {
        self.join_or_start(self.epoch(), None).await
    }

    async fn join_or_start(&self, epoch: u64, presented_token: Option<&str>) -> RefreshOutcome {
        let outcome = {
            let mut slot = self.inner.slot.lock().await;
            if self.epoch() != epoch {
                return Err(RefreshFailure::SignedOut);
            }

            // A finished task still in the slot never reached its commit step
            if slot.as_ref().is_some_and(|flight| flight.task.is_finished()) {
                warn!("Discarding abandoned refresh");
                *slot = None;
            }

            match slot.as_ref() {
                Some(flight) => {
                    debug!(flight = flight.id, "Joining in-flight refresh");
                    flight.outcome.clone()
                }
                None => {
                    let current = self
                        .inner
                        .store
                        .get()
                        .await
                        .map_err(|e| RefreshFailure::Storage(e.to_string()))?;
                    let Some(current) = current else {
                        return Err(RefreshFailure::NoCredential);
                    };
                    if presented_token.is_some_and(|token| token != current.access_token) {
                        debug!("Credential already refreshed, skipping");
                        return Ok(());
                    }

                    let flight = Inner::launch(&self.inner, current.refresh_token, epoch);
                    let outcome = flight.outcome.clone();
                    *slot = Some(flight);
                    outcome
                }
            }
        };

        outcome.await
    }

    /// Install a fresh credential (login). Any refresh still running belongs
    /// to the previous session and is cancelled.
    pub async fn begin_session(&self, access_token: &str, refresh_token: &str) -> Result<()> {
        let mut slot = self.inner.slot.lock().await;
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(flight) = slot.take() {
            flight.task.abort();
        }
        self.inner.store.set(access_token, refresh_token).await
    }

    /// End the session: cancel any in-flight refresh (its waiters fail) and
    /// clear the store. Returns the credential that was active, if any.
    pub async fn end_session(&self) -> Result<Option<Credential>> {
        let mut slot = self.inner.slot.lock().await;
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(flight) = slot.take() {
            info!(flight = flight.id, "Cancelling in-flight refresh");
            flight.task.abort();
        }

        let previous = match self.inner.store.get().await {
            Ok(previous) => previous,
            Err(e) => {
                warn!(error = %e, "Could not read credential before clearing");
                None
            }
        };
        self.inner.store.clear().await?;
        Ok(previous)
    }
}

impl Inner {
    fn launch(inner: &Arc<Inner>, refresh_token: String, epoch: u64) -> Flight {
        let id = inner.next_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let task_inner = Arc::clone(inner);
        let handle = tokio::spawn(async move { task_inner.run(id, refresh_token, epoch).await });
        let task = handle.abort_handle();

        let outcome = handle
            .map(|joined| match joined {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => Err(RefreshFailure::SignedOut),
                Err(e) => Err(RefreshFailure::Unreachable(format!("refresh task failed: {}", e))),
            })
            .boxed()
            .shared();

        Flight { id, outcome, task }
    }

    async fn run(self: Arc<Self>, id: u64, refresh_token: String, epoch: u64) -> RefreshOutcome {
        info!(flight = id, "Refreshing access token");
        let result = self.request_grant(&refresh_token).await;

        let mut slot = self.slot.lock().await;
        let ours = slot.as_ref().map(|flight| flight.id) == Some(id);
        if !ours || self.epoch.load(Ordering::SeqCst) != epoch {
            return Err(RefreshFailure::SignedOut);
        }
        *slot = None;

        let failure = match result {
            Ok(grant) => {
                let refresh = grant.refresh_token.as_deref().unwrap_or(&refresh_token);
                match self.store.set(&grant.access_token, refresh).await {
                    Ok(()) => {
                        info!(flight = id, rotated = grant.refresh_token.is_some(), "Access token refreshed");
                        return Ok(());
                    }
                    Err(e) => RefreshFailure::Storage(e.to_string()),
                }
            }
            Err(failure) => failure,
        };

        warn!(flight = id, error = %failure, "Refresh failed, signing out");
        if let Err(e) = self.store.clear().await {
            error!(error = %e, "Failed to clear credential after refresh failure");
        }
        self.signal.emit();
        Err(failure)
    }

    async fn request_grant(&self, refresh_token: &str) -> Result<TokenGrant, RefreshFailure> {
        let request = ApiRequest::post(self.refresh_path.as_str())
            .json(&RefreshRequest { refresh_token })
            .map_err(|e| RefreshFailure::Unreachable(e.to_string()))?;

        match self.dispatcher.dispatch(&request).await {
            DispatchOutcome::Success(response) => {
                let grant: TokenGrant = response
                    .json()
                    .map_err(|e| RefreshFailure::MalformedGrant(e.to_string()))?;
                if grant.access_token.is_empty() {
                    return Err(RefreshFailure::MalformedGrant("empty access token".into()));
                }
                Ok(grant)
            }
            DispatchOutcome::AuthorizationFailure => Err(RefreshFailure::Rejected(
                "refresh endpoint returned 401".into(),
            )),
            DispatchOutcome::Failed(e) if e.is_transient() => {
                Err(RefreshFailure::Unreachable(e.to_string()))
            }
            DispatchOutcome::Failed(e) => Err(RefreshFailure::Rejected(e.to_string())),
        }
    }
}
