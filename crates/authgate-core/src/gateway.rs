//! The authenticated request gateway.
//!
//! Every request runs through `inject → dispatch → classify → (maybe refresh)
//! → retry-or-return`. Transient network failures are absorbed by the
//! `RetryingDispatcher`; authorization failures are handed to the
//! `RefreshCoordinator` and the request is retried at most once.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{self, HeaderValue};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::api::{
    ApiError, ApiRequest, ApiResponse, CredentialInjector, DispatchOutcome, HttpDispatcher,
    RequestAttempt, RequestDispatcher, RetryingDispatcher,
};
use crate::auth::credentials::LoginRequest;
use crate::auth::{
    CredentialStore, RefreshCoordinator, SecretStorage, SessionSignal, SessionState, SignedOut,
    TokenGrant,
};
use crate::config::GatewayConfig;

/// The remote logout is best-effort and must not hold up signing out
const REMOTE_LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// What a successful login returns besides the stored credential.
#[derive(Debug, Clone, Default)]
pub struct LoginOutcome {
    /// Fields of the login response other than the tokens (user profile)
    pub profile: serde_json::Map<String, serde_json::Value>,
}

pub struct Gateway {
    config: GatewayConfig,
    store: Arc<CredentialStore>,
    injector: CredentialInjector,
    dispatcher: Arc<dyn RequestDispatcher>,
    coordinator: RefreshCoordinator,
    signal: SessionSignal,
}

impl Gateway {
    /// Build a gateway talking HTTP to `config.base_url`.
    pub fn new(config: GatewayConfig, storage: Arc<dyn SecretStorage>) -> Result<Self, ApiError> {
        let http = HttpDispatcher::new(&config.base_url, config.request_timeout())?;
        let dispatcher = RetryingDispatcher::new(Arc::new(http), config.retry_policy());
        Ok(Self::with_dispatcher(config, storage, Arc::new(dispatcher)))
    }

    /// Build a gateway on top of an arbitrary dispatcher. The dispatcher is
    /// used as-is, so wrap it in a `RetryingDispatcher` if backoff is wanted.
    pub fn with_dispatcher(
        config: GatewayConfig,
        storage: Arc<dyn SecretStorage>,
        dispatcher: Arc<dyn RequestDispatcher>,
    ) -> Self {
        let store = Arc::new(CredentialStore::new(storage));
        let signal = SessionSignal::new();
        let coordinator = RefreshCoordinator::new(
            dispatcher.clone(),
            store.clone(),
            signal.clone(),
            config.refresh_path.clone(),
        );

        Self {
            injector: CredentialInjector::new(store.clone()),
            config,
            store,
            dispatcher,
            coordinator,
            signal,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn credential_store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Subscribe to the signed-out event.
    pub fn subscribe_signed_out(&self) -> broadcast::Receiver<SignedOut> {
        self.signal.subscribe()
    }

    pub async fn session_state(&self) -> SessionState {
        match self.store.get().await {
            Ok(Some(_)) => {
                if self.coordinator.is_refreshing().await {
                    SessionState::RefreshInProgress
                } else {
                    SessionState::Authenticated
                }
            }
            Ok(None) => SessionState::Anonymous,
            Err(e) => {
                warn!(error = %e, "Credential store unreadable");
                SessionState::Anonymous
            }
        }
    }

    pub async fn is_authenticated(&self) -> bool {
        self.session_state().await != SessionState::Anonymous
    }

    /// Authenticate with username and password and store the credential
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginOutcome, ApiError> {
        let request = ApiRequest::post(self.config.login_path.as_str())
            .json(&LoginRequest { username, password })?;

        let response = match self.dispatcher.dispatch(&request).await {
            DispatchOutcome::Success(response) => response,
            DispatchOutcome::AuthorizationFailure => {
                return Err(ApiError::AccessDenied("Invalid username or password".into()))
            }
            DispatchOutcome::Failed(e) => return Err(e),
        };

        let grant: TokenGrant = response.json()?;
        let refresh_token = grant.refresh_token.ok_or_else(|| {
            ApiError::InvalidResponse("Login response has no refresh token".into())
        })?;

        self.coordinator
            .begin_session(&grant.access_token, &refresh_token)
            .await?;
        info!(username = username, "Logged in");

        Ok(LoginOutcome {
            profile: grant.extra,
        })
    }

    /// Sign out locally, then tell the server on a best-effort basis.
    ///
    /// Calling this while already signed out is a no-op.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let Some(previous) = self.coordinator.end_session().await? else {
            debug!("Logout requested with no active session");
            return Ok(());
        };
        self.signal.emit();
        info!("Logged out");

        let request = match HeaderValue::from_str(&previous.bearer()) {
            Ok(mut value) => {
                value.set_sensitive(true);
                ApiRequest::post(self.config.logout_path.as_str())
                    .header(header::AUTHORIZATION, value)
                    .timeout(REMOTE_LOGOUT_TIMEOUT)
            }
            Err(_) => {
                warn!("Stored access token is not a valid header value, skipping remote logout");
                return Ok(());
            }
        };

        match self.dispatcher.dispatch(&request).await {
            DispatchOutcome::Success(_) => debug!("Remote logout acknowledged"),
            DispatchOutcome::AuthorizationFailure => {
                debug!("Remote logout: session already invalid on server")
            }
            DispatchOutcome::Failed(e) => warn!(error = %e, "Remote logout failed"),
        }
        Ok(())
    }

    /// Force a refresh, sharing any refresh already in flight.
    pub async fn refresh_now(&self) -> Result<(), ApiError> {
        self.coordinator.refresh_now().await.map_err(ApiError::from)
    }

    /// Send a request with the current credential, refreshing and retrying
    /// once if the server rejects it.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let epoch = self.coordinator.epoch();
        let mut attempt = RequestAttempt::new(request);

        loop {
            let prepared = self.injector.inject(attempt.request()).await;

            match self.dispatcher.dispatch(&prepared.request).await {
                DispatchOutcome::Success(response) => return Ok(response),
                DispatchOutcome::Failed(err) => return Err(err),
                DispatchOutcome::AuthorizationFailure => {
                    let path = &attempt.request().path;
                    let Some(presented) = prepared.access_token else {
                        debug!(path = %path, "Unauthenticated request rejected");
                        return Err(ApiError::AuthorizationExpired);
                    };
                    if attempt.retried() {
                        warn!(path = %path, "Authorization failed again after refresh");
                        return Err(ApiError::AuthorizationExpired);
                    }

                    if let Err(failure) = self.coordinator.recover(&presented, epoch).await {
                        debug!(path = %path, error = %failure, "Refresh did not recover request");
                        return Err(ApiError::AuthorizationExpired);
                    }
                    if self.coordinator.epoch() != epoch {
                        debug!(path = %path, "Session ended during refresh, not retrying");
                        return Err(ApiError::AuthorizationExpired);
                    }

                    debug!(path = %path, "Retrying after refresh");
                    attempt = attempt.into_retry();
                }
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send(ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.send(ApiRequest::post(path).json(body)?).await?.json()
    }
}
