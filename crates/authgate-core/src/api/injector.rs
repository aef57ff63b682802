use std::sync::Arc;

use reqwest::header::{self, HeaderValue};
use tracing::warn;

use super::ApiRequest;
use crate::auth::CredentialStore;

/// A request ready for dispatch, plus the access token it carries (if any).
#[derive(Debug)]
pub struct PreparedRequest {
    pub request: ApiRequest,
    pub access_token: Option<String>,
}

/// Adds `Authorization: Bearer <access>` from the credential store.
///
/// Never refreshes and never touches the network.
#[derive(Clone)]
pub struct CredentialInjector {
    store: Arc<CredentialStore>,
}

impl CredentialInjector {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self { store }
    }

    pub async fn inject(&self, request: &ApiRequest) -> PreparedRequest {
        let mut request = request.clone();

        let credential = match self.store.get().await {
            Ok(credential) => credential,
            Err(e) => {
                warn!(error = %e, "Credential store unreadable, sending unauthenticated");
                None
            }
        };

        let Some(credential) = credential else {
            return PreparedRequest {
                request,
                access_token: None,
            };
        };

        match HeaderValue::from_str(&credential.bearer()) {
            Ok(mut value) => {
                value.set_sensitive(true);
                request.headers.insert(header::AUTHORIZATION, value);
                PreparedRequest {
                    request,
                    access_token: Some(credential.access_token),
                }
            }
            Err(_) => {
                warn!("Access token is not a valid header value, sending unauthenticated");
                PreparedRequest {
                    request,
                    access_token: None,
                }
            }
        }
    }
}
