//! Authenticated request gateway.
//!
//! Attaches the current access credential to every outbound call, detects
//! credential expiry, and recovers by refreshing once and retrying, with a
//! single refresh shared by all concurrently failing requests. When the
//! refresh itself fails the session is cleared and a `SignedOut` event is
//! broadcast.
//!
//! ```no_run
//! # async fn example() -> anyhow::Result<()> {
//! use std::sync::Arc;
//! use authgate_core::{ApiRequest, Gateway, GatewayConfig, MemoryStorage};
//!
//! let config = GatewayConfig::with_base_url("https://api.example.com");
//! let gateway = Gateway::new(config, Arc::new(MemoryStorage::new()))?;
//! gateway.login("ada", "hunter2").await?;
//! let response = gateway.send(ApiRequest::get("/practice/sessions")).await?;
//! println!("{}", response.body);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod gateway;

pub use api::{ApiError, ApiRequest, ApiResponse, ErrorKind, RequestDispatcher};
pub use auth::{
    Credential, CredentialStore, FileStorage, KeyringStorage, MemoryStorage, SecretStorage,
    SessionState, SignedOut,
};
pub use config::{GatewayConfig, StorageBackend};
pub use gateway::{Gateway, LoginOutcome};
