//! Credential lifecycle: storage, the signed-out signal and the single-flight
//! refresh protocol.
//!
//! This module provides:
//! - `CredentialStore`: cached view over a durable `SecretStorage` backend
//! - `KeyringStorage` / `FileStorage` / `MemoryStorage`: durable backends
//! - `RefreshCoordinator`: at most one refresh call in flight, shared by every
//!   request that hit an authorization failure
//! - `SessionSignal`: broadcast of the `SignedOut` event

pub mod credentials;
pub mod refresh;
pub mod signal;
pub mod storage;
pub mod store;

pub use credentials::{Credential, SessionState, TokenGrant};
pub use refresh::{RefreshCoordinator, RefreshFailure};
pub use signal::{SessionSignal, SignedOut};
pub use storage::{FileStorage, KeyringStorage, MemoryStorage, SecretStorage};
pub use store::CredentialStore;
