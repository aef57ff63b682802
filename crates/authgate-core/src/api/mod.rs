//! Request dispatch pipeline.
//!
//! Requests are described by `ApiRequest`, decorated by the
//! `CredentialInjector`, and executed by a `RequestDispatcher`. The
//! `RetryingDispatcher` adds linear backoff for transient network failures.
//! Authorization failures are reported as their own outcome so the gateway
//! can hand them to the refresh protocol.

pub mod dispatcher;
pub mod error;
pub mod injector;
pub mod request;
pub mod retry;

pub use dispatcher::{DispatchOutcome, HttpDispatcher, RequestDispatcher};
pub use error::{ApiError, ErrorKind};
pub use injector::{CredentialInjector, PreparedRequest};
pub use request::{ApiRequest, ApiResponse, RequestAttempt};
pub use retry::{RetryPolicy, RetryingDispatcher};
