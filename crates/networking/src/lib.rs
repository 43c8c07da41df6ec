//! Networking layer for the Tidesync SDK
//!
//! This crate provides the pluggable HTTP transport abstraction used by the
//! document sync service, the error taxonomy with retry classification, and
//! the `Retryer` decorator implementing bounded retry-with-backoff.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod retry;
pub mod transport;

pub use error::{HttpError, NetworkErrorKind};
pub use retry::Retryer;
pub use transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
