//! HTTP error taxonomy and retry classification
//!
//! Errors are split into transient network failures (no response received)
//! and HTTP status failures (a response arrived with a non-success code).
//! The retry layer and the sync coordinator both consult the classification
//! helpers here instead of matching on status codes themselves.

use std::collections::HashMap;
use thiserror::Error;

/// Response header carrying a server-directed retry delay in milliseconds.
pub const RETRY_AFTER_MS_HEADER: &str = "x-ms-retry-after-ms";

/// HTTP status codes considered transient besides the 5xx range.
///
/// 408 is a request timeout, 429 is server-side throttling. Kept as a table
/// so the retryable set is reviewable in one place.
const RECOVERABLE_STATUS_CODES: &[u16] = &[408, 429];

/// Kind of transient network failure, used to pick the retry interval table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Connection could not be established before the timeout elapsed.
    ConnectTimeout,

    /// Host name did not resolve.
    UnresolvedHost,

    /// Any other I/O-level failure (reset, broken pipe, TLS, ...).
    Io,
}

/// Errors produced by the HTTP transport and retry layers.
#[derive(Debug, Clone, Error)]
pub enum HttpError {
    /// The request never produced a response.
    #[error("network failure: {message}")]
    Network {
        /// Failure kind for retry-table selection.
        kind: NetworkErrorKind,
        /// Human-readable description from the underlying client.
        message: String,
    },

    /// The server responded with a non-success status code.
    #[error("HTTP {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response headers, lowercased keys.
        headers: HashMap<String, String>,
        /// Response body, useful for error payload inspection.
        body: String,
    },

    /// The request was cancelled before completion.
    #[error("request cancelled")]
    Cancelled,

    /// The request could not be built (bad URL, invalid header value).
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl HttpError {
    /// HTTP status code, if a response was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            HttpError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether a retry has a chance of succeeding.
    ///
    /// Transient network failures always qualify; status failures qualify
    /// only when the code is in the recoverable table or the 5xx range.
    pub fn is_recoverable(&self) -> bool {
        match self {
            HttpError::Network { .. } => true,
            HttpError::Status { status, .. } => is_recoverable_status(*status),
            HttpError::Cancelled | HttpError::InvalidRequest(_) => false,
        }
    }

    /// Whether this is a pure connectivity failure (connect timeout or DNS).
    ///
    /// These select the short retry interval table when the caller opted in.
    pub fn is_connectivity_failure(&self) -> bool {
        matches!(
            self,
            HttpError::Network {
                kind: NetworkErrorKind::ConnectTimeout | NetworkErrorKind::UnresolvedHost,
                ..
            }
        )
    }

    /// Server-directed retry delay from the response headers, if present.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            HttpError::Status { headers, .. } => {
                headers.get(RETRY_AFTER_MS_HEADER)?.parse().ok()
            }
            _ => None,
        }
    }
}

/// Whether an HTTP status code is worth retrying.
pub fn is_recoverable_status(status: u16) -> bool {
    RECOVERABLE_STATUS_CODES.contains(&status) || (500..=599).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_error(status: u16) -> HttpError {
        HttpError::Status { status, headers: HashMap::new(), body: String::new() }
    }

    #[test]
    fn test_recoverable_status_table() {
        assert!(is_recoverable_status(408));
        assert!(is_recoverable_status(429));
        assert!(is_recoverable_status(500));
        assert!(is_recoverable_status(503));
        assert!(is_recoverable_status(599));

        assert!(!is_recoverable_status(400));
        assert!(!is_recoverable_status(401));
        assert!(!is_recoverable_status(404));
        assert!(!is_recoverable_status(409));
    }

    #[test]
    fn test_network_errors_always_recoverable() {
        for kind in [
            NetworkErrorKind::ConnectTimeout,
            NetworkErrorKind::UnresolvedHost,
            NetworkErrorKind::Io,
        ] {
            let err = HttpError::Network { kind, message: "boom".to_string() };
            assert!(err.is_recoverable());
        }
    }

    #[test]
    fn test_connectivity_failure_classification() {
        let timeout = HttpError::Network {
            kind: NetworkErrorKind::ConnectTimeout,
            message: "timed out".to_string(),
        };
        let dns = HttpError::Network {
            kind: NetworkErrorKind::UnresolvedHost,
            message: "no such host".to_string(),
        };
        let io = HttpError::Network {
            kind: NetworkErrorKind::Io,
            message: "reset".to_string(),
        };

        assert!(timeout.is_connectivity_failure());
        assert!(dns.is_connectivity_failure());
        assert!(!io.is_connectivity_failure());
        assert!(!status_error(503).is_connectivity_failure());
    }

    #[test]
    fn test_cancelled_and_invalid_never_recoverable() {
        assert!(!HttpError::Cancelled.is_recoverable());
        assert!(!HttpError::InvalidRequest("bad".to_string()).is_recoverable());
    }

    #[test]
    fn test_retry_after_header_parsing() {
        let mut headers = HashMap::new();
        headers.insert(RETRY_AFTER_MS_HEADER.to_string(), "1234".to_string());
        let err = HttpError::Status { status: 429, headers, body: String::new() };
        assert_eq!(err.retry_after_ms(), Some(1234));

        assert_eq!(status_error(429).retry_after_ms(), None);

        let mut bad = HashMap::new();
        bad.insert(RETRY_AFTER_MS_HEADER.to_string(), "soon".to_string());
        let err = HttpError::Status { status: 429, headers: bad, body: String::new() };
        assert_eq!(err.retry_after_ms(), None);
    }
}
