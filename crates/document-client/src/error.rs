//! Error taxonomy for document sync operations

use networking::HttpError;
use thiserror::Error;

/// Errors that can occur during document sync operations.
///
/// Storage faults never cross the local storage boundary as raw errors; they
/// arrive here already converted to `LocalStorage`. HTTP faults keep their
/// original cause so 404/409 tombstone logic can inspect the status.
#[derive(Debug, Error)]
pub enum DataError {
    /// Partition name is not one of the allowed logical partitions.
    #[error("partition name can be either 'readonly' or 'user' but not '{0}'")]
    InvalidPartition(String),

    /// Token exchange returned a malformed or failed response.
    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    /// A network or HTTP status failure from the remote document store.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// The document was not found in the local cache (miss, expiry, or a
    /// pending-delete tombstone).
    #[error("document not found: {0}")]
    NotFound(String),

    /// A fault inside the local document storage layer.
    #[error("local storage failure: {0}")]
    LocalStorage(String),

    /// The operation requires connectivity (or a previously cached token)
    /// that is not available.
    #[error("device is offline: {0}")]
    Offline(String),

    /// The payload did not match the expected document shape.
    #[error("serialization failure: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The operation was cancelled by disabling the sync service.
    #[error("operation cancelled")]
    Cancelled,
}

impl DataError {
    /// HTTP status code of the underlying failure, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            DataError::Http(http) => http.status(),
            _ => None,
        }
    }
}

/// Result alias for document sync operations.
pub type Result<T> = std::result::Result<T, DataError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_http_status_passthrough() {
        let err = DataError::Http(HttpError::Status {
            status: 409,
            headers: HashMap::new(),
            body: String::new(),
        });
        assert_eq!(err.http_status(), Some(409));

        assert_eq!(DataError::Cancelled.http_status(), None);
        assert_eq!(DataError::NotFound("x".to_string()).http_status(), None);
    }

    #[test]
    fn test_invalid_partition_message_names_partition() {
        let err = DataError::InvalidPartition("nope".to_string());
        assert!(err.to_string().contains("'nope'"));
    }
}
