//! Remote operation completion notifications

use document_client::{DataError, DocumentMetadata, PendingOperationKind};

/// Observer for queued operations replayed against the remote store.
///
/// Invoked once per drained operation, after the local cache has been
/// reconciled with the outcome. On success `metadata` carries the confirmed
/// document identity; on failure `error` carries the cause and `metadata` is
/// absent.
pub trait RemoteOperationListener: Send + Sync {
    /// Called when a replayed operation completes, successfully or not.
    fn on_remote_operation_completed(
        &self,
        operation: PendingOperationKind,
        metadata: Option<DocumentMetadata>,
        error: Option<&DataError>,
    );
}
