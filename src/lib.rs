//! Tidesync: an offline-first document sync SDK
//!
//! Documents live in a partitioned remote store and are mirrored into a
//! local SQLite cache. While offline, reads are served from the cache and
//! mutations are queued in a pending-operation outbox; when connectivity
//! returns, queued operations are replayed against the remote store exactly
//! once each and the cache is reconciled with the outcome.
//!
//! ```no_run
//! use tidesync::{DataSyncCoordinator, LocalDocumentStorage, StorageConfig, SyncConfig};
//!
//! # async fn example() -> tidesync::Result<()> {
//! let storage = LocalDocumentStorage::open(StorageConfig::new("app.db"))
//!     .await
//!     .map_err(|e| tidesync::DataError::LocalStorage(e.to_string()))?;
//! let sync = DataSyncCoordinator::new(SyncConfig::new("app-secret"), storage)?;
//! let doc: tidesync::DocumentWrapper<serde_json::Value> =
//!     sync.read("readonly", "welcome", &Default::default()).await;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub use data_sync::{
    DataSyncCoordinator, NetworkWatcher, RemoteOperationListener, SyncConfig, DEFAULT_API_URL,
    READONLY_PARTITION, USER_PARTITION,
};
pub use document_client::{
    DataError, DeviceTimeToLive, DocumentMetadata, DocumentWrapper, Page, PaginatedDocuments,
    PendingOperationKind, ReadOptions, Result, TokenResult, WriteOptions,
};
pub use networking::{HttpError, HttpTransport, NetworkErrorKind, ReqwestTransport, Retryer};
pub use storage::{user_table_name, LocalDocumentStorage, StorageConfig, APP_DOCUMENTS_TABLE};
