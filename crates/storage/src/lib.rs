//! Durable local document cache for the Tidesync SDK
//!
//! `LocalDocumentStorage` is the single source of truth while offline: a
//! SQLite-backed cache of remote documents keyed by (partition, document id),
//! with a pending-operation column acting as the outbox of unconfirmed
//! mutations.

#![warn(clippy::all)]

pub mod local;

pub use local::{LocalDocumentStorage, StorageConfig, StorageError};

/// Physical table holding app-scoped (readonly and custom partition)
/// documents.
pub const APP_DOCUMENTS_TABLE: &str = "app_documents";

/// Physical table name for a signed-in user's documents.
pub fn user_table_name(account_id: &str) -> String {
    format!("user_{}", account_id.replace('-', "_"))
}
