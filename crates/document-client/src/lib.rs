//! Remote document store client for the Tidesync SDK
//!
//! This crate holds the document data model shared across the SDK, the error
//! taxonomy for sync operations, the partition token exchange client with its
//! in-memory token cache, and the Cosmos-style remote document client.

#![warn(clippy::all)]

pub mod error;
pub mod models;
pub mod remote;
pub mod token;

pub use error::{DataError, Result};
pub use models::{
    etag_from_payload, parse_document, parse_documents, timestamp_from_payload, DeviceTimeToLive,
    DocumentMetadata, DocumentWrapper, Page, PendingOperation, PendingOperationKind, ReadOptions,
    WriteOptions,
};
pub use remote::{DocumentServiceClient, PaginatedDocuments};
pub use token::{logical_partition_name, TokenManager, TokenResult};
