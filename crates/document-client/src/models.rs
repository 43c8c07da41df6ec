//! Document data model
//!
//! `DocumentWrapper` mirrors the remote store's wire envelope
//! (`PartitionKey`, `id`, `_etag`, `_ts`, `document`) and carries local-only
//! state on top: a terminal error, the from-cache flag, and any pending
//! operation marker surfaced by the local storage layer.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DataError;

/// A document wrapper either carries a payload or a terminal error, never
/// both. An "empty success" (no payload, no error) represents a delete
/// acknowledgment.
#[derive(Debug, Serialize, Deserialize)]
pub struct DocumentWrapper<T> {
    /// Logical namespace of the document.
    #[serde(rename = "PartitionKey", default)]
    pub partition: String,

    /// Document id, unique within its partition.
    #[serde(rename = "id", default)]
    pub id: String,

    /// Opaque server version stamp; empty until the first confirmed write.
    #[serde(rename = "_etag", default)]
    pub etag: String,

    /// Server-assigned timestamp, UTC epoch seconds.
    #[serde(rename = "_ts", default)]
    pub timestamp: i64,

    /// The user payload.
    #[serde(rename = "document", skip_serializing_if = "Option::is_none")]
    pub document: Option<T>,

    /// Terminal error, local-only.
    #[serde(skip)]
    pub error: Option<DataError>,

    /// Whether this state was served from the local cache.
    #[serde(skip)]
    pub from_cache: bool,

    /// Pending operation marker surfaced from the local cache row.
    #[serde(skip)]
    pub pending_operation: Option<PendingOperationKind>,
}

impl<T> DocumentWrapper<T> {
    /// Wrapper for a document about to be written (no etag/timestamp yet).
    pub fn new(document: T, partition: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            id: id.into(),
            etag: String::new(),
            timestamp: 0,
            document: Some(document),
            error: None,
            from_cache: false,
            pending_operation: None,
        }
    }

    /// Empty success, e.g. a delete acknowledgment.
    pub fn empty() -> Self {
        Self {
            partition: String::new(),
            id: String::new(),
            etag: String::new(),
            timestamp: 0,
            document: None,
            error: None,
            from_cache: false,
            pending_operation: None,
        }
    }

    /// Wrapper carrying a terminal error.
    pub fn from_error(error: DataError) -> Self {
        Self {
            partition: String::new(),
            id: String::new(),
            etag: String::new(),
            timestamp: 0,
            document: None,
            error: Some(error),
            from_cache: false,
            pending_operation: None,
        }
    }

    /// Whether the wrapper carries a terminal error.
    pub fn has_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Mark the wrapper as served from the local cache.
    pub fn with_from_cache(mut self, from_cache: bool) -> Self {
        self.from_cache = from_cache;
        self
    }
}

impl<T: Serialize> DocumentWrapper<T> {
    /// Serialize the wire envelope (local-only fields excluded).
    pub fn to_json(&self) -> Result<String, DataError> {
        serde_json::to_string(self).map_err(DataError::from)
    }
}

impl<T> fmt::Display for DocumentWrapper<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition, self.id)
    }
}

/// Parse a single-document response envelope.
///
/// A malformed envelope yields an error-carrying wrapper, never a panic.
pub fn parse_document<T: DeserializeOwned>(payload: &str) -> DocumentWrapper<T> {
    match serde_json::from_str::<DocumentWrapper<T>>(payload) {
        Ok(wrapper) => wrapper,
        Err(e) => DocumentWrapper::from_error(DataError::Serialization(e)),
    }
}

/// Extract the `_etag` field from a raw response payload.
pub fn etag_from_payload(payload: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    value.get("_etag")?.as_str().map(str::to_string)
}

/// Extract the server `_ts` field from a raw response payload.
pub fn timestamp_from_payload(payload: &str) -> Option<i64> {
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    value.get("_ts")?.as_i64()
}

/// Wire envelope for list responses.
#[derive(Debug, Deserialize)]
struct ListEnvelope {
    #[serde(rename = "Documents", default)]
    documents: Vec<serde_json::Value>,
}

/// One page of a paginated list response.
#[derive(Debug)]
pub struct Page<T> {
    /// Documents on this page; individual envelope parse failures become
    /// error-carrying wrappers in place.
    pub items: Vec<DocumentWrapper<T>>,
}

/// Parse a list response envelope (`{"Documents": [...]}`).
pub fn parse_documents<T: DeserializeOwned>(payload: &str) -> Result<Page<T>, DataError> {
    let envelope: ListEnvelope = serde_json::from_str(payload)?;
    let items = envelope
        .documents
        .into_iter()
        .map(|value| match serde_json::from_value::<DocumentWrapper<T>>(value) {
            Ok(wrapper) => wrapper,
            Err(e) => DocumentWrapper::from_error(DataError::Serialization(e)),
        })
        .collect();
    Ok(Page { items })
}

/// Identity of a synced document, delivered to remote-operation listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentMetadata {
    /// Logical partition.
    pub partition: String,
    /// Document id.
    pub id: String,
    /// Server version stamp after the operation, if known.
    pub etag: Option<String>,
}

/// Kind of a locally queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOperationKind {
    /// Document created offline, not yet on the server.
    Create,
    /// Document replaced offline.
    Replace,
    /// Document deleted offline (tombstone).
    Delete,
}

impl PendingOperationKind {
    /// Stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingOperationKind::Create => "CREATE",
            PendingOperationKind::Replace => "REPLACE",
            PendingOperationKind::Delete => "DELETE",
        }
    }

    /// Parse the stored string form.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "CREATE" => Some(PendingOperationKind::Create),
            "REPLACE" => Some(PendingOperationKind::Replace),
            "DELETE" => Some(PendingOperationKind::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for PendingOperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A local mutation not yet confirmed by the remote store.
///
/// At most one pending operation exists per (partition, document id) key; a
/// newer offline write supersedes an older queued one for the same key.
#[derive(Debug, Clone)]
pub struct PendingOperation {
    /// Physical storage table holding the row.
    pub table: String,
    /// Logical partition (stored form; user partitions carry the account id).
    pub partition: String,
    /// Document id.
    pub document_id: String,
    /// Serialized document payload; `None` for deletes.
    pub document: Option<String>,
    /// Last known etag, if any.
    pub etag: Option<String>,
    /// Epoch milliseconds after which the local copy must be purged
    /// regardless of replay outcome; `None` means never.
    pub expiration_time: Option<i64>,
    /// Epoch milliseconds of the local write that queued this operation.
    /// A newer write for the same key changes it, so a finished replay can
    /// tell whether its row was superseded while it was in flight.
    pub operation_time: i64,
    /// Queued operation kind.
    pub kind: PendingOperationKind,
}

impl PendingOperation {
    /// Whether the row's device TTL has elapsed.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiration_time.is_some_and(|t| t <= now_ms)
    }
}

/// Device-side cache lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceTimeToLive {
    /// Cached copy never expires.
    #[default]
    Infinite,
    /// Bypass the cache entirely.
    NoCache,
    /// Cached copy is valid for this many seconds.
    Seconds(u64),
}

/// Options controlling cache reads.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// How long a cached row stays fresh.
    pub device_time_to_live: DeviceTimeToLive,
    /// Serve the read from the local cache only, never confirming remotely
    /// even when online. Distinct from `no_cache`, which is the opposite
    /// policy: never serve a cached row.
    pub cache_only: bool,
}

impl ReadOptions {
    /// Cached rows never expire.
    pub fn infinite() -> Self {
        Self { device_time_to_live: DeviceTimeToLive::Infinite, cache_only: false }
    }

    /// Never serve from cache.
    pub fn no_cache() -> Self {
        Self { device_time_to_live: DeviceTimeToLive::NoCache, cache_only: false }
    }

    /// Serve from the local cache without remote confirmation.
    pub fn cache_only() -> Self {
        Self { device_time_to_live: DeviceTimeToLive::Infinite, cache_only: true }
    }

    /// Cached rows are fresh for `seconds`.
    pub fn ttl(seconds: u64) -> Self {
        Self { device_time_to_live: DeviceTimeToLive::Seconds(seconds), cache_only: false }
    }

    /// Whether a row downloaded at `download_time_ms` is stale at `now_ms`.
    pub fn is_expired(&self, download_time_ms: i64, now_ms: i64) -> bool {
        match self.device_time_to_live {
            DeviceTimeToLive::Infinite => false,
            DeviceTimeToLive::NoCache => true,
            DeviceTimeToLive::Seconds(s) => download_time_ms + (s as i64) * 1000 <= now_ms,
        }
    }
}

/// Options controlling cache writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// How long the written row may live on the device.
    pub device_time_to_live: DeviceTimeToLive,
}

impl WriteOptions {
    /// Written rows never expire.
    pub fn infinite() -> Self {
        Self { device_time_to_live: DeviceTimeToLive::Infinite }
    }

    /// Do not keep a local copy.
    pub fn no_cache() -> Self {
        Self { device_time_to_live: DeviceTimeToLive::NoCache }
    }

    /// Written rows live for `seconds`.
    pub fn ttl(seconds: u64) -> Self {
        Self { device_time_to_live: DeviceTimeToLive::Seconds(seconds) }
    }

    /// Absolute expiration for a row written at `now_ms`, if any.
    pub fn expiration_time(&self, now_ms: i64) -> Option<i64> {
        match self.device_time_to_live {
            DeviceTimeToLive::Infinite | DeviceTimeToLive::NoCache => None,
            DeviceTimeToLive::Seconds(s) => Some(now_ms + (s as i64) * 1000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TestDoc {
        test: String,
    }

    #[test]
    fn test_parse_document_round_trip() {
        let payload = r#"{
            "document": {"test": "value"},
            "id": "document-id",
            "PartitionKey": "readonly",
            "_etag": "\"06000da6-0000-0000-0000-5c7093c30000\"",
            "_ts": 1550879683
        }"#;
        let wrapper: DocumentWrapper<TestDoc> = parse_document(payload);

        assert!(!wrapper.has_failed());
        assert_eq!(wrapper.partition, "readonly");
        assert_eq!(wrapper.id, "document-id");
        assert_eq!(wrapper.etag, "\"06000da6-0000-0000-0000-5c7093c30000\"");
        assert_eq!(wrapper.timestamp, 1550879683);
        assert_eq!(wrapper.document.unwrap().test, "value");

        // Serialize again: wire fields survive, local-only state does not.
        let serialized = serde_json::to_value(DocumentWrapper::new(
            TestDoc { test: "value".to_string() },
            "readonly",
            "document-id",
        ))
        .unwrap();
        assert_eq!(serialized["PartitionKey"], "readonly");
        assert_eq!(serialized["id"], "document-id");
        assert_eq!(serialized["document"]["test"], "value");
        assert!(serialized.get("error").is_none());
        assert!(serialized.get("from_cache").is_none());
    }

    #[test]
    fn test_parse_document_malformed_payload() {
        let wrapper: DocumentWrapper<TestDoc> = parse_document("not json at all");
        assert!(wrapper.has_failed());
        assert!(matches!(wrapper.error, Some(DataError::Serialization(_))));
    }

    #[test]
    fn test_parse_document_missing_etag_defaults_empty() {
        let payload = r#"{
            "document": {"test": "value"},
            "id": "document-id",
            "PartitionKey": "readonly",
            "_ts": 1550879683
        }"#;
        let wrapper: DocumentWrapper<TestDoc> = parse_document(payload);
        assert!(!wrapper.has_failed());
        assert_eq!(wrapper.etag, "");
    }

    #[test]
    fn test_parse_documents_page() {
        let payload = r#"{"Documents": [
            {"document": {"test": "a"}, "id": "1", "PartitionKey": "readonly", "_ts": 1},
            {"document": {"test": "b"}, "id": "2", "PartitionKey": "readonly", "_ts": 2}
        ]}"#;
        let page: Page<TestDoc> = parse_documents(payload).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].id, "1");
        assert_eq!(page.items[1].document.as_ref().unwrap().test, "b");
    }

    #[test]
    fn test_etag_from_payload() {
        let payload = r#"{"id": "x", "_etag": "\"abc\""}"#;
        assert_eq!(etag_from_payload(payload), Some("\"abc\"".to_string()));
        assert_eq!(etag_from_payload(r#"{"id": "x"}"#), None);
        assert_eq!(etag_from_payload("garbage"), None);
    }

    #[test]
    fn test_timestamp_from_payload() {
        let payload = r#"{"id": "x", "_ts": 1550879683}"#;
        assert_eq!(timestamp_from_payload(payload), Some(1550879683));
        assert_eq!(timestamp_from_payload(r#"{"id": "x"}"#), None);
        assert_eq!(timestamp_from_payload("garbage"), None);
    }

    #[test]
    fn test_pending_operation_kind_string_forms() {
        for kind in [
            PendingOperationKind::Create,
            PendingOperationKind::Replace,
            PendingOperationKind::Delete,
        ] {
            assert_eq!(PendingOperationKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(PendingOperationKind::parse("UNKNOWN"), None);
    }

    #[test]
    fn test_read_options_expiry() {
        let now = 1_000_000;
        assert!(!ReadOptions::infinite().is_expired(0, now));
        assert!(ReadOptions::no_cache().is_expired(now, now));

        let opts = ReadOptions::ttl(10);
        assert!(!opts.is_expired(now - 9_999, now));
        assert!(opts.is_expired(now - 10_000, now));
    }

    #[test]
    fn test_write_options_expiration_time() {
        let now = 5_000;
        assert_eq!(WriteOptions::infinite().expiration_time(now), None);
        assert_eq!(WriteOptions::no_cache().expiration_time(now), None);
        assert_eq!(WriteOptions::ttl(60).expiration_time(now), Some(now + 60_000));
    }

    #[test]
    fn test_pending_operation_expiry() {
        let op = PendingOperation {
            table: "app_documents".to_string(),
            partition: "readonly".to_string(),
            document_id: "doc".to_string(),
            document: None,
            etag: None,
            expiration_time: Some(100),
            operation_time: 0,
            kind: PendingOperationKind::Delete,
        };
        assert!(op.is_expired(100));
        assert!(!op.is_expired(99));

        let never = PendingOperation { expiration_time: None, ..op };
        assert!(!never.is_expired(i64::MAX));
    }
}
