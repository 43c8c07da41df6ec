//! SQLite-backed local document cache
//!
//! One row per (partition, document id). The `pending_operation` column is
//! the outbox: a non-null value marks a local mutation not yet confirmed by
//! the remote store. Reads and offline writes never return a raw error to the
//! caller; storage faults are logged and folded into error-carrying document
//! wrappers (or a `false` return for fire-and-forget writes), so a broken
//! disk degrades the SDK instead of failing it.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use document_client::{
    DataError, DocumentWrapper, PendingOperation, PendingOperationKind, ReadOptions, WriteOptions,
};

use crate::APP_DOCUMENTS_TABLE;

/// Storage error types
#[derive(Debug, Error)]
pub enum StorageError {
    /// SQLx error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A table name that is not a plain identifier
    #[error("invalid table name: {0}")]
    InvalidTableName(String),
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Local storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Database file path
    pub path: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Connection timeout
    pub connect_timeout: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "tidesync.db".to_string(),
            max_connections: 5,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl StorageConfig {
    /// Create a configuration for the given database file path
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Set maximum connections
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }
}

/// SQLite-backed document cache and pending-operation outbox.
pub struct LocalDocumentStorage {
    pool: SqlitePool,
}

impl LocalDocumentStorage {
    /// Open (creating if missing) the cache database at the configured path.
    pub async fn open(config: StorageConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", config.path))
            .map_err(|e| StorageError::Config(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.create_table_if_not_exists(APP_DOCUMENTS_TABLE).await?;
        Ok(storage)
    }

    /// Open an in-memory cache (tests).
    ///
    /// A single pooled connection keeps the memory database alive for the
    /// storage's lifetime.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StorageError::Config(e.to_string()))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.create_table_if_not_exists(APP_DOCUMENTS_TABLE).await?;
        Ok(storage)
    }

    /// Create a document table if it does not exist yet.
    ///
    /// Called lazily for per-user tables when an account signs in.
    pub async fn create_table_if_not_exists(&self, table: &str) -> Result<()> {
        validate_table_name(table)?;
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" (
                partition TEXT NOT NULL,
                document_id TEXT NOT NULL,
                document TEXT,
                etag TEXT,
                timestamp INTEGER NOT NULL DEFAULT 0,
                expiration_time INTEGER,
                download_time INTEGER NOT NULL DEFAULT 0,
                operation_time INTEGER NOT NULL DEFAULT 0,
                pending_operation TEXT,
                PRIMARY KEY (partition, document_id)
            )"
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    /// Drop every document table and recreate the shared app table.
    pub async fn reset_database(&self) -> Result<()> {
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND (name = ? OR name LIKE 'user\\_%' ESCAPE '\\')",
        )
        .bind(APP_DOCUMENTS_TABLE)
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let name: String = row.get("name");
            validate_table_name(&name)?;
            sqlx::query(&format!("DROP TABLE \"{name}\""))
                .execute(&self.pool)
                .await?;
        }
        self.create_table_if_not_exists(APP_DOCUMENTS_TABLE).await
    }

    /// Read a cached document.
    ///
    /// A miss, a delete tombstone, an elapsed device TTL, or an elapsed read
    /// TTL all surface as a `NotFound` error inside the wrapper. Stale rows
    /// are purged as a side effect.
    pub async fn read<T: DeserializeOwned>(
        &self,
        table: &str,
        partition: &str,
        document_id: &str,
        read_options: &ReadOptions,
    ) -> DocumentWrapper<T> {
        match self.read_inner(table, partition, document_id, read_options).await {
            Ok(wrapper) => wrapper,
            Err(e) => {
                tracing::error!(table, partition, document_id, error = %e, "failed to read from the local cache");
                DocumentWrapper::from_error(DataError::LocalStorage(e.to_string()))
                    .with_from_cache(true)
            }
        }
    }

    async fn read_inner<T: DeserializeOwned>(
        &self,
        table: &str,
        partition: &str,
        document_id: &str,
        read_options: &ReadOptions,
    ) -> Result<DocumentWrapper<T>> {
        validate_table_name(table)?;
        let not_found = || {
            DocumentWrapper::from_error(DataError::NotFound(format!(
                "document {partition}/{document_id} not found in the local cache"
            )))
            .with_from_cache(true)
        };

        let sql = format!(
            "SELECT document, etag, timestamp, expiration_time, download_time, pending_operation
             FROM \"{table}\" WHERE partition = ? AND document_id = ?"
        );
        let Some(row) = sqlx::query(&sql)
            .bind(partition)
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(not_found());
        };

        let pending = row
            .get::<Option<String>, _>("pending_operation")
            .as_deref()
            .and_then(PendingOperationKind::parse);
        if pending == Some(PendingOperationKind::Delete) {
            return Ok(not_found());
        }

        let now_ms = Utc::now().timestamp_millis();
        let expiration_time: Option<i64> = row.get("expiration_time");
        let download_time: i64 = row.get("download_time");
        if expiration_time.is_some_and(|t| t <= now_ms)
            || read_options.is_expired(download_time, now_ms)
        {
            tracing::debug!(table, partition, document_id, "cached document expired, purging");
            self.delete_row(table, partition, document_id).await?;
            return Ok(not_found());
        }

        let payload: Option<String> = row.get("document");
        let Some(payload) = payload else {
            return Ok(not_found());
        };
        let document: T = serde_json::from_str(&payload)?;
        let mut wrapper = DocumentWrapper::new(document, partition, document_id);
        wrapper.etag = row.get::<Option<String>, _>("etag").unwrap_or_default();
        wrapper.timestamp = row.get("timestamp");
        wrapper.pending_operation = pending;
        Ok(wrapper.with_from_cache(true))
    }

    /// Queue a create or replace performed while offline.
    ///
    /// The queued kind is `Replace` when a live cached row already exists for
    /// the key, `Create` otherwise; a newer offline write supersedes any
    /// operation already queued for the same key.
    pub async fn create_or_update_offline<T: Serialize>(
        &self,
        table: &str,
        partition: &str,
        document_id: &str,
        document: T,
        write_options: &WriteOptions,
    ) -> DocumentWrapper<T> {
        match self
            .create_or_update_offline_inner(table, partition, document_id, document, write_options)
            .await
        {
            Ok(wrapper) => wrapper,
            Err(e) => {
                tracing::error!(table, partition, document_id, error = %e, "failed to queue an offline write");
                DocumentWrapper::from_error(DataError::LocalStorage(e.to_string()))
                    .with_from_cache(true)
            }
        }
    }

    async fn create_or_update_offline_inner<T: Serialize>(
        &self,
        table: &str,
        partition: &str,
        document_id: &str,
        document: T,
        write_options: &WriteOptions,
    ) -> Result<DocumentWrapper<T>> {
        validate_table_name(table)?;
        let sql = format!(
            "SELECT pending_operation FROM \"{table}\" WHERE partition = ? AND document_id = ?"
        );
        let existing = sqlx::query(&sql)
            .bind(partition)
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?;
        let live = existing.as_ref().is_some_and(|row: &SqliteRow| {
            row.get::<Option<String>, _>("pending_operation")
                .as_deref()
                .and_then(PendingOperationKind::parse)
                != Some(PendingOperationKind::Delete)
        });
        let kind = if live {
            PendingOperationKind::Replace
        } else {
            PendingOperationKind::Create
        };

        let payload = serde_json::to_string(&document)?;
        let now_ms = Utc::now().timestamp_millis();
        let sql = format!(
            "INSERT OR REPLACE INTO \"{table}\"
             (partition, document_id, document, etag, timestamp, expiration_time,
              download_time, operation_time, pending_operation)
             VALUES (?, ?, ?, NULL, 0, ?, ?, ?, ?)"
        );
        sqlx::query(&sql)
            .bind(partition)
            .bind(document_id)
            .bind(&payload)
            .bind(write_options.expiration_time(now_ms))
            .bind(now_ms)
            .bind(now_ms)
            .bind(kind.as_str())
            .execute(&self.pool)
            .await?;
        tracing::debug!(table, partition, document_id, kind = %kind, "queued an offline write");

        let mut wrapper = DocumentWrapper::new(document, partition, document_id);
        wrapper.pending_operation = Some(kind);
        Ok(wrapper.with_from_cache(true))
    }

    /// Cache a server-confirmed document state.
    ///
    /// A no-cache write policy removes any local copy instead. Returns false
    /// when the write could not be persisted.
    pub async fn write_online<T: Serialize>(
        &self,
        table: &str,
        wrapper: &DocumentWrapper<T>,
        write_options: &WriteOptions,
    ) -> bool {
        let result = self.write_online_inner(table, wrapper, write_options).await;
        if let Err(e) = &result {
            tracing::error!(table, partition = %wrapper.partition, document_id = %wrapper.id, error = %e, "failed to cache a confirmed document");
        }
        result.is_ok()
    }

    async fn write_online_inner<T: Serialize>(
        &self,
        table: &str,
        wrapper: &DocumentWrapper<T>,
        write_options: &WriteOptions,
    ) -> Result<()> {
        validate_table_name(table)?;
        if matches!(
            write_options.device_time_to_live,
            document_client::DeviceTimeToLive::NoCache
        ) {
            return self.delete_row(table, &wrapper.partition, &wrapper.id).await;
        }

        let payload = match &wrapper.document {
            Some(document) => Some(serde_json::to_string(document)?),
            None => None,
        };
        let now_ms = Utc::now().timestamp_millis();
        let sql = format!(
            "INSERT OR REPLACE INTO \"{table}\"
             (partition, document_id, document, etag, timestamp, expiration_time,
              download_time, operation_time, pending_operation)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL)"
        );
        sqlx::query(&sql)
            .bind(&wrapper.partition)
            .bind(&wrapper.id)
            .bind(payload)
            .bind(if wrapper.etag.is_empty() { None } else { Some(wrapper.etag.as_str()) })
            .bind(wrapper.timestamp)
            .bind(write_options.expiration_time(now_ms))
            .bind(now_ms)
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Queue a delete performed while offline, leaving a tombstone row.
    ///
    /// The last known etag survives on the tombstone so the replay can still
    /// identify the server copy.
    pub async fn delete_offline(&self, table: &str, partition: &str, document_id: &str) -> bool {
        let result = self.delete_offline_inner(table, partition, document_id).await;
        if let Err(e) = &result {
            tracing::error!(table, partition, document_id, error = %e, "failed to queue an offline delete");
        }
        result.is_ok()
    }

    async fn delete_offline_inner(
        &self,
        table: &str,
        partition: &str,
        document_id: &str,
    ) -> Result<()> {
        validate_table_name(table)?;
        let now_ms = Utc::now().timestamp_millis();
        let sql = format!(
            "INSERT INTO \"{table}\"
             (partition, document_id, document, etag, timestamp, expiration_time,
              download_time, operation_time, pending_operation)
             VALUES (?, ?, NULL, NULL, 0, NULL, 0, ?, ?)
             ON CONFLICT (partition, document_id) DO UPDATE SET
                document = NULL,
                expiration_time = NULL,
                operation_time = excluded.operation_time,
                pending_operation = excluded.pending_operation"
        );
        sqlx::query(&sql)
            .bind(partition)
            .bind(document_id)
            .bind(now_ms)
            .bind(PendingOperationKind::Delete.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove the local row for a server-confirmed delete.
    pub async fn delete_online(&self, table: &str, partition: &str, document_id: &str) -> bool {
        let result = self.delete_row(table, partition, document_id).await;
        if let Err(e) = &result {
            tracing::error!(table, partition, document_id, error = %e, "failed to remove a cached document");
        }
        result.is_ok()
    }

    async fn delete_row(&self, table: &str, partition: &str, document_id: &str) -> Result<()> {
        validate_table_name(table)?;
        let sql = format!("DELETE FROM \"{table}\" WHERE partition = ? AND document_id = ?");
        sqlx::query(&sql)
            .bind(partition)
            .bind(document_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All queued pending operations in a table, oldest first.
    ///
    /// A storage fault yields an empty list; the next drain retries.
    pub async fn pending_operations(&self, table: &str) -> Vec<PendingOperation> {
        match self.pending_operations_inner(table).await {
            Ok(operations) => operations,
            Err(e) => {
                tracing::error!(table, error = %e, "failed to list pending operations");
                Vec::new()
            }
        }
    }

    async fn pending_operations_inner(&self, table: &str) -> Result<Vec<PendingOperation>> {
        validate_table_name(table)?;
        let sql = format!(
            "SELECT partition, document_id, document, etag, expiration_time, operation_time,
                    pending_operation
             FROM \"{table}\" WHERE pending_operation IS NOT NULL ORDER BY rowid"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let operations = rows
            .into_iter()
            .filter_map(|row| {
                let kind = row
                    .get::<Option<String>, _>("pending_operation")
                    .as_deref()
                    .and_then(PendingOperationKind::parse)?;
                Some(PendingOperation {
                    table: table.to_string(),
                    partition: row.get("partition"),
                    document_id: row.get("document_id"),
                    document: row.get("document"),
                    etag: row.get("etag"),
                    expiration_time: row.get("expiration_time"),
                    operation_time: row.get("operation_time"),
                    kind,
                })
            })
            .collect();
        Ok(operations)
    }

    /// Persist a replayed operation's confirmed state and clear its marker.
    ///
    /// A row superseded by a newer local write (its operation time no longer
    /// matches) is left untouched so the newer write stays queued; returns
    /// whether the confirmed state was written.
    pub async fn update_pending_operation(
        &self,
        operation: &PendingOperation,
        etag: Option<&str>,
        timestamp: Option<i64>,
    ) -> bool {
        match self
            .update_pending_operation_inner(operation, etag, timestamp)
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                tracing::error!(
                    table = %operation.table,
                    partition = %operation.partition,
                    document_id = %operation.document_id,
                    error = %e,
                    "failed to clear a pending operation"
                );
                false
            }
        }
    }

    async fn update_pending_operation_inner(
        &self,
        operation: &PendingOperation,
        etag: Option<&str>,
        timestamp: Option<i64>,
    ) -> Result<bool> {
        validate_table_name(&operation.table)?;
        let now_ms = Utc::now().timestamp_millis();
        let sql = format!(
            "UPDATE \"{}\" SET document = ?, etag = ?,
                    timestamp = COALESCE(?, timestamp),
                    download_time = ?, pending_operation = NULL
             WHERE partition = ? AND document_id = ? AND operation_time = ?",
            operation.table
        );
        let result = sqlx::query(&sql)
            .bind(operation.document.as_deref())
            .bind(etag.or(operation.etag.as_deref()))
            .bind(timestamp)
            .bind(now_ms)
            .bind(&operation.partition)
            .bind(&operation.document_id)
            .bind(operation.operation_time)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove the row of a replayed operation, unless a newer local write
    /// superseded it while the replay was in flight.
    pub async fn purge_replayed(&self, operation: &PendingOperation) -> bool {
        let result = self.purge_replayed_inner(operation).await;
        if let Err(e) = &result {
            tracing::error!(
                table = %operation.table,
                partition = %operation.partition,
                document_id = %operation.document_id,
                error = %e,
                "failed to purge a replayed document"
            );
        }
        result.is_ok()
    }

    async fn purge_replayed_inner(&self, operation: &PendingOperation) -> Result<()> {
        validate_table_name(&operation.table)?;
        let sql = format!(
            "DELETE FROM \"{}\" WHERE partition = ? AND document_id = ? AND operation_time = ?",
            operation.table
        );
        sqlx::query(&sql)
            .bind(&operation.partition)
            .bind(&operation.document_id)
            .bind(operation.operation_time)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Table names are interpolated into SQL and must be plain identifiers.
fn validate_table_name(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidTableName(table.to_string()))
    }
}
