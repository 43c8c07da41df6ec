//! Offline-first sync coordinator
//!
//! `DataSyncCoordinator` ties the layers together: CRUD calls go remote when
//! the device is online and fall back to the local cache and the
//! pending-operation outbox when it is not. An offline-to-online transition
//! drains the outbox, replaying each queued mutation at most once.
//!
//! Operations never surface transport or storage faults as panics; single
//! document calls always resolve to a `DocumentWrapper` that either carries
//! the payload or the terminal error.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use document_client::remote::{upsert_header, CONTINUATION_TOKEN_HEADER};
use document_client::token::get_db_token;
use document_client::{
    logical_partition_name, parse_document, parse_documents, DataError, DocumentMetadata,
    DocumentServiceClient, DocumentWrapper, PaginatedDocuments, PendingOperation,
    PendingOperationKind, ReadOptions, Result, TokenManager, TokenResult, WriteOptions,
};
use networking::{HttpMethod, HttpTransport, ReqwestTransport, Retryer};
use storage::{user_table_name, LocalDocumentStorage, APP_DOCUMENTS_TABLE};

use crate::listener::RemoteOperationListener;
use crate::network::NetworkWatcher;

/// Default token exchange base URL.
pub const DEFAULT_API_URL: &str = "https://api.appcenter.ms/v0.1";

/// Logical partition shared by all app installs.
pub const READONLY_PARTITION: &str = "readonly";

/// Logical partition scoped to the signed-in account.
pub const USER_PARTITION: &str = "user";

/// Sync service configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Application secret sent to the token exchange service.
    pub app_secret: String,
    /// Token exchange base URL.
    pub token_exchange_url: String,
    /// Logical partitions accepted by the CRUD surface.
    pub allowed_partitions: Vec<String>,
    /// Use the short retry interval table for pure connectivity failures.
    pub short_network_retries: bool,
    /// Connectivity state assumed until the host reports otherwise.
    pub initially_online: bool,
    /// Fixed document endpoint replacing the per-account host (tests).
    pub document_endpoint_override: Option<String>,
}

impl SyncConfig {
    /// Configuration with defaults for the given app secret.
    pub fn new(app_secret: impl Into<String>) -> Self {
        Self {
            app_secret: app_secret.into(),
            token_exchange_url: DEFAULT_API_URL.to_string(),
            allowed_partitions: vec![
                READONLY_PARTITION.to_string(),
                USER_PARTITION.to_string(),
            ],
            short_network_retries: false,
            initially_online: true,
            document_endpoint_override: None,
        }
    }

    /// Accept an additional logical partition.
    pub fn allow_partition(mut self, partition: impl Into<String>) -> Self {
        self.allowed_partitions.push(partition.into());
        self
    }
}

/// Mutable coordinator state behind one lock.
///
/// `outgoing` doubles as the in-flight set for outbox replays: a key present
/// with no handle yet still blocks duplicate replays of the same document.
struct CoordinatorState {
    account_id: Option<String>,
    outgoing: HashMap<String, Option<AbortHandle>>,
    listener: Option<Arc<dyn RemoteOperationListener>>,
}

/// Offline-first document sync service.
pub struct DataSyncCoordinator {
    app_secret: String,
    token_exchange_url: Mutex<String>,
    allowed_partitions: Vec<String>,
    transport: Arc<dyn HttpTransport>,
    client: DocumentServiceClient,
    token_manager: TokenManager,
    storage: LocalDocumentStorage,
    network: NetworkWatcher,
    /// Enabled flag as a watch channel so in-flight foreground calls can
    /// observe a disable and resolve as cancelled.
    enabled: watch::Sender<bool>,
    state: Mutex<CoordinatorState>,
}

impl DataSyncCoordinator {
    /// Create a coordinator with a retrying HTTP transport.
    pub fn new(config: SyncConfig, storage: LocalDocumentStorage) -> Result<Arc<Self>> {
        let inner: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::default_transport()?);
        let transport: Arc<dyn HttpTransport> =
            Arc::new(Retryer::new(inner, config.short_network_retries));
        Ok(Self::with_transport(config, storage, transport))
    }

    /// Create a coordinator over a caller-provided transport.
    pub fn with_transport(
        config: SyncConfig,
        storage: LocalDocumentStorage,
        transport: Arc<dyn HttpTransport>,
    ) -> Arc<Self> {
        let mut client = DocumentServiceClient::new(Arc::clone(&transport));
        if let Some(endpoint) = &config.document_endpoint_override {
            client = client.with_endpoint(endpoint.clone());
        }
        Arc::new(Self {
            app_secret: config.app_secret,
            token_exchange_url: Mutex::new(config.token_exchange_url),
            allowed_partitions: config.allowed_partitions,
            transport,
            client,
            token_manager: TokenManager::new(),
            storage,
            network: NetworkWatcher::new(config.initially_online),
            enabled: watch::channel(true).0,
            state: Mutex::new(CoordinatorState {
                account_id: None,
                outgoing: HashMap::new(),
                listener: None,
            }),
        })
    }

    /// Change the token exchange base URL.
    pub fn set_token_exchange_url(&self, url: impl Into<String>) {
        *self.token_exchange_url.lock().unwrap() = url.into();
    }

    /// Register (or with `None` unregister) the replay outcome listener.
    pub fn set_remote_operation_listener(&self, listener: Option<Arc<dyn RemoteOperationListener>>) {
        self.state.lock().unwrap().listener = listener;
    }

    /// Whether the sync service is enabled.
    pub fn is_enabled(&self) -> bool {
        *self.enabled.borrow()
    }

    /// Current connectivity state.
    pub fn is_online(&self) -> bool {
        self.network.is_online()
    }

    /// Subscribe to connectivity changes.
    pub fn subscribe_connectivity(&self) -> tokio::sync::watch::Receiver<bool> {
        self.network.subscribe()
    }

    /// Record a connectivity change reported by the host application.
    ///
    /// An offline-to-online transition drains the outbox before returning.
    pub async fn set_network_online(self: &Arc<Self>, online: bool) {
        let reconnected = self.network.set_online(online);
        if reconnected {
            tracing::info!("network restored, draining pending operations");
            self.process_pending_operations().await;
        }
    }

    /// Enable or disable the sync service.
    ///
    /// Disabling aborts every in-flight outbox replay; re-enabling drains the
    /// outbox when the device is online.
    pub async fn set_enabled(self: &Arc<Self>, enabled: bool) {
        let was_enabled = self.enabled.send_replace(enabled);
        if !enabled {
            let mut state = self.state.lock().unwrap();
            for (_, handle) in state.outgoing.drain() {
                if let Some(handle) = handle {
                    handle.abort();
                }
            }
        } else if !was_enabled && self.network.is_online() {
            self.process_pending_operations().await;
        }
    }

    /// React to a sign-in or sign-out.
    ///
    /// Sign-in creates the per-account table; sign-out drops every cached
    /// token and document.
    pub async fn on_user_changed(&self, account_id: Option<&str>) -> Result<()> {
        match account_id {
            Some(account_id) => {
                self.state.lock().unwrap().account_id = Some(account_id.to_string());
                self.storage
                    .create_table_if_not_exists(&user_table_name(account_id))
                    .await
                    .map_err(|e| DataError::LocalStorage(e.to_string()))
            }
            None => {
                self.state.lock().unwrap().account_id = None;
                self.token_manager.remove_all();
                self.storage
                    .reset_database()
                    .await
                    .map_err(|e| DataError::LocalStorage(e.to_string()))
            }
        }
    }

    /// Read a document, preferring the remote copy when online.
    ///
    /// A cached row carrying a pending operation is authoritative and is
    /// returned without a remote call even when online; a cache-only read
    /// option skips remote confirmation as well.
    pub async fn read<T: Serialize + DeserializeOwned>(
        &self,
        partition: &str,
        document_id: &str,
        read_options: &ReadOptions,
    ) -> DocumentWrapper<T> {
        self.cancellable(self.read_inner(partition, document_id, read_options))
            .await
            .unwrap_or_else(log_and_wrap)
    }

    async fn read_inner<T: Serialize + DeserializeOwned>(
        &self,
        partition: &str,
        document_id: &str,
        read_options: &ReadOptions,
    ) -> Result<DocumentWrapper<T>> {
        self.check_enabled()?;
        self.validate_partition(partition)?;

        let cached: DocumentWrapper<T> = match self.resolve_local(partition) {
            Ok((stored_partition, table)) => {
                self.storage
                    .read(&table, &stored_partition, document_id, read_options)
                    .await
            }
            Err(e) => DocumentWrapper::from_error(e),
        };
        if cached.pending_operation.is_some()
            || read_options.cache_only
            || !self.network.is_online()
        {
            return Ok(cached);
        }

        let token = self.resolve_token(partition).await?;
        let response = self
            .client
            .call_api(&token, Some(document_id), HttpMethod::Get, None, None)
            .await?;
        let remote: DocumentWrapper<T> = parse_document(&response.body);
        if !remote.has_failed() {
            self.storage
                .write_online(&table_for(&token.partition), &remote, &WriteOptions::default())
                .await;
        }
        Ok(remote)
    }

    /// Create a document.
    pub async fn create<T: Serialize + DeserializeOwned>(
        &self,
        partition: &str,
        document_id: &str,
        document: T,
        write_options: &WriteOptions,
    ) -> DocumentWrapper<T> {
        self.cancellable(self.create_or_replace(partition, document_id, document, write_options, false))
            .await
            .unwrap_or_else(log_and_wrap)
    }

    /// Replace a document, creating it when absent.
    pub async fn replace<T: Serialize + DeserializeOwned>(
        &self,
        partition: &str,
        document_id: &str,
        document: T,
        write_options: &WriteOptions,
    ) -> DocumentWrapper<T> {
        self.cancellable(self.create_or_replace(partition, document_id, document, write_options, true))
            .await
            .unwrap_or_else(log_and_wrap)
    }

    async fn create_or_replace<T: Serialize + DeserializeOwned>(
        &self,
        partition: &str,
        document_id: &str,
        document: T,
        write_options: &WriteOptions,
        upsert: bool,
    ) -> Result<DocumentWrapper<T>> {
        self.check_enabled()?;
        self.validate_partition(partition)?;

        if !self.network.is_online() {
            let (stored_partition, table) = self.resolve_local(partition)?;
            return Ok(self
                .storage
                .create_or_update_offline(
                    &table,
                    &stored_partition,
                    document_id,
                    document,
                    write_options,
                )
                .await);
        }

        let token = self.resolve_token(partition).await?;
        let Some(_claim) = self.try_claim_outgoing(&token.partition, document_id) else {
            tracing::debug!(
                partition,
                document_id,
                "remote sync in flight for this document, queueing the write locally"
            );
            let (stored_partition, table) = self.resolve_local(partition)?;
            return Ok(self
                .storage
                .create_or_update_offline(
                    &table,
                    &stored_partition,
                    document_id,
                    document,
                    write_options,
                )
                .await);
        };
        let wrapper = DocumentWrapper::new(document, token.partition.clone(), document_id);
        let body = wrapper.to_json()?;
        let extra_headers = upsert.then(upsert_header);
        let response = self
            .client
            .call_api(&token, None, HttpMethod::Post, Some(body), extra_headers)
            .await?;
        let confirmed: DocumentWrapper<T> = parse_document(&response.body);
        if !confirmed.has_failed() {
            self.storage
                .write_online(&table_for(&token.partition), &confirmed, write_options)
                .await;
        }
        Ok(confirmed)
    }

    /// Delete a document.
    ///
    /// Offline, a document the server has seen (it has an etag) becomes a
    /// tombstone to replay later; a document created offline and never synced
    /// is simply purged.
    pub async fn delete(&self, partition: &str, document_id: &str) -> DocumentWrapper<()> {
        self.cancellable(self.delete_inner(partition, document_id))
            .await
            .unwrap_or_else(log_and_wrap)
    }

    async fn delete_inner(&self, partition: &str, document_id: &str) -> Result<DocumentWrapper<()>> {
        self.check_enabled()?;
        self.validate_partition(partition)?;

        let (stored_partition, table) = self.resolve_local(partition)?;
        let cached: DocumentWrapper<serde_json::Value> = self
            .storage
            .read(&table, &stored_partition, document_id, &ReadOptions::default())
            .await;
        let needs_remote = !cached.etag.is_empty() || cached.has_failed();

        if needs_remote && self.network.is_online() {
            let token = self.resolve_token(partition).await?;
            if let Some(_claim) = self.try_claim_outgoing(&token.partition, document_id) {
                self.client
                    .call_api(&token, Some(document_id), HttpMethod::Delete, None, None)
                    .await?;
                self.storage
                    .delete_online(&table_for(&token.partition), &token.partition, document_id)
                    .await;
                return Ok(DocumentWrapper::empty());
            }
            tracing::debug!(
                partition,
                document_id,
                "remote sync in flight for this document, queueing the delete locally"
            );
        }

        if !cached.etag.is_empty() {
            if self
                .storage
                .delete_offline(&table, &stored_partition, document_id)
                .await
            {
                Ok(DocumentWrapper::empty().with_from_cache(true))
            } else {
                Err(DataError::LocalStorage(
                    "failed to queue the delete in the local cache".to_string(),
                ))
            }
        } else if self
            .storage
            .delete_online(&table, &stored_partition, document_id)
            .await
        {
            Ok(DocumentWrapper::empty())
        } else {
            Err(DataError::LocalStorage(
                "failed to remove the document from the local cache".to_string(),
            ))
        }
    }

    /// List the documents of a partition. Online only.
    pub async fn list<T: DeserializeOwned>(&self, partition: &str) -> Result<PaginatedDocuments<T>> {
        self.cancellable(self.list_inner(partition)).await
    }

    async fn list_inner<T: DeserializeOwned>(&self, partition: &str) -> Result<PaginatedDocuments<T>> {
        self.check_enabled()?;
        self.validate_partition(partition)?;
        if !self.network.is_online() {
            return Err(DataError::Offline(
                "the list operation is not supported offline".to_string(),
            ));
        }

        let token = self.resolve_token(partition).await?;
        let response = self.client.call_list_api(&token, None).await?;
        let page = parse_documents(&response.body)?;
        let continuation_token = response
            .header(CONTINUATION_TOKEN_HEADER)
            .map(str::to_string);
        Ok(PaginatedDocuments::new(
            self.client.clone(),
            token,
            page,
            continuation_token,
        ))
    }

    /// Replay every queued operation, each at most once.
    ///
    /// Operations already being replayed (their outgoing key is registered)
    /// are skipped. Returns once every replay started here has settled.
    pub async fn process_pending_operations(self: &Arc<Self>) {
        if !self.is_enabled() || !self.network.is_online() {
            return;
        }
        let mut tables = vec![APP_DOCUMENTS_TABLE.to_string()];
        if let Some(account_id) = self.state.lock().unwrap().account_id.clone() {
            tables.push(user_table_name(&account_id));
        }

        let mut handles = Vec::new();
        for table in tables {
            for operation in self.storage.pending_operations(&table).await {
                let key = outgoing_id(&operation.partition, &operation.document_id);
                {
                    let mut state = self.state.lock().unwrap();
                    if state.outgoing.contains_key(&key) {
                        tracing::debug!(key, "operation already in flight, skipping");
                        continue;
                    }
                    state.outgoing.insert(key.clone(), None);
                }
                let this = Arc::clone(self);
                let handle = tokio::spawn(async move { this.replay_operation(operation).await });
                let mut state = self.state.lock().unwrap();
                if let Some(slot) = state.outgoing.get_mut(&key) {
                    *slot = Some(handle.abort_handle());
                }
                handles.push(handle);
            }
        }
        for handle in handles {
            // Aborted replays (service disabled mid-drain) are fine to ignore.
            let _ = handle.await;
        }
    }

    async fn replay_operation(&self, operation: PendingOperation) {
        tracing::debug!(
            partition = %operation.partition,
            document_id = %operation.document_id,
            kind = %operation.kind,
            "replaying a pending operation"
        );
        // Racing the enabled flag covers a disable that lands before this
        // task's abort handle is registered in the outgoing map.
        match self.cancellable(self.call_remote_for(&operation)).await {
            Ok(payload) => self.confirm_replay(&operation, &payload).await,
            Err(DataError::Cancelled) => {
                tracing::debug!(
                    partition = %operation.partition,
                    document_id = %operation.document_id,
                    "sync disabled mid-replay, leaving the operation queued"
                );
            }
            Err(e) => self.fail_replay(&operation, &e).await,
        }
        self.state
            .lock()
            .unwrap()
            .outgoing
            .remove(&outgoing_id(&operation.partition, &operation.document_id));
    }

    async fn call_remote_for(&self, operation: &PendingOperation) -> Result<String> {
        let token = self
            .resolve_token(logical_partition_name(&operation.partition))
            .await?;
        let response = match operation.kind {
            PendingOperationKind::Create | PendingOperationKind::Replace => {
                let payload = operation.document.as_deref().ok_or_else(|| {
                    DataError::LocalStorage("queued write is missing its payload".to_string())
                })?;
                let body = serde_json::json!({
                    "id": operation.document_id,
                    "PartitionKey": operation.partition,
                    "document": serde_json::from_str::<serde_json::Value>(payload)?,
                })
                .to_string();
                // A replace replays as an upsert; a create must conflict if
                // the document appeared on the server in the meantime.
                let extra_headers =
                    matches!(operation.kind, PendingOperationKind::Replace).then(upsert_header);
                self.client
                    .call_api(&token, None, HttpMethod::Post, Some(body), extra_headers)
                    .await?
            }
            PendingOperationKind::Delete => {
                self.client
                    .call_api(
                        &token,
                        Some(&operation.document_id),
                        HttpMethod::Delete,
                        None,
                        None,
                    )
                    .await?
            }
        };
        Ok(response.body)
    }

    async fn confirm_replay(&self, operation: &PendingOperation, payload: &str) {
        let etag = document_client::etag_from_payload(payload);
        let timestamp = document_client::timestamp_from_payload(payload);
        self.notify_listener(
            operation.kind,
            Some(DocumentMetadata {
                partition: operation.partition.clone(),
                id: operation.document_id.clone(),
                etag: etag.clone(),
            }),
            None,
        );
        let now_ms = chrono::Utc::now().timestamp_millis();
        if operation.kind == PendingOperationKind::Delete || operation.is_expired(now_ms) {
            self.storage.purge_replayed(operation).await;
        } else {
            self.storage
                .update_pending_operation(operation, etag.as_deref(), timestamp)
                .await;
        }
    }

    async fn fail_replay(&self, operation: &PendingOperation, error: &DataError) {
        tracing::error!(
            partition = %operation.partition,
            document_id = %operation.document_id,
            kind = %operation.kind,
            %error,
            "replay of a pending operation failed"
        );
        // 404: the document is gone on the server. 409: the key already
        // exists there. Either way the queued state can never be applied.
        let unresolvable = matches!(error.http_status(), Some(404) | Some(409));
        self.notify_listener(operation.kind, None, Some(error));
        let now_ms = chrono::Utc::now().timestamp_millis();
        if unresolvable || operation.is_expired(now_ms) {
            self.storage.purge_replayed(operation).await;
        }
    }

    fn notify_listener(
        &self,
        kind: PendingOperationKind,
        metadata: Option<DocumentMetadata>,
        error: Option<&DataError>,
    ) {
        let listener = self.state.lock().unwrap().listener.clone();
        if let Some(listener) = listener {
            listener.on_remote_operation_completed(kind, metadata, error);
        }
    }

    async fn resolve_token(&self, partition: &str) -> Result<TokenResult> {
        if let Some(token) = self.token_manager.cached_token(partition, false) {
            return Ok(token);
        }
        let url = self.token_exchange_url.lock().unwrap().clone();
        get_db_token(
            partition,
            self.transport.as_ref(),
            &url,
            &self.app_secret,
            &self.token_manager,
        )
        .await
    }

    /// Race an operation against the service being disabled.
    ///
    /// Disabling resolves the call as cancelled; dropping the future also
    /// drops any pending retry timer and in-flight request with it.
    async fn cancellable<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        let mut enabled = self.enabled.subscribe();
        tokio::select! {
            result = operation => result,
            _ = enabled.wait_for(|enabled| !*enabled) => Err(DataError::Cancelled),
        }
    }

    /// Claim the per-key in-flight slot for a foreground remote call.
    ///
    /// At most one remote sync attempt runs per (partition, document id) key,
    /// counting outbox replays and foreground calls alike. Returns `None`
    /// when the key is already owned; the claim releases on drop.
    fn try_claim_outgoing(&self, partition: &str, document_id: &str) -> Option<OutgoingClaim<'_>> {
        let key = outgoing_id(partition, document_id);
        let mut state = self.state.lock().unwrap();
        if state.outgoing.contains_key(&key) {
            return None;
        }
        state.outgoing.insert(key.clone(), None);
        Some(OutgoingClaim { coordinator: self, key })
    }

    fn check_enabled(&self) -> Result<()> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(DataError::Cancelled)
        }
    }

    fn validate_partition(&self, partition: &str) -> Result<()> {
        if self.allowed_partitions.iter().any(|p| p == partition) {
            Ok(())
        } else {
            Err(DataError::InvalidPartition(partition.to_string()))
        }
    }

    /// Resolve the stored partition name and physical table for local
    /// operations. The user partition needs a signed-in account; every other
    /// partition maps to the shared app table.
    fn resolve_local(&self, partition: &str) -> Result<(String, String)> {
        if partition == USER_PARTITION {
            match self.state.lock().unwrap().account_id.clone() {
                Some(account_id) => Ok((
                    format!("{USER_PARTITION}-{account_id}"),
                    user_table_name(&account_id),
                )),
                None => Err(DataError::Offline(
                    "the user partition requires a signed-in account".to_string(),
                )),
            }
        } else {
            Ok((partition.to_string(), APP_DOCUMENTS_TABLE.to_string()))
        }
    }
}

/// A foreground call's hold on the outgoing registry, released on drop (the
/// drop also runs when the call is cancelled mid-flight).
struct OutgoingClaim<'a> {
    coordinator: &'a DataSyncCoordinator,
    key: String,
}

impl Drop for OutgoingClaim<'_> {
    fn drop(&mut self) {
        self.coordinator
            .state
            .lock()
            .unwrap()
            .outgoing
            .remove(&self.key);
    }
}

/// Outgoing key preventing duplicate remote calls for the same document.
fn outgoing_id(partition: &str, document_id: &str) -> String {
    format!("{partition}_{document_id}")
}

/// Physical table for a stored partition name.
fn table_for(partition: &str) -> String {
    match partition.strip_prefix("user-") {
        Some(account_id) => user_table_name(account_id),
        None => APP_DOCUMENTS_TABLE.to_string(),
    }
}

fn log_and_wrap<T>(error: DataError) -> DocumentWrapper<T> {
    tracing::error!(%error, "document operation failed");
    DocumentWrapper::from_error(error)
}
