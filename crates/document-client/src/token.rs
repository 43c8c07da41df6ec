//! Partition token exchange and token cache
//!
//! `TokenManager` owns a short-lived in-memory cache of partition tokens.
//! `get_db_token` performs the network round trip against the token exchange
//! endpoint. Calls at this layer are not deduplicated; the sync coordinator
//! is responsible for not issuing redundant fetches for the same in-flight
//! key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

use networking::{HttpMethod, HttpRequest, HttpTransport};

use crate::error::{DataError, Result};

/// Token exchange endpoint path, relative to the API base URL.
pub const TOKEN_EXCHANGE_PATH: &str = "/data/tokens";

/// Token status sentinel accepted as success.
pub const TOKEN_RESULT_SUCCEED: &str = "Succeed";

const APP_SECRET_HEADER: &str = "App-Secret";

/// A scoped credential for one partition of the remote document store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResult {
    /// Partition this token is scoped to (stored form; user partitions carry
    /// the account id suffix).
    pub partition: String,

    /// Physical database account.
    pub db_account: String,

    /// Database name.
    pub db_name: String,

    /// Collection name.
    pub db_collection_name: String,

    /// Opaque bearer credential.
    pub token: String,

    /// Exchange status; only `"Succeed"` is usable.
    pub status: String,

    /// Expiry; a token past this instant is never used for remote calls.
    #[serde(default)]
    pub expires_on: Option<DateTime<Utc>>,
}

impl TokenResult {
    /// Whether the token is past its expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_on.is_some_and(|t| t <= now)
    }
}

/// Wire shape of the token exchange response.
#[derive(Debug, Deserialize)]
struct TokensResponse {
    #[serde(default)]
    tokens: Vec<TokenResult>,
}

/// In-memory, last-write-wins cache of partition tokens.
///
/// Concurrent refreshes for the same partition are tolerated; the rare
/// duplicate network fetch is accepted instead of a cross-task lock.
#[derive(Debug, Default)]
pub struct TokenManager {
    cache: Mutex<HashMap<String, TokenResult>>,
}

impl TokenManager {
    /// Create an empty token cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cached token by logical partition name.
    ///
    /// Expired entries are evicted and `None` is returned unless
    /// `include_expired` is set; an expired-but-present token is still useful
    /// offline to identify the physical table.
    pub fn cached_token(&self, partition: &str, include_expired: bool) -> Option<TokenResult> {
        let mut cache = self.cache.lock().unwrap();
        let token = cache.get(partition)?;
        if token.is_expired(Utc::now()) && !include_expired {
            tracing::debug!(partition, "cached token expired, evicting");
            cache.remove(partition);
            return None;
        }
        Some(token.clone())
    }

    /// Cache a token under its logical partition name.
    ///
    /// The stored partition may carry an account id suffix
    /// (`user-<account>`); the cache key is the logical prefix so lookups by
    /// logical name succeed.
    pub fn set_cached_token(&self, token: TokenResult) {
        let key = logical_partition_name(&token.partition).to_string();
        self.cache.lock().unwrap().insert(key, token);
    }

    /// Drop every cached token (user sign-out).
    pub fn remove_all(&self) {
        self.cache.lock().unwrap().clear();
    }
}

/// Strip the account id suffix from a stored user partition name.
///
/// `user-1234-5678` becomes `user`; every other partition passes through
/// unchanged.
pub fn logical_partition_name(partition: &str) -> &str {
    if partition.starts_with("user-") {
        "user"
    } else {
        partition
    }
}

/// Resolve a token for `partition` via the exchange endpoint.
///
/// Issues `POST {api_url}/data/tokens` with the app secret header and a body
/// naming the requested partition. Only a response containing exactly one
/// token whose status equals the success sentinel is accepted; any other
/// shape is a terminal `TokenExchange` error. The accepted token is cached
/// in `token_manager` before being returned.
pub async fn get_db_token(
    partition: &str,
    transport: &dyn HttpTransport,
    api_url: &str,
    app_secret: &str,
    token_manager: &TokenManager,
) -> Result<TokenResult> {
    tracing::debug!(partition, "requesting a resource token");
    let body = serde_json::json!({ "partitions": [partition] }).to_string();
    let request = HttpRequest::new(HttpMethod::Post, format!("{api_url}{TOKEN_EXCHANGE_PATH}"))
        .header(APP_SECRET_HEADER, app_secret)
        .header("Content-Type", "application/json")
        .body(body);

    let response = transport.send(&request).await?;
    let parsed: TokensResponse = serde_json::from_str(&response.body).map_err(|e| {
        DataError::TokenExchange(format!("malformed token exchange response: {e}"))
    })?;

    let count = parsed.tokens.len();
    let Some(token) = parsed.tokens.into_iter().next().filter(|_| count == 1) else {
        return Err(DataError::TokenExchange(format!(
            "expected exactly one token in the exchange response, got {count}"
        )));
    };
    if !token.status.eq_ignore_ascii_case(TOKEN_RESULT_SUCCEED) {
        return Err(DataError::TokenExchange(format!(
            "token exchange succeeded but the payload indicates a failed state: {}",
            token.status
        )));
    }
    token_manager.set_cached_token(token.clone());
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn token(partition: &str, expires_on: Option<DateTime<Utc>>) -> TokenResult {
        TokenResult {
            partition: partition.to_string(),
            db_account: "account".to_string(),
            db_name: "db".to_string(),
            db_collection_name: "coll".to_string(),
            token: "tok".to_string(),
            status: TOKEN_RESULT_SUCCEED.to_string(),
            expires_on,
        }
    }

    fn token_json(partition: &str, status: &str) -> serde_json::Value {
        serde_json::json!({
            "partition": partition,
            "dbAccount": "account",
            "dbName": "db",
            "dbCollectionName": "coll",
            "token": "tok",
            "status": status
        })
    }

    #[test]
    fn test_cache_hit_and_removal() {
        let manager = TokenManager::new();
        manager.set_cached_token(token("readonly", None));

        assert!(manager.cached_token("readonly", false).is_some());
        manager.remove_all();
        assert!(manager.cached_token("readonly", false).is_none());
    }

    #[test]
    fn test_expired_token_evicted_unless_included() {
        let manager = TokenManager::new();
        let past = Utc::now() - Duration::hours(1);
        manager.set_cached_token(token("readonly", Some(past)));

        // include_expired keeps the entry usable for offline table lookup.
        assert!(manager.cached_token("readonly", true).is_some());
        // A strict lookup evicts it.
        assert!(manager.cached_token("readonly", false).is_none());
        assert!(manager.cached_token("readonly", true).is_none());
    }

    #[test]
    fn test_user_partition_cached_under_logical_name() {
        let manager = TokenManager::new();
        manager.set_cached_token(token("user-abc123", None));

        let cached = manager.cached_token("user", false).unwrap();
        assert_eq!(cached.partition, "user-abc123");
    }

    #[test]
    fn test_logical_partition_name() {
        assert_eq!(logical_partition_name("user-abc-def"), "user");
        assert_eq!(logical_partition_name("readonly"), "readonly");
        assert_eq!(logical_partition_name("custom-partition"), "custom-partition");
    }

    #[tokio::test]
    async fn test_get_db_token_success_caches() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/data/tokens"))
            .and(header("App-Secret", "secret"))
            .and(body_json(serde_json::json!({ "partitions": ["readonly"] })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tokens": [token_json("readonly", "Succeed")]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let transport = networking::ReqwestTransport::default_transport().unwrap();
        let manager = TokenManager::new();
        let result = get_db_token("readonly", &transport, &server.uri(), "secret", &manager)
            .await
            .unwrap();

        assert_eq!(result.db_account, "account");
        assert!(manager.cached_token("readonly", false).is_some());
    }

    #[tokio::test]
    async fn test_get_db_token_failed_status_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/data/tokens"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tokens": [token_json("readonly", "Failed")]
            })))
            .mount(&server)
            .await;

        let transport = networking::ReqwestTransport::default_transport().unwrap();
        let manager = TokenManager::new();
        let err = get_db_token("readonly", &transport, &server.uri(), "secret", &manager)
            .await
            .unwrap_err();

        assert!(matches!(err, DataError::TokenExchange(_)));
        assert!(manager.cached_token("readonly", true).is_none());
    }

    #[tokio::test]
    async fn test_get_db_token_zero_or_multiple_tokens_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/data/tokens"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "tokens": [token_json("readonly", "Succeed"), token_json("user", "Succeed")]
            })))
            .mount(&server)
            .await;

        let transport = networking::ReqwestTransport::default_transport().unwrap();
        let manager = TokenManager::new();
        let err = get_db_token("readonly", &transport, &server.uri(), "secret", &manager)
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::TokenExchange(_)));
    }

    #[tokio::test]
    async fn test_get_db_token_malformed_body_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/data/tokens"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let transport = networking::ReqwestTransport::default_transport().unwrap();
        let manager = TokenManager::new();
        let err = get_db_token("readonly", &transport, &server.uri(), "secret", &manager)
            .await
            .unwrap_err();
        assert!(matches!(err, DataError::TokenExchange(_)));
    }
}
