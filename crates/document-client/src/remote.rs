//! Cosmos-style remote document client
//!
//! Builds and issues document CRUD requests against the remote store using a
//! resolved partition token. Every request carries the partition key header,
//! API version, RFC 1123 request timestamp, and a URL-encoded authorization
//! header built from the token.

use chrono::Utc;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;

use networking::{HttpMethod, HttpRequest, HttpResponse, HttpTransport};

use crate::error::{DataError, Result};
use crate::models::{parse_documents, Page};
use crate::token::TokenResult;

/// Partition key request header.
pub const PARTITION_KEY_HEADER: &str = "x-ms-documentdb-partitionkey";

/// API version request header value.
pub const API_VERSION: &str = "2018-06-18";

/// Continuation token header, shared by list requests and responses.
pub const CONTINUATION_TOKEN_HEADER: &str = "x-ms-continuation";

/// Upsert header enabling replace-as-create semantics on POST.
pub const UPSERT_HEADER: &str = "x-ms-documentdb-is-upsert";

/// Physical host suffix of the remote document store.
const DOCUMENT_DB_HOST: &str = "documents.azure.com";

/// Additional header map enabling upsert semantics.
pub fn upsert_header() -> HashMap<String, String> {
    let mut headers = HashMap::new();
    headers.insert(UPSERT_HEADER.to_string(), "true".to_string());
    headers
}

/// Current time in the lowercased RFC 1123 form the document store signs.
fn now_as_rfc1123() -> String {
    Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
        .to_lowercase()
}

/// Client for the remote document API.
#[derive(Clone)]
pub struct DocumentServiceClient {
    transport: Arc<dyn HttpTransport>,
    /// Test hook replacing `https://{account}.documents.azure.com`.
    endpoint_override: Option<String>,
}

impl DocumentServiceClient {
    /// Create a client over the given (typically retry-wrapped) transport.
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport, endpoint_override: None }
    }

    /// Replace the account endpoint with a fixed base URL (tests).
    pub fn with_endpoint(mut self, base_url: impl Into<String>) -> Self {
        self.endpoint_override = Some(base_url.into());
        self
    }

    fn document_url(&self, token: &TokenResult, document_id: Option<&str>) -> String {
        let base = match &self.endpoint_override {
            Some(base) => base.clone(),
            None => format!("https://{}.{}", token.db_account, DOCUMENT_DB_HOST),
        };
        let mut url = format!(
            "{}/dbs/{}/colls/{}/docs",
            base, token.db_name, token.db_collection_name
        );
        if let Some(id) = document_id {
            url.push('/');
            url.push_str(id);
        }
        url
    }

    fn required_headers(token: &TokenResult) -> HashMap<String, String> {
        let mut headers = HashMap::new();
        headers.insert(
            PARTITION_KEY_HEADER.to_string(),
            format!("[\"{}\"]", token.partition),
        );
        headers.insert("x-ms-version".to_string(), API_VERSION.to_string());
        headers.insert("x-ms-date".to_string(), now_as_rfc1123());
        headers.insert("Content-Type".to_string(), "application/json".to_string());
        headers.insert(
            "Authorization".to_string(),
            urlencoding::encode(&token.token).into_owned(),
        );
        headers
    }

    /// Issue a single-document request (GET/POST/DELETE).
    ///
    /// `document_id` is appended to the URL only for single-document
    /// operations; creates post to the collection itself.
    pub async fn call_api(
        &self,
        token: &TokenResult,
        document_id: Option<&str>,
        method: HttpMethod,
        body: Option<String>,
        extra_headers: Option<HashMap<String, String>>,
    ) -> Result<HttpResponse> {
        let mut request = HttpRequest::new(method, self.document_url(token, document_id))
            .headers(Self::required_headers(token));
        if let Some(extra) = extra_headers {
            request = request.headers(extra);
        }
        if let Some(body) = body {
            request = request.body(body);
        }
        self.transport.send(&request).await.map_err(DataError::from)
    }

    /// Issue a paged list request, optionally continuing from a previous
    /// page's continuation token.
    pub async fn call_list_api(
        &self,
        token: &TokenResult,
        continuation_token: Option<&str>,
    ) -> Result<HttpResponse> {
        let mut request = HttpRequest::new(HttpMethod::Get, self.document_url(token, None))
            .headers(Self::required_headers(token));
        if let Some(continuation) = continuation_token {
            request = request.header(CONTINUATION_TOKEN_HEADER, continuation);
        }
        self.transport.send(&request).await.map_err(DataError::from)
    }
}

/// A paged list result that can fetch subsequent pages on demand.
pub struct PaginatedDocuments<T> {
    client: DocumentServiceClient,
    token: TokenResult,
    current_page: Page<T>,
    continuation_token: Option<String>,
}

impl<T: DeserializeOwned> PaginatedDocuments<T> {
    /// Wrap the first page of a list response.
    pub fn new(
        client: DocumentServiceClient,
        token: TokenResult,
        current_page: Page<T>,
        continuation_token: Option<String>,
    ) -> Self {
        Self { client, token, current_page, continuation_token }
    }

    /// Documents on the current page.
    pub fn current_page(&self) -> &Page<T> {
        &self.current_page
    }

    /// Whether the server reported more pages.
    pub fn has_next_page(&self) -> bool {
        self.continuation_token.is_some()
    }

    /// Fetch the next page, replacing the current one.
    pub async fn next_page(&mut self) -> Result<&Page<T>> {
        let continuation = self.continuation_token.clone().ok_or_else(|| {
            DataError::NotFound("no more pages in the list result".to_string())
        })?;
        let response = self
            .client
            .call_list_api(&self.token, Some(&continuation))
            .await?;
        self.continuation_token = response
            .header(CONTINUATION_TOKEN_HEADER)
            .map(str::to_string);
        self.current_page = parse_documents(&response.body)?;
        Ok(&self.current_page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TOKEN_RESULT_SUCCEED;
    use networking::ReqwestTransport;
    use serde::Deserialize;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Debug, Deserialize)]
    struct TestDoc {
        #[allow(dead_code)]
        test: String,
    }

    fn token() -> TokenResult {
        TokenResult {
            partition: "readonly".to_string(),
            db_account: "account".to_string(),
            db_name: "db".to_string(),
            db_collection_name: "coll".to_string(),
            token: "type=resource&sig=abc/def+g".to_string(),
            status: TOKEN_RESULT_SUCCEED.to_string(),
            expires_on: None,
        }
    }

    fn client(server: &MockServer) -> DocumentServiceClient {
        let transport = Arc::new(ReqwestTransport::default_transport().unwrap());
        DocumentServiceClient::new(transport).with_endpoint(server.uri())
    }

    #[test]
    fn test_document_url_construction() {
        let transport = Arc::new(ReqwestTransport::default_transport().unwrap());
        let client = DocumentServiceClient::new(transport);

        assert_eq!(
            client.document_url(&token(), Some("document-id")),
            "https://account.documents.azure.com/dbs/db/colls/coll/docs/document-id"
        );
        assert_eq!(
            client.document_url(&token(), None),
            "https://account.documents.azure.com/dbs/db/colls/coll/docs"
        );
    }

    #[test]
    fn test_required_headers() {
        let headers = DocumentServiceClient::required_headers(&token());

        assert_eq!(headers.get(PARTITION_KEY_HEADER).unwrap(), "[\"readonly\"]");
        assert_eq!(headers.get("x-ms-version").unwrap(), API_VERSION);
        assert_eq!(headers.get("Content-Type").unwrap(), "application/json");
        // Token is URL-encoded into the authorization header.
        assert_eq!(
            headers.get("Authorization").unwrap(),
            "type%3Dresource%26sig%3Dabc%2Fdef%2Bg"
        );
        // Lowercased RFC 1123, e.g. "fri, 01 dec 2017 19:22:30 gmt".
        let date = headers.get("x-ms-date").unwrap();
        assert!(date.ends_with(" gmt"));
        assert_eq!(date, &date.to_lowercase());
    }

    #[tokio::test]
    async fn test_call_api_get_document() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dbs/db/colls/coll/docs/document-id"))
            .and(header(PARTITION_KEY_HEADER, "[\"readonly\"]"))
            .and(header("x-ms-version", API_VERSION))
            .and(header_exists("x-ms-date"))
            .and(header_exists("Authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"document": {"test": "v"}, "id": "document-id", "PartitionKey": "readonly", "_ts": 1}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let response = client(&server)
            .call_api(&token(), Some("document-id"), HttpMethod::Get, None, None)
            .await
            .unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_call_api_upsert_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/dbs/db/colls/coll/docs"))
            .and(header(UPSERT_HEADER, "true"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .call_api(
                &token(),
                None,
                HttpMethod::Post,
                Some("{}".to_string()),
                Some(upsert_header()),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_pagination_with_continuation() {
        let server = MockServer::start().await;
        let page = |name: &str| {
            format!(
                r#"{{"Documents": [{{"document": {{"test": "{name}"}}, "id": "{name}", "PartitionKey": "readonly", "_ts": 1}}]}}"#
            )
        };
        // First page: no continuation request header, responds with one.
        Mock::given(method("GET"))
            .and(path("/dbs/db/colls/coll/docs"))
            .and(header(CONTINUATION_TOKEN_HEADER, "page-2"))
            .respond_with(ResponseTemplate::new(200).set_body_string(page("second")))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/dbs/db/colls/coll/docs"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(page("first"))
                    .insert_header(CONTINUATION_TOKEN_HEADER, "page-2"),
            )
            .mount(&server)
            .await;

        let client = client(&server);
        let response = client.call_list_api(&token(), None).await.unwrap();
        let first: Page<TestDoc> = parse_documents(&response.body).unwrap();
        let continuation = response
            .header(CONTINUATION_TOKEN_HEADER)
            .map(str::to_string);

        let mut paginated =
            PaginatedDocuments::new(client, token(), first, continuation);
        assert!(paginated.has_next_page());
        assert_eq!(paginated.current_page().items[0].id, "first");

        paginated.next_page().await.unwrap();
        assert!(!paginated.has_next_page());
        assert_eq!(paginated.current_page().items[0].id, "second");
    }
}
