//! Pluggable HTTP transport
//!
//! The sync service never talks to `reqwest` directly; it goes through the
//! `HttpTransport` trait so tests can substitute a scripted transport and the
//! `Retryer` can decorate any implementation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{HttpError, NetworkErrorKind};

/// HTTP method for transport requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    /// GET request.
    Get,
    /// POST request.
    Post,
    /// PUT request.
    Put,
    /// DELETE request.
    Delete,
}

impl HttpMethod {
    /// Method name as used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// A single HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: HttpMethod,
    /// Absolute request URL.
    pub url: String,
    /// Request headers.
    pub headers: HashMap<String, String>,
    /// Optional request body (always JSON text in this SDK).
    pub body: Option<String>,
}

impl HttpRequest {
    /// Create a request with no headers or body.
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    /// Add a header.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Add a full header map.
    pub fn headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// A successful HTTP response (2xx).
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, keys lowercased.
    pub headers: HashMap<String, String>,
    /// Response body.
    pub body: String,
}

impl HttpResponse {
    /// Look up a response header by its lowercased name.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// Asynchronous request/response transport.
///
/// Implementations must map non-2xx responses to `HttpError::Status` so that
/// retry classification sees every failure in one shape.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Perform a single request and await the response.
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError>;
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Create a transport with the given request timeout.
    pub fn new(timeout: Duration) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HttpError::InvalidRequest(e.to_string()))?;
        Ok(Self { client })
    }

    /// Create a transport with the default 60 second timeout.
    pub fn default_transport() -> Result<Self, HttpError> {
        Self::new(Duration::from_secs(60))
    }

    fn classify(error: reqwest::Error) -> HttpError {
        let kind = if error.is_timeout() {
            NetworkErrorKind::ConnectTimeout
        } else if error.is_connect() {
            // DNS failures surface as connect errors; the hyper message is
            // the only discriminator available.
            if error.to_string().contains("dns") {
                NetworkErrorKind::UnresolvedHost
            } else {
                NetworkErrorKind::ConnectTimeout
            }
        } else {
            NetworkErrorKind::Io
        };
        HttpError::Network { kind, message: error.to_string() }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, HttpError> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
            HttpMethod::Put => self.client.put(&request.url),
            HttpMethod::Delete => self.client.delete(&request.url),
        };
        for (key, value) in &request.headers {
            builder = builder.header(key, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(Self::classify)?;
        let status = response.status().as_u16();

        let mut headers = HashMap::new();
        for (key, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(key.as_str().to_lowercase(), value.to_string());
            }
        }

        let body = response
            .text()
            .await
            .map_err(|e| HttpError::Network { kind: NetworkErrorKind::Io, message: e.to_string() })?;

        if (200..300).contains(&status) {
            Ok(HttpResponse { status, headers, body })
        } else {
            tracing::debug!(status, "request failed with HTTP status");
            Err(HttpError::Status { status, headers, body })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_method_as_str() {
        assert_eq!(HttpMethod::Get.as_str(), "GET");
        assert_eq!(HttpMethod::Post.as_str(), "POST");
        assert_eq!(HttpMethod::Put.as_str(), "PUT");
        assert_eq!(HttpMethod::Delete.as_str(), "DELETE");
    }

    #[test]
    fn test_request_builder() {
        let req = HttpRequest::new(HttpMethod::Post, "https://example.com/docs")
            .header("Content-Type", "application/json")
            .body("{}");
        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.headers.get("Content-Type").unwrap(), "application/json");
        assert_eq!(req.body.as_deref(), Some("{}"));
    }

    #[tokio::test]
    async fn test_success_response_with_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("hello")
                    .insert_header("x-ms-continuation", "next-page"),
            )
            .mount(&server)
            .await;

        let transport = ReqwestTransport::default_transport().unwrap();
        let request = HttpRequest::new(HttpMethod::Get, format!("{}/ok", server.uri()));
        let response = transport.send(&request).await.unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.body, "hello");
        assert_eq!(response.header("x-ms-continuation"), Some("next-page"));
    }

    #[tokio::test]
    async fn test_status_error_carries_headers_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/throttle"))
            .respond_with(
                ResponseTemplate::new(429)
                    .set_body_string("slow down")
                    .insert_header("x-ms-retry-after-ms", "2500"),
            )
            .mount(&server)
            .await;

        let transport = ReqwestTransport::default_transport().unwrap();
        let request = HttpRequest::new(HttpMethod::Post, format!("{}/throttle", server.uri()));
        let err = transport.send(&request).await.unwrap_err();

        assert_eq!(err.status(), Some(429));
        assert!(err.is_recoverable());
        assert_eq!(err.retry_after_ms(), Some(2500));
        match err {
            HttpError::Status { body, .. } => assert_eq!(body, "slow down"),
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_request_headers_forwarded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tokens"))
            .and(header("App-Secret", "secret-value"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = ReqwestTransport::default_transport().unwrap();
        let request = HttpRequest::new(HttpMethod::Post, format!("{}/tokens", server.uri()))
            .header("App-Secret", "secret-value");
        transport.send(&request).await.unwrap();
    }
}
