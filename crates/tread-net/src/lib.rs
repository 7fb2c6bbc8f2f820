//! # Tread Net
//!
//! Request/response model and network access for the TreadCache worker.
//!
//! ## Design Goals
//!
//! 1. **Owned snapshots**: responses carry their full body as [`Bytes`], so
//!    cloning a response for the cache is cheap
//! 2. **One seam**: every network call goes through the [`Fetcher`] trait
//! 3. **Offline first-class**: an unreachable network is its own error kind

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::Serialize;
use thiserror::Error;
use url::Url;

pub mod loader;
pub mod memory;

pub use loader::{HttpFetcher, LoaderConfig};
pub use memory::MemoryNetwork;

/// Header set on responses the worker synthesizes while offline.
pub const OFFLINE_HEADER: &str = "x-tread-offline";

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Network unavailable: {0}")]
    Offline(String),

    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// How the page issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document navigation.
    Navigate,
    /// Same-origin subresource or API call.
    #[default]
    SameOrigin,
    /// Cross-origin with CORS.
    Cors,
    /// Cross-origin without CORS.
    NoCors,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub mode: RequestMode,
}

impl Request {
    /// Create a GET request.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            mode: RequestMode::SameOrigin,
        }
    }

    /// Create a top-level navigation request.
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// Create a request with an arbitrary method and optional body.
    pub fn with_method(method: Method, url: Url, body: Option<Bytes>) -> Self {
        Self {
            method,
            body,
            ..Self::get(url)
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Whether this is a top-level navigation.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Whether the URL scheme is http or https.
    pub fn is_http(&self) -> bool {
        matches!(self.url.scheme(), "http" | "https")
    }

    /// Fingerprint used as cache key: method plus absolute URL.
    pub fn cache_key(&self) -> String {
        cache_key(&self.method, &self.url)
    }
}

/// Cache key for a method and URL.
pub fn cache_key(method: &Method, url: &Url) -> String {
    format!("{} {}", method, url)
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseType {
    /// Same-origin network response.
    #[default]
    Basic,
    /// Cross-origin network response.
    Cors,
    /// Built by the worker, never touched the network.
    Synthetic,
}

/// HTTP response with a fully buffered body.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Option<Url>,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub response_type: ResponseType,
}

impl Response {
    /// Create a network-shaped response.
    pub fn new(url: Url, status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            url: Some(url),
            status,
            headers,
            body,
            response_type: ResponseType::Basic,
        }
    }

    /// Synthesize a JSON response.
    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Self {
        let body = serde_json::to_vec(value).unwrap_or_default();
        Self::synthetic(status, "application/json", Bytes::from(body))
    }

    /// Synthesize an HTML response.
    pub fn html(status: StatusCode, html: impl Into<String>) -> Self {
        Self::synthetic(status, "text/html; charset=utf-8", Bytes::from(html.into()))
    }

    /// Synthesize a plain-text response.
    pub fn text(status: StatusCode, text: impl Into<String>) -> Self {
        Self::synthetic(status, "text/plain; charset=utf-8", Bytes::from(text.into()))
    }

    fn synthetic(status: StatusCode, content_type: &'static str, body: Bytes) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        Self {
            url: None,
            status,
            headers,
            body,
            response_type: ResponseType::Synthetic,
        }
    }

    /// Mark the response as produced while offline.
    pub fn mark_offline(mut self) -> Self {
        self.headers
            .insert(OFFLINE_HEADER, HeaderValue::from_static("1"));
        self
    }

    /// Whether the response carries the offline marker header.
    pub fn is_offline(&self) -> bool {
        self.headers.contains_key(OFFLINE_HEADER)
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Get a header value as a string.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Get the body as text.
    pub fn text_body(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Get the body as JSON.
    pub fn json_body<T: serde::de::DeserializeOwned>(&self) -> Result<T, NetError> {
        serde_json::from_slice(&self.body).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Whether the response came from the given origin.
    pub fn is_same_origin(&self, origin: &Url) -> bool {
        self.response_type == ResponseType::Basic
            && self
                .url
                .as_ref()
                .is_some_and(|u| u.origin() == origin.origin())
    }
}

/// Network access used by the worker and the host.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform the request against the network.
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_builder() {
        let url = Url::parse("https://shop.example/api/products").unwrap();
        let request = Request::get(url.clone()).header(
            HeaderName::from_static("accept"),
            HeaderValue::from_static("application/json"),
        );

        assert_eq!(request.url, url);
        assert_eq!(request.method, Method::GET);
        assert!(request.headers.contains_key("accept"));
        assert!(!request.is_navigation());
        assert!(request.is_http());
    }

    #[test]
    fn test_request_id_uniqueness() {
        let id1 = RequestId::new();
        let id2 = RequestId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_cache_key_includes_method() {
        let url = Url::parse("https://shop.example/cart").unwrap();
        let get = Request::get(url.clone());
        let post = Request::with_method(Method::POST, url, None);
        assert_eq!(get.cache_key(), "GET https://shop.example/cart");
        assert_ne!(get.cache_key(), post.cache_key());
    }

    #[test]
    fn test_non_http_scheme() {
        let request = Request::get(Url::parse("chrome-extension://abc/script.js").unwrap());
        assert!(!request.is_http());
    }

    #[test]
    fn test_synthetic_json_response() {
        let response = Response::json(StatusCode::SERVICE_UNAVAILABLE, &json!({"offline": true}));
        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert_eq!(response.response_type, ResponseType::Synthetic);
        let body: serde_json::Value = response.json_body().unwrap();
        assert_eq!(body["offline"], true);
    }

    #[test]
    fn test_offline_marker() {
        let response = Response::html(StatusCode::SERVICE_UNAVAILABLE, "<h1>Offline</h1>");
        assert!(!response.is_offline());
        assert!(response.mark_offline().is_offline());
    }

    #[test]
    fn test_same_origin() {
        let origin = Url::parse("https://shop.example/").unwrap();
        let local = Response::new(
            Url::parse("https://shop.example/app.js").unwrap(),
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::new(),
        );
        let cdn = Response::new(
            Url::parse("https://cdn.example/app.js").unwrap(),
            StatusCode::OK,
            HeaderMap::new(),
            Bytes::new(),
        );
        assert!(local.is_same_origin(&origin));
        assert!(!cdn.is_same_origin(&origin));
        assert!(!Response::text(StatusCode::OK, "x").is_same_origin(&origin));
    }
}
