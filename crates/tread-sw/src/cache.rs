//! Cache Storage: named partitions of request → response snapshots.

use std::sync::Arc;

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::trace;
use tread_net::{cache_key, Request, Response, ResponseType};
use url::Url;

use crate::ServiceWorkerError;

/// Cache Storage shared by the worker and every page of the origin.
pub type SharedCacheStorage = Arc<RwLock<CacheStorage>>;

// ==================== Cache Entry ====================

/// A cached request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: i64,
}

impl CacheEntry {
    /// Snapshot a response for a request.
    pub fn from_response(request: &Request, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: request.url.to_string(),
            method: request.method.to_string(),
            status: response.status.as_u16(),
            headers,
            body: response.body.to_vec(),
            cached_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Rebuild a response from the snapshot.
    pub fn to_response(&self) -> Response {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(n), Ok(v)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.insert(n, v);
            }
        }

        Response {
            url: Url::parse(&self.url).ok(),
            status: StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK),
            headers,
            body: Bytes::from(self.body.clone()),
            response_type: ResponseType::Basic,
        }
    }

    /// Approximate storage footprint.
    pub fn size(&self) -> usize {
        self.url.len()
            + self.body.len()
            + self
                .headers
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

// ==================== Cache ====================

/// A cache partition.
#[derive(Debug, Default)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    /// Cached entries by request fingerprint.
    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create a new cache.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request. Only GET requests are ever stored.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        if request.method != Method::GET {
            return None;
        }
        self.entries.get(&request.cache_key())
    }

    /// Match a GET for a URL.
    pub fn match_url(&self, url: &Url) -> Option<&CacheEntry> {
        self.entries.get(&cache_key(&Method::GET, url))
    }

    fn insert(&mut self, request: &Request, entry: CacheEntry) {
        trace!(cache = %self.name, url = %request.url, "Cache put");
        self.entries.insert(request.cache_key(), entry);
    }

    /// Delete the entry for a URL.
    pub fn delete(&mut self, url: &Url) -> bool {
        self.entries.remove(&cache_key(&Method::GET, url)).is_some()
    }

    /// Get all cached URLs.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.values().map(|e| e.url.as_str()).collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes held by this partition.
    pub fn size(&self) -> usize {
        self.entries.values().map(CacheEntry::size).sum()
    }
}

// ==================== Cache Storage ====================

/// Cache storage (the `caches` global).
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,

    /// Byte quota across all partitions; `None` is unlimited.
    quota: Option<usize>,
}

impl CacheStorage {
    /// Create new cache storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared handle.
    pub fn shared() -> SharedCacheStorage {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Limit total stored bytes. Writes past the limit fail.
    pub fn set_quota(&mut self, quota: Option<usize>) {
        self.quota = quota;
    }

    /// Open a cache (creates if doesn't exist).
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Get a cache without creating it.
    pub fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    /// Check if cache exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a cache.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// Get all cache names, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.keys().cloned().collect();
        names.sort();
        names
    }

    /// Store a response in a named cache, enforcing the quota.
    pub fn put(
        &mut self,
        name: &str,
        request: &Request,
        response: &Response,
    ) -> Result<(), ServiceWorkerError> {
        if request.method != Method::GET {
            return Err(ServiceWorkerError::CacheError(format!(
                "Request method '{}' is unsupported",
                request.method
            )));
        }
        let entry = CacheEntry::from_response(request, response);

        if let Some(quota) = self.quota {
            let replaced = self
                .caches
                .get(name)
                .and_then(|c| c.match_request(request))
                .map(CacheEntry::size)
                .unwrap_or(0);
            let projected = self.usage() - replaced + entry.size();
            if projected > quota {
                return Err(ServiceWorkerError::QuotaExceeded {
                    requested: entry.size(),
                    quota,
                });
            }
        }

        self.open(name).insert(request, entry);
        Ok(())
    }

    /// Match in one named cache.
    pub fn match_in(&self, name: &str, request: &Request) -> Option<&CacheEntry> {
        self.caches.get(name)?.match_request(request)
    }

    /// Match across all caches, in name order.
    pub fn match_request(&self, request: &Request) -> Option<&CacheEntry> {
        self.keys()
            .into_iter()
            .find_map(|name| self.caches.get(&name)?.match_request(request))
    }

    /// Bytes held across all partitions.
    pub fn usage(&self) -> usize {
        self.caches.values().map(Cache::size).sum()
    }

    /// Delete every cache. Returns how many were removed.
    pub fn clear(&mut self) -> usize {
        let count = self.caches.len();
        self.caches.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str) -> Request {
        Request::get(Url::parse("https://shop.example/").unwrap().join(path).unwrap())
    }

    fn response(body: &str) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/css"));
        Response::new(
            Url::parse("https://shop.example/style.css").unwrap(),
            StatusCode::OK,
            headers,
            Bytes::copy_from_slice(body.as_bytes()),
        )
    }

    #[test]
    fn test_cache_put_and_match() {
        let mut storage = CacheStorage::new();
        storage
            .put("static-v1", &request("/style.css"), &response("body{}"))
            .unwrap();

        let entry = storage.match_in("static-v1", &request("/style.css")).unwrap();
        assert_eq!(entry.status, 200);
        assert_eq!(entry.headers.get("content-type").unwrap(), "text/css");
        assert!(storage.match_in("static-v1", &request("/other.css")).is_none());
    }

    #[test]
    fn test_non_get_is_never_stored() {
        let mut storage = CacheStorage::new();
        let mut post = request("/api/cart");
        post.method = Method::POST;

        assert!(matches!(
            storage.put("dynamic-v1", &post, &response("{}")),
            Err(ServiceWorkerError::CacheError(_))
        ));
        assert!(!storage.has("dynamic-v1"));
    }

    #[test]
    fn test_entry_round_trips_to_response() {
        let req = request("/style.css");
        let entry = CacheEntry::from_response(&req, &response("body{}"));
        let rebuilt = entry.to_response();

        assert_eq!(rebuilt.status, StatusCode::OK);
        assert_eq!(rebuilt.header("content-type"), Some("text/css"));
        assert_eq!(&rebuilt.body[..], b"body{}");
    }

    #[test]
    fn test_cache_delete() {
        let mut storage = CacheStorage::new();
        storage
            .put("static-v1", &request("/style.css"), &response("a"))
            .unwrap();
        let cache = storage.open("static-v1");
        assert!(cache.delete(&Url::parse("https://shop.example/style.css").unwrap()));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_storage_keys_and_delete() {
        let mut storage = CacheStorage::new();
        assert!(!storage.has("b"));

        storage.open("b");
        storage.open("a");
        assert_eq!(storage.keys(), vec!["a".to_string(), "b".to_string()]);

        assert!(storage.delete("b"));
        assert!(!storage.has("b"));
        assert_eq!(storage.clear(), 1);
    }

    #[test]
    fn test_quota_exceeded() {
        let mut storage = CacheStorage::new();
        storage.set_quota(Some(64));

        let big = "x".repeat(128);
        let result = storage.put("dynamic-v1", &request("/big"), &response(&big));
        assert!(matches!(result, Err(ServiceWorkerError::QuotaExceeded { .. })));
        assert!(!storage.has("dynamic-v1"));
    }

    #[test]
    fn test_last_write_wins() {
        let mut storage = CacheStorage::new();
        storage.put("d", &request("/a"), &response("one")).unwrap();
        storage.put("d", &request("/a"), &response("two")).unwrap();

        let entry = storage.match_in("d", &request("/a")).unwrap();
        assert_eq!(entry.body, b"two");
        assert_eq!(storage.get("d").unwrap().len(), 1);
    }
}
