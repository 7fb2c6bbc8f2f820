//! In-memory origin used by the harness simulation and by tests.
//!
//! Routes are keyed by method and absolute URL. The whole network can be
//! switched offline, in which case every fetch fails with
//! [`NetError::Offline`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use serde::Serialize;
use tracing::trace;
use url::Url;

use crate::{cache_key, Fetcher, NetError, Request, Response};

#[derive(Debug, Clone)]
enum Route {
    Respond {
        status: StatusCode,
        content_type: String,
        body: Bytes,
    },
    Fail,
}

/// Scriptable in-memory network.
#[derive(Debug)]
pub struct MemoryNetwork {
    origin: Url,
    routes: Mutex<HashMap<String, Route>>,
    online: AtomicBool,
    log: Mutex<Vec<Request>>,
}

impl MemoryNetwork {
    /// Create an online network serving nothing for `origin`.
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            routes: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            log: Mutex::new(Vec::new()),
        }
    }

    fn url(&self, path: &str) -> Url {
        self.origin.join(path).unwrap_or_else(|_| self.origin.clone())
    }

    fn insert(&self, method: Method, path: &str, route: Route) {
        let key = cache_key(&method, &self.url(path));
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, route);
    }

    /// Serve a body with a status and content type.
    pub fn serve(&self, method: Method, path: &str, status: StatusCode, content_type: &str, body: impl Into<Bytes>) {
        self.insert(
            method,
            path,
            Route::Respond {
                status,
                content_type: content_type.to_string(),
                body: body.into(),
            },
        );
    }

    /// Serve a JSON body on GET.
    pub fn serve_json<T: Serialize>(&self, path: &str, value: &T) {
        let body = serde_json::to_vec(value).unwrap_or_default();
        self.serve(Method::GET, path, StatusCode::OK, "application/json", body);
    }

    /// Serve an HTML or asset body on GET.
    pub fn serve_text(&self, path: &str, content_type: &str, body: &str) {
        self.serve(
            Method::GET,
            path,
            StatusCode::OK,
            content_type,
            Bytes::copy_from_slice(body.as_bytes()),
        );
    }

    /// Make one route fail at the network level even while online.
    pub fn fail(&self, method: Method, path: &str) {
        self.insert(method, path, Route::Fail);
    }

    /// Remove a route so it answers 404.
    pub fn remove(&self, method: Method, path: &str) {
        let key = cache_key(&method, &self.url(path));
        self.routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
    }

    /// Switch the whole network on or off.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Number of requests that reached this network for a path.
    pub fn request_count(&self, path: &str) -> usize {
        let url = self.url(path);
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.url == url)
            .count()
    }

    /// Every request that reached this network, in order.
    pub fn requests(&self) -> Vec<(Method, Url)> {
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|r| (r.method.clone(), r.url.clone()))
            .collect()
    }

    /// Most recent request for a method and path, headers and body included.
    pub fn last_request(&self, method: Method, path: &str) -> Option<Request> {
        let url = self.url(path);
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .find(|r| r.method == method && r.url == url)
            .cloned()
    }
}

#[async_trait]
impl Fetcher for MemoryNetwork {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        if !self.is_online() {
            trace!(url = %request.url, "Memory network offline");
            return Err(NetError::Offline(request.url.to_string()));
        }

        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        let route = self
            .routes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&request.cache_key())
            .cloned();

        match route {
            Some(Route::Respond {
                status,
                content_type,
                body,
            }) => {
                let mut headers = HeaderMap::new();
                if let Ok(value) = HeaderValue::from_str(&content_type) {
                    headers.insert(http::header::CONTENT_TYPE, value);
                }
                Ok(Response::new(request.url, status, headers, body))
            }
            Some(Route::Fail) => Err(NetError::RequestFailed(format!(
                "connection reset: {}",
                request.url
            ))),
            None => Ok(Response::new(
                request.url,
                StatusCode::NOT_FOUND,
                HeaderMap::new(),
                Bytes::from_static(b"Not Found"),
            )),
        }
    }
}
