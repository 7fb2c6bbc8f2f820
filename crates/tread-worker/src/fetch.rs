//! Fetch strategies.

use http::StatusCode;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, trace, warn};
use tread_net::{Request, Response};
use tread_sw::{CacheEntry, EventOutcome, FetchEvent, ServiceWorkerError, WorkerScope};

use crate::routing::RouteClass;
use crate::CacheWorker;

const OFFLINE_PAGE: &str = "<!DOCTYPE html>\
<html><head><meta charset=\"utf-8\"><title>Offline</title></head>\
<body><h1>You are offline</h1><p>Check your connection and try again.</p></body></html>";

/// JSON error body for failed API calls.
fn offline_error(message: &str) -> Response {
    Response::json(
        StatusCode::SERVICE_UNAVAILABLE,
        &json!({ "error": message, "offline": true }),
    )
    .mark_offline()
}

/// Re-serve a cached API body with `offline: true`. Bodies that are not JSON
/// objects are wrapped as `{ data, offline }`.
fn offline_copy(entry: &CacheEntry) -> Response {
    let body = match serde_json::from_slice::<JsonValue>(&entry.body) {
        Ok(JsonValue::Object(mut object)) => {
            object.insert("offline".to_string(), JsonValue::Bool(true));
            JsonValue::Object(object)
        }
        Ok(other) => json!({ "data": other, "offline": true }),
        Err(_) => json!({
            "data": String::from_utf8_lossy(&entry.body),
            "offline": true,
        }),
    };
    Response::json(StatusCode::OK, &body).mark_offline()
}

impl CacheWorker {
    pub(crate) async fn on_fetch(
        &self,
        event: FetchEvent,
        scope: &WorkerScope,
    ) -> Result<EventOutcome, ServiceWorkerError> {
        let request = event.request;
        let response = match self.router.classify(&request) {
            RouteClass::Passthrough => {
                trace!(method = %request.method, url = %request.url, "Not intercepted");
                return Ok(EventOutcome::Passthrough);
            }
            RouteClass::CacheableApi => self.network_first(request, scope).await,
            RouteClass::NetworkOnlyApi => self.network_only(request, scope).await,
            RouteClass::Static => self.cache_first(request, scope).await,
        };
        Ok(EventOutcome::Respond(response))
    }

    /// Look in the static partition, then the dynamic one.
    async fn lookup(&self, scope: &WorkerScope, request: &Request) -> Option<CacheEntry> {
        let caches = scope.caches().read().await;
        caches
            .match_in(&self.static_cache, request)
            .or_else(|| caches.match_in(&self.dynamic_cache, request))
            .cloned()
    }

    /// Store a copy in the dynamic partition. Failures never reach the page.
    async fn store_dynamic(&self, scope: &WorkerScope, request: &Request, response: &Response) {
        let result = scope
            .caches()
            .write()
            .await
            .put(&self.dynamic_cache, request, response);
        if let Err(e) = result {
            warn!(url = %request.url, error = %e, "Dynamic cache write failed");
        }
    }

    async fn network_first(&self, request: Request, scope: &WorkerScope) -> Response {
        match scope.fetch(request.clone()).await {
            Ok(response) => {
                if response.ok() {
                    self.store_dynamic(scope, &request, &response).await;
                }
                response
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "API unreachable, trying cache");
                match self.lookup(scope, &request).await {
                    Some(entry) => offline_copy(&entry),
                    None => offline_error("Network unavailable and no cached data"),
                }
            }
        }
    }

    async fn network_only(&self, request: Request, scope: &WorkerScope) -> Response {
        match scope.fetch(request.clone()).await {
            Ok(response) => response,
            Err(e) => {
                debug!(url = %request.url, error = %e, "API unreachable");
                offline_error("Network unavailable")
            }
        }
    }

    async fn cache_first(&self, request: Request, scope: &WorkerScope) -> Response {
        if let Some(entry) = self.lookup(scope, &request).await {
            trace!(url = %request.url, "Cache hit");
            return entry.to_response();
        }

        match scope.fetch(request.clone()).await {
            Ok(response) => {
                if response.ok() && response.is_same_origin(scope.registration_scope()) {
                    self.store_dynamic(scope, &request, &response).await;
                }
                response
            }
            Err(e) if request.is_navigation() => {
                debug!(url = %request.url, error = %e, "Navigation offline");
                let fallback = match self.config.resolve(&self.config.offline_document) {
                    Ok(url) => {
                        let caches = scope.caches().read().await;
                        caches
                            .get(&self.static_cache)
                            .and_then(|cache| cache.match_url(&url))
                            .map(CacheEntry::to_response)
                    }
                    Err(_) => None,
                };
                fallback.unwrap_or_else(|| {
                    Response::html(StatusCode::SERVICE_UNAVAILABLE, OFFLINE_PAGE).mark_offline()
                })
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Asset offline");
                Response::text(StatusCode::SERVICE_UNAVAILABLE, "Offline").mark_offline()
            }
        }
    }
}
