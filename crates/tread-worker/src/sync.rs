//! Background sync: replay of queued cart and wishlist writes.

use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderValue, Method};
use tracing::{debug, info, warn};
use tread_core::SyncTag;
use tread_net::Request;
use tread_storage::{MutationKind, MutationQueue, QueuedMutation};
use tread_sw::{EventOutcome, ServiceWorkerError, SyncEvent, WorkerScope};

use crate::CacheWorker;

/// Result of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// Entries confirmed by the server and removed.
    pub replayed: usize,
    /// Entries still queued.
    pub remaining: usize,
}

fn kind_for(tag: SyncTag) -> MutationKind {
    match tag {
        SyncTag::Cart => MutationKind::Cart,
        SyncTag::Wishlist => MutationKind::Wishlist,
    }
}

impl CacheWorker {
    pub(crate) async fn on_sync(
        &self,
        event: SyncEvent,
        scope: &WorkerScope,
    ) -> Result<EventOutcome, ServiceWorkerError> {
        let Some(tag) = SyncTag::parse(&event.tag) else {
            debug!(tag = %event.tag, "Ignoring unknown sync tag");
            return Ok(EventOutcome::Handled);
        };

        let report = self.replay(kind_for(tag), scope).await?;
        if report.remaining > 0 {
            return Err(ServiceWorkerError::NetworkError(format!(
                "{} of {} {} entries still queued",
                report.remaining,
                report.replayed + report.remaining,
                tag.as_str()
            )));
        }
        Ok(EventOutcome::Handled)
    }

    fn replay_request(&self, mutation: &QueuedMutation) -> Result<Request, ServiceWorkerError> {
        let url = self
            .config
            .resolve(&mutation.path)
            .map_err(|e| ServiceWorkerError::ScriptError(e.to_string()))?;
        let method = Method::from_bytes(mutation.method.as_bytes())
            .map_err(|e| ServiceWorkerError::ScriptError(e.to_string()))?;
        let body = serde_json::to_vec(&mutation.body)
            .map_err(|e| ServiceWorkerError::ScriptError(e.to_string()))?;

        let mut request = Request::with_method(method, url, Some(body.into()))
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &mutation.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|e| ServiceWorkerError::ScriptError(e.to_string()))?;
            request = request.header(AUTHORIZATION, value);
        }
        Ok(request)
    }

    /// Replay every queued entry of one kind in order. Each entry is removed
    /// only after its own request succeeded.
    pub async fn replay(
        &self,
        kind: MutationKind,
        scope: &WorkerScope,
    ) -> Result<ReplayReport, ServiceWorkerError> {
        let queue = MutationQueue::new(scope.storage().databases.clone());
        let mut report = ReplayReport::default();

        for (id, mutation) in queue.pending(kind).await? {
            let outcome = match self.replay_request(&mutation) {
                Ok(request) => scope.fetch(request).await.map_err(ServiceWorkerError::from),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(response) if response.ok() => {
                    queue.remove(kind, id).await?;
                    report.replayed += 1;
                }
                Ok(response) => {
                    let attempts = queue.record_failure(kind, id).await?;
                    warn!(?kind, id, status = %response.status, attempts, "Replay rejected");
                    report.remaining += 1;
                }
                Err(e) => {
                    let attempts = queue.record_failure(kind, id).await?;
                    warn!(?kind, id, error = %e, attempts, "Replay failed");
                    report.remaining += 1;
                }
            }
        }

        info!(?kind, replayed = report.replayed, remaining = report.remaining, "Sync finished");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Shop;
    use http::StatusCode;
    use serde_json::json;

    async fn queue(shop: &Shop) -> MutationQueue {
        MutationQueue::new(shop.container.storage().databases.clone())
    }

    #[tokio::test]
    async fn test_replay_removes_confirmed_entries() {
        let shop = Shop::new();
        shop.network
            .serve(Method::POST, "/api/cart", StatusCode::CREATED, "application/json", "{}");
        shop.deploy("A").await.unwrap();

        let queue = queue(&shop).await;
        queue
            .enqueue(
                QueuedMutation::new(MutationKind::Cart, "POST", "/api/cart", json!({"sku": "P-205"}))
                    .with_token("secret"),
            )
            .await
            .unwrap();

        shop.container.sync(&shop.scope(), "sync-cart", false).await.unwrap();

        assert_eq!(queue.len(MutationKind::Cart).await, 0);
        let sent = shop.network.last_request(Method::POST, "/api/cart").unwrap();
        assert_eq!(sent.headers.get(AUTHORIZATION).unwrap(), "Bearer secret");
        assert_eq!(sent.headers.get(CONTENT_TYPE).unwrap(), "application/json");
        let body: serde_json::Value = serde_json::from_slice(sent.body.as_ref().unwrap()).unwrap();
        assert_eq!(body, json!({"sku": "P-205"}));
    }

    #[tokio::test]
    async fn test_failed_entries_stay_queued() {
        let shop = Shop::new();
        shop.network
            .serve(Method::POST, "/api/cart", StatusCode::CREATED, "application/json", "{}");
        shop.network
            .serve(Method::PUT, "/api/cart/9", StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "boom");
        shop.deploy("A").await.unwrap();

        let queue = queue(&shop).await;
        queue
            .enqueue(QueuedMutation::new(MutationKind::Cart, "POST", "/api/cart", json!({"sku": 1})))
            .await
            .unwrap();
        queue
            .enqueue(QueuedMutation::new(MutationKind::Cart, "PUT", "/api/cart/9", json!({"qty": 2})))
            .await
            .unwrap();
        queue
            .enqueue(QueuedMutation::new(MutationKind::Cart, "POST", "/api/cart", json!({"sku": 3})))
            .await
            .unwrap();

        let result = shop.container.sync(&shop.scope(), "sync-cart", false).await;
        assert!(result.is_err());

        let pending = queue.pending(MutationKind::Cart).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1.path, "/api/cart/9");
        assert_eq!(pending[0].1.attempts, 1);
    }

    #[tokio::test]
    async fn test_replay_follows_queue_order() {
        let shop = Shop::new();
        shop.network
            .serve(Method::POST, "/api/cart", StatusCode::CREATED, "application/json", "{}");
        shop.network
            .serve(Method::PUT, "/api/cart/9", StatusCode::OK, "application/json", "{}");
        shop.network
            .serve(Method::DELETE, "/api/cart/4", StatusCode::NO_CONTENT, "application/json", "");
        shop.deploy("A").await.unwrap();

        let queue = queue(&shop).await;
        for (method, path) in [("POST", "/api/cart"), ("PUT", "/api/cart/9"), ("DELETE", "/api/cart/4")] {
            queue
                .enqueue(QueuedMutation::new(MutationKind::Cart, method, path, json!({})))
                .await
                .unwrap();
        }

        shop.container.sync(&shop.scope(), "sync-cart", false).await.unwrap();

        let replayed: Vec<(Method, String)> = shop
            .network
            .requests()
            .into_iter()
            .filter(|(_, url)| url.path().starts_with("/api/cart"))
            .map(|(method, url)| (method, url.path().to_string()))
            .collect();
        assert_eq!(
            replayed,
            vec![
                (Method::POST, "/api/cart".to_string()),
                (Method::PUT, "/api/cart/9".to_string()),
                (Method::DELETE, "/api/cart/4".to_string()),
            ]
        );
        assert_eq!(queue.len(MutationKind::Cart).await, 0);
    }

    #[tokio::test]
    async fn test_offline_sync_keeps_everything() {
        let shop = Shop::new();
        shop.deploy("A").await.unwrap();
        let queue = queue(&shop).await;
        queue
            .enqueue(QueuedMutation::new(MutationKind::Wishlist, "POST", "/api/wishlist", json!({})))
            .await
            .unwrap();

        shop.network.set_online(false);
        assert!(shop.container.sync(&shop.scope(), "sync-wishlist", false).await.is_err());
        assert_eq!(queue.len(MutationKind::Wishlist).await, 1);

        shop.network
            .serve(Method::POST, "/api/wishlist", StatusCode::OK, "application/json", "{}");
        shop.network.set_online(true);
        shop.container.sync(&shop.scope(), "sync-wishlist", true).await.unwrap();
        assert_eq!(queue.len(MutationKind::Wishlist).await, 0);
    }

    #[tokio::test]
    async fn test_tags_are_independent_and_unknown_ignored() {
        let shop = Shop::new();
        shop.deploy("A").await.unwrap();
        let queue = queue(&shop).await;
        queue
            .enqueue(QueuedMutation::new(MutationKind::Wishlist, "POST", "/api/wishlist", json!({})))
            .await
            .unwrap();

        // Nothing queued for the cart: succeeds without touching the wishlist.
        shop.container.sync(&shop.scope(), "sync-cart", false).await.unwrap();
        shop.container.sync(&shop.scope(), "sync-orders", false).await.unwrap();
        assert_eq!(queue.len(MutationKind::Wishlist).await, 1);
    }
}
