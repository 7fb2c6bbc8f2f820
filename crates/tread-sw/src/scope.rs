//! The worker's global scope: everything a script can reach.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::RwLock;
use tracing::debug;
use tread_net::{Fetcher, NetError, Request, Response};
use tread_storage::OriginStorage;
use url::Url;

use crate::cache::SharedCacheStorage;
use crate::clients::{ClientMatchOptions, ClientType, Clients};
use crate::lifecycle::ServiceWorkerId;
use crate::notifications::{NotificationCenter, NotificationOptions};
use crate::ServiceWorkerError;

/// Capabilities handed to one worker instance.
pub struct WorkerScope {
    worker_id: ServiceWorkerId,
    version: String,
    registration_scope: Url,
    caches: SharedCacheStorage,
    clients: Arc<RwLock<Clients>>,
    notifications: Arc<RwLock<NotificationCenter>>,
    network: Arc<dyn Fetcher>,
    storage: OriginStorage,
    skip_waiting: AtomicBool,
}

impl WorkerScope {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        worker_id: ServiceWorkerId,
        version: &str,
        registration_scope: Url,
        caches: SharedCacheStorage,
        clients: Arc<RwLock<Clients>>,
        notifications: Arc<RwLock<NotificationCenter>>,
        network: Arc<dyn Fetcher>,
        storage: OriginStorage,
    ) -> Self {
        Self {
            worker_id,
            version: version.to_string(),
            registration_scope,
            caches,
            clients,
            notifications,
            network,
            storage,
            skip_waiting: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(worker_id: ServiceWorkerId, version: &str) -> Self {
        let origin = Url::parse("https://shop.example/").expect("static url");
        Self::new(
            worker_id,
            version,
            origin.clone(),
            crate::cache::CacheStorage::shared(),
            Arc::new(RwLock::new(Clients::new())),
            Arc::new(RwLock::new(NotificationCenter::new())),
            Arc::new(tread_net::MemoryNetwork::new(origin)),
            OriginStorage::new(),
        )
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.worker_id
    }

    /// Registration scope; its origin is the worker's origin.
    pub fn registration_scope(&self) -> &Url {
        &self.registration_scope
    }

    pub fn caches(&self) -> &SharedCacheStorage {
        &self.caches
    }

    pub fn storage(&self) -> &OriginStorage {
        &self.storage
    }

    /// Go to the network, bypassing any worker.
    pub async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        self.network.fetch(request).await
    }

    /// Activate as soon as installation finishes, even if an older worker
    /// still controls pages.
    pub fn skip_waiting(&self) {
        debug!(worker = %self.worker_id, "skipWaiting requested");
        self.skip_waiting.store(true, Ordering::SeqCst);
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Take control of every in-scope page. Returns how many were claimed.
    pub async fn claim(&self) -> usize {
        let claimed = self.clients.write().await.claim(
            self.worker_id,
            &self.version,
            &self.registration_scope,
        );
        debug!(worker = %self.worker_id, claimed = claimed.len(), "Clients claimed");
        claimed.len()
    }

    /// Ids of window clients, optionally including uncontrolled ones.
    pub async fn match_all(&self, include_uncontrolled: bool) -> Vec<String> {
        let options = ClientMatchOptions {
            include_uncontrolled,
            client_type: ClientType::Window,
        };
        self.clients
            .read()
            .await
            .match_all(&options, self.worker_id)
            .into_iter()
            .map(|c| c.id.clone())
            .collect()
    }

    pub async fn post_message(&self, client_id: &str, data: JsonValue) -> Result<(), ServiceWorkerError> {
        self.clients
            .read()
            .await
            .post_message(client_id, self.worker_id, data)
    }

    /// Open a new window on an in-origin URL. Returns the client id.
    pub async fn open_window(&self, url: &Url) -> Result<String, ServiceWorkerError> {
        if url.origin() != self.registration_scope.origin() {
            return Err(ServiceWorkerError::SecurityError(format!(
                "Cannot open cross-origin window: {url}"
            )));
        }
        let client = self.clients.write().await.open_window(url.clone());
        debug!(client = %client.id, url = %url, "Window opened");
        Ok(client.id)
    }

    pub async fn show_notification(&self, title: &str, options: NotificationOptions) -> u64 {
        self.notifications.write().await.show(title, options)
    }

    pub async fn close_notification(&self, id: u64) -> bool {
        self.notifications.write().await.close(id)
    }
}
