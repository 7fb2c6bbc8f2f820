//! Service worker container for one origin.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use hashbrown::HashMap;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, trace, warn};
use tread_net::{Fetcher, NetError, Request, Response};
use tread_storage::OriginStorage;
use url::Url;

use crate::cache::{CacheStorage, SharedCacheStorage};
use crate::clients::{ClientEvent, Clients};
use crate::events::{
    EventOutcome, FetchEvent, MessageEvent, NotificationClickEvent, PushEvent, SyncEvent,
    WorkerEvent,
};
use crate::lifecycle::{
    RegistrationInfo, ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration, WorkerInfo,
    WorkerSlot,
};
use crate::notifications::NotificationCenter;
use crate::scope::WorkerScope;
use crate::script::{ScriptSource, ServiceWorkerScript};
use crate::ServiceWorkerError;

/// Options for service worker registration.
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Scope URL; defaults to the script's directory.
    pub scope: Option<Url>,
}

/// Service worker container (navigator.serviceWorker) shared by every page
/// of the origin.
pub struct ServiceWorkerContainer {
    origin: Url,

    /// Registrations by scope.
    registrations: Arc<RwLock<HashMap<String, ServiceWorkerRegistration>>>,

    caches: SharedCacheStorage,
    clients: Arc<RwLock<Clients>>,
    notifications: Arc<RwLock<NotificationCenter>>,
    network: Arc<dyn Fetcher>,
    scripts: Arc<dyn ScriptSource>,
    storage: OriginStorage,

    /// Serializes register, update, activation and unregister jobs.
    jobs: Mutex<()>,
}

fn state_event(worker: &ServiceWorker) -> ClientEvent {
    ClientEvent::StateChange {
        worker: worker.id,
        version: worker.version().to_string(),
        state: worker.state,
    }
}

fn default_scope(script_url: &Url) -> Url {
    let mut scope = script_url.clone();
    let dir = script_url
        .path()
        .rsplit_once('/')
        .map(|(dir, _)| dir)
        .unwrap_or("");
    scope.set_path(&format!("{dir}/"));
    scope.set_query(None);
    scope.set_fragment(None);
    scope
}

/// Longest registered scope that prefixes `url`.
fn matching_scope(registrations: &HashMap<String, ServiceWorkerRegistration>, url: &Url) -> Option<String> {
    registrations
        .keys()
        .filter(|scope| url.as_str().starts_with(scope.as_str()))
        .max_by_key(|scope| scope.len())
        .cloned()
}

impl ServiceWorkerContainer {
    /// Create a container for an origin.
    pub fn new(origin: Url, network: Arc<dyn Fetcher>, scripts: Arc<dyn ScriptSource>) -> Self {
        Self {
            origin,
            registrations: Arc::new(RwLock::new(HashMap::new())),
            caches: CacheStorage::shared(),
            clients: Arc::new(RwLock::new(Clients::new())),
            notifications: Arc::new(RwLock::new(NotificationCenter::new())),
            network,
            scripts,
            storage: OriginStorage::new(),
            jobs: Mutex::new(()),
        }
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn caches(&self) -> &SharedCacheStorage {
        &self.caches
    }

    pub fn storage(&self) -> &OriginStorage {
        &self.storage
    }

    pub fn notifications(&self) -> &Arc<RwLock<NotificationCenter>> {
        &self.notifications
    }

    fn worker_scope(&self, id: ServiceWorkerId, version: &str, scope: Url) -> WorkerScope {
        WorkerScope::new(
            id,
            version,
            scope,
            self.caches.clone(),
            self.clients.clone(),
            self.notifications.clone(),
            self.network.clone(),
            self.storage.clone(),
        )
    }

    async fn broadcast(&self, scope: &Url, events: Vec<ClientEvent>) {
        if events.is_empty() {
            return;
        }
        let clients = self.clients.read().await;
        for event in events {
            clients.broadcast(scope, event);
        }
    }

    // ==================== Pages ====================

    /// Attach a page. It is controlled if an active worker covers its URL.
    pub async fn connect_client(&self, url: Url) -> (String, mpsc::UnboundedReceiver<ClientEvent>) {
        let controller = {
            let registrations = self.registrations.read().await;
            matching_scope(&registrations, &url)
                .and_then(|key| registrations.get(&key)?.active.as_ref().map(|w| w.id))
        };
        let (id, rx) = self.clients.write().await.connect(url, controller);
        debug!(client = %id, controlled = controller.is_some(), "Client connected");
        (id, rx)
    }

    /// Detach a page.
    pub async fn disconnect_client(&self, id: &str) -> bool {
        self.clients.write().await.remove(id).is_some()
    }

    /// The worker controlling a page.
    pub async fn controller(&self, client_id: &str) -> Option<WorkerInfo> {
        let controller = self.clients.read().await.get(client_id)?.controller?;
        let registrations = self.registrations.read().await;
        registrations
            .values()
            .find_map(|r| r.worker(controller))
            .map(ServiceWorker::info)
    }

    /// URLs of every attached page and worker-opened window.
    pub async fn client_urls(&self) -> Vec<Url> {
        let mut urls: Vec<Url> = self.clients.read().await.iter().map(|c| c.url.clone()).collect();
        urls.sort();
        urls
    }

    // ==================== Registration ====================

    /// Register a service worker. Re-registering an unchanged script is a no-op.
    pub async fn register(
        &self,
        script_url: &Url,
        options: RegistrationOptions,
    ) -> Result<RegistrationInfo, ServiceWorkerError> {
        if script_url.origin() != self.origin.origin() {
            return Err(ServiceWorkerError::SecurityError(format!(
                "Script {script_url} is not on origin {}",
                self.origin
            )));
        }
        let scope = options.scope.unwrap_or_else(|| default_scope(script_url));
        if scope.origin() != self.origin.origin() {
            return Err(ServiceWorkerError::SecurityError(format!(
                "Scope {scope} is not on origin {}",
                self.origin
            )));
        }
        let key = scope.to_string();

        let _job = self.jobs.lock().await;
        let script = self
            .scripts
            .load(script_url)
            .await
            .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?;

        let unchanged = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .entry(key.clone())
                .or_insert_with(|| ServiceWorkerRegistration::new(scope.clone()));
            registration
                .newest_worker()
                .is_some_and(|w| w.version() == script.version() && w.script_url == *script_url)
        };

        if unchanged {
            debug!(scope = %key, version = script.version(), "Registration unchanged");
        } else {
            self.install(&key, script_url.clone(), script).await?;
        }

        self.registrations
            .read()
            .await
            .get(&key)
            .map(ServiceWorkerRegistration::info)
            .ok_or(ServiceWorkerError::NotFound(key))
    }

    /// Re-fetch the script of a registration and install it if it changed.
    /// Returns whether a new worker was installed.
    pub async fn update(&self, scope: &Url) -> Result<bool, ServiceWorkerError> {
        let key = scope.to_string();
        let _job = self.jobs.lock().await;

        let (script_url, current) = {
            let registrations = self.registrations.read().await;
            let registration = registrations
                .get(&key)
                .ok_or_else(|| ServiceWorkerError::NotFound(key.clone()))?;
            let newest = registration.newest_worker().ok_or_else(|| {
                ServiceWorkerError::StateError("Registration has no worker to update".to_string())
            })?;
            (newest.script_url.clone(), newest.version().to_string())
        };

        let script = self.scripts.load(&script_url).await?;
        if script.version() == current {
            if let Some(registration) = self.registrations.write().await.get_mut(&key) {
                registration.last_update_check = Some(Instant::now());
            }
            trace!(scope = %key, version = %current, "No update");
            return Ok(false);
        }

        info!(scope = %key, from = %current, to = script.version(), "Update found");
        self.install(&key, script_url, script).await?;
        Ok(true)
    }

    async fn install(
        &self,
        key: &str,
        script_url: Url,
        script: Arc<dyn ServiceWorkerScript>,
    ) -> Result<(), ServiceWorkerError> {
        let id = ServiceWorkerId::new();
        let mut events = Vec::new();

        let (worker, scope_url) = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(key)
                .ok_or_else(|| ServiceWorkerError::NotFound(key.to_string()))?;
            let scope = Arc::new(self.worker_scope(id, script.version(), registration.scope.clone()));

            if let Some(displaced) =
                registration.start_install(ServiceWorker::new(id, script_url, script, scope))
            {
                events.push(state_event(&displaced));
            }
            let worker = registration.slot(WorkerSlot::Installing).cloned().ok_or_else(|| {
                ServiceWorkerError::StateError("Installing slot empty".to_string())
            })?;
            events.push(ClientEvent::UpdateFound {
                scope: registration.scope.clone(),
            });
            events.push(state_event(&worker));
            (worker, registration.scope.clone())
        };
        self.broadcast(&scope_url, events).await;

        info!(worker = %worker.id, version = worker.version(), "Installing service worker");
        let outcome = worker
            .script
            .handle_event(WorkerEvent::Install, &worker.scope)
            .await;

        let mut events = Vec::new();
        let settled = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(key)
                .ok_or_else(|| ServiceWorkerError::NotFound(key.to_string()))?;

            match outcome {
                Ok(_) => {
                    if let Some(displaced) = registration.install_complete() {
                        events.push(state_event(&displaced));
                    }
                    if let Some(waiting) = registration.slot(WorkerSlot::Waiting) {
                        events.push(state_event(waiting));
                    }
                    Ok(registration.active.is_none())
                }
                Err(e) => {
                    warn!(worker = %worker.id, error = %e, "Install failed");
                    if let Some(failed) = registration.install_failed(&e.to_string()) {
                        events.push(state_event(&failed));
                    }
                    if registration.is_empty() {
                        registrations.remove(key);
                    }
                    Err(ServiceWorkerError::InstallFailed(e.to_string()))
                }
            }
        };
        self.broadcast(&scope_url, events).await;

        let nothing_active = settled?;
        if nothing_active || worker.scope.skip_waiting_requested() {
            self.activate_waiting(key).await?;
        }
        Ok(())
    }

    async fn activate_waiting(&self, key: &str) -> Result<bool, ServiceWorkerError> {
        let (worker, retired, scope_url) = {
            let mut registrations = self.registrations.write().await;
            let registration = registrations
                .get_mut(key)
                .ok_or_else(|| ServiceWorkerError::NotFound(key.to_string()))?;
            let Some((worker, retired)) = registration.begin_activation() else {
                return Ok(false);
            };
            (worker, retired, registration.scope.clone())
        };

        info!(worker = %worker.id, version = worker.version(), "Activating service worker");
        let mut events: Vec<ClientEvent> = retired.iter().map(state_event).collect();
        events.push(state_event(&worker));
        self.broadcast(&scope_url, events).await;

        if let Some(old) = &retired {
            let moved = self
                .clients
                .write()
                .await
                .hand_over(old.id, worker.id, worker.version());
            debug!(from = %old.id, to = %worker.id, moved, "Controllers handed over");
        }

        if let Err(e) = worker
            .script
            .handle_event(WorkerEvent::Activate, &worker.scope)
            .await
        {
            warn!(worker = %worker.id, error = %e, "Activate handler failed");
        }

        let finished = self
            .registrations
            .write()
            .await
            .get_mut(key)
            .and_then(|r| r.finish_activation(worker.id).map(state_event));
        if let Some(event) = finished {
            self.broadcast(&scope_url, vec![event]).await;
        }
        Ok(true)
    }

    /// Get the registration covering a URL.
    pub async fn get_registration(&self, url: &Url) -> Option<RegistrationInfo> {
        let registrations = self.registrations.read().await;
        let key = matching_scope(&registrations, url)?;
        registrations.get(&key).map(ServiceWorkerRegistration::info)
    }

    /// Get all registrations, sorted by scope.
    pub async fn get_registrations(&self) -> Vec<RegistrationInfo> {
        let mut infos: Vec<RegistrationInfo> = self
            .registrations
            .read()
            .await
            .values()
            .map(ServiceWorkerRegistration::info)
            .collect();
        infos.sort_by(|a, b| a.scope.as_str().cmp(b.scope.as_str()));
        infos
    }

    /// Unregister a service worker.
    pub async fn unregister(&self, scope: &Url) -> bool {
        let _job = self.jobs.lock().await;
        let removed = self.registrations.write().await.remove(scope.as_str());
        match removed {
            Some(mut registration) => {
                let events = registration.unregister().iter().map(state_event).collect();
                self.broadcast(scope, events).await;
                info!(scope = %scope, "Service worker unregistered");
                true
            }
            None => false,
        }
    }

    // ==================== Messaging ====================

    /// Post a message from a page to one of a registration's workers.
    pub async fn post_message(
        &self,
        scope: &Url,
        slot: WorkerSlot,
        data: JsonValue,
        source: Option<&str>,
    ) -> Result<(), ServiceWorkerError> {
        let key = scope.to_string();
        let worker = self
            .registrations
            .read()
            .await
            .get(&key)
            .and_then(|r| r.slot(slot).cloned())
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("{slot:?} worker for {key}")))?;

        let event = WorkerEvent::Message(MessageEvent {
            data,
            source: source.map(str::to_string),
        });
        worker.script.handle_event(event, &worker.scope).await?;

        if slot == WorkerSlot::Waiting && worker.scope.skip_waiting_requested() {
            let _job = self.jobs.lock().await;
            self.activate_waiting(&key).await?;
        }
        Ok(())
    }

    // ==================== Functional events ====================

    async fn controlling_worker(&self, client_id: Option<&str>, request: &Request) -> Option<ServiceWorker> {
        if request.is_navigation() {
            let registrations = self.registrations.read().await;
            let key = matching_scope(&registrations, &request.url)?;
            return registrations.get(&key)?.active.clone();
        }

        let controller = self.clients.read().await.get(client_id?)?.controller?;
        self.registrations
            .read()
            .await
            .values()
            .find_map(|r| r.worker(controller))
            .cloned()
    }

    /// Fetch on behalf of a page, through its controller when it has one.
    pub async fn fetch(&self, client_id: Option<&str>, request: Request) -> Result<Response, NetError> {
        let Some(worker) = self.controlling_worker(client_id, &request).await else {
            trace!(url = %request.url, "Uncontrolled fetch");
            return self.network.fetch(request).await;
        };

        let event = WorkerEvent::Fetch(FetchEvent {
            request: request.clone(),
            client_id: client_id.map(str::to_string),
        });
        match worker.script.handle_event(event, &worker.scope).await {
            Ok(EventOutcome::Respond(response)) => Ok(response),
            Ok(_) => self.network.fetch(request).await,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Fetch handler failed");
                Err(NetError::RequestFailed(e.to_string()))
            }
        }
    }

    async fn active_worker(&self, scope: &Url) -> Result<ServiceWorker, ServiceWorkerError> {
        let registrations = self.registrations.read().await;
        let registration = registrations
            .get(scope.as_str())
            .ok_or_else(|| ServiceWorkerError::NotFound(scope.to_string()))?;
        registration
            .active
            .clone()
            .ok_or_else(|| ServiceWorkerError::StateError("No active worker".to_string()))
    }

    /// Fire a background sync. An error means the sync should be retried.
    pub async fn sync(&self, scope: &Url, tag: &str, last_chance: bool) -> Result<(), ServiceWorkerError> {
        let worker = self.active_worker(scope).await?;
        debug!(tag, last_chance, "Dispatching sync");
        let event = WorkerEvent::Sync(SyncEvent {
            tag: tag.to_string(),
            last_chance,
        });
        worker.script.handle_event(event, &worker.scope).await.map(|_| ())
    }

    /// Deliver a push message.
    pub async fn push(&self, scope: &Url, data: Option<Bytes>) -> Result<(), ServiceWorkerError> {
        let worker = self.active_worker(scope).await?;
        debug!(bytes = data.as_ref().map_or(0, Bytes::len), "Dispatching push");
        let event = WorkerEvent::Push(PushEvent { data });
        worker.script.handle_event(event, &worker.scope).await.map(|_| ())
    }

    /// Report a click on a shown notification.
    pub async fn notification_click(
        &self,
        scope: &Url,
        notification_id: u64,
        action: Option<&str>,
    ) -> Result<(), ServiceWorkerError> {
        let notification = self
            .notifications
            .read()
            .await
            .get(notification_id)
            .cloned()
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("notification {notification_id}")))?;
        let worker = self.active_worker(scope).await?;
        let event = WorkerEvent::NotificationClick(NotificationClickEvent {
            notification,
            action: action.map(str::to_string),
        });
        worker.script.handle_event(event, &worker.scope).await.map(|_| ())
    }
}
