//! # Tread Update
//!
//! Page-side manager for the storefront's cache worker. One manager belongs
//! to one page: it owns the registration, watches generation changes through
//! a background event pump, tells subscribers when an update is available
//! and performs the skip-waiting handshake followed by a reload.
//!
//! ```text
//! UpdateManager ──register/update/post_message──► ServiceWorkerContainer
//!       ▲                                                 │
//!       └──── pump task ◄──── ClientEvent channel ◄───────┘
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tread_common::{with_timeout, Result, TreadError};
use tread_core::{AppConfig, PageMessage};
use tread_sw::{
    RegistrationInfo, RegistrationOptions, ServiceWorkerContainer, ServiceWorkerError, WorkerSlot,
};
use url::Url;

mod environment;
mod listeners;
mod pump;

pub use environment::{DisplayMode, InstallChoice, InstallPrompt, PageEnvironment};
pub use listeners::{ListenerId, UpdateCallback, UpdateInfo};

use listeners::Listeners;
use pump::{PageState, Pump};

/// Result of [`UpdateManager::force_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Control moved to the new generation and the page was reloaded.
    Reloaded,
    /// Nothing to apply.
    NoUpdate,
}

/// What [`UpdateManager::clear_app_data`] removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearedData {
    pub cache_partitions: usize,
    pub databases: usize,
}

struct Session {
    client_id: String,
    pump: JoinHandle<()>,
}

impl Drop for Session {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Fold a host failure into [`TreadError`], keeping its category.
fn host_error(context: impl Into<String>, err: ServiceWorkerError) -> TreadError {
    let context = context.into();
    match err {
        ServiceWorkerError::NetworkError(_) => TreadError::network_with_source(context, err),
        ServiceWorkerError::CacheError(_) | ServiceWorkerError::QuotaExceeded { .. } => {
            TreadError::cache_with_source(context, err)
        }
        ServiceWorkerError::Storage(_) => TreadError::storage_with_source(context, err),
        ServiceWorkerError::NotFound(what) => TreadError::NotFound(format!("{context}: {what}")),
        other => TreadError::worker_with_source(context, other),
    }
}

struct Inner {
    config: AppConfig,
    scope: Url,
    container: Arc<ServiceWorkerContainer>,
    environment: Arc<dyn PageEnvironment>,
    state: Arc<Mutex<PageState>>,
    listeners: Arc<Listeners>,
    controller: Arc<watch::Sender<Option<String>>>,
    session: tokio::sync::Mutex<Option<Session>>,
    install_prompt: Mutex<Option<Arc<dyn InstallPrompt>>>,
}

/// Update manager for one page. Cheap to clone.
#[derive(Clone)]
pub struct UpdateManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for UpdateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateManager")
            .field("scope", &self.inner.scope.as_str())
            .field("controller", &*self.inner.controller.borrow())
            .finish()
    }
}

impl UpdateManager {
    pub fn new(
        config: AppConfig,
        container: Arc<ServiceWorkerContainer>,
        environment: Arc<dyn PageEnvironment>,
    ) -> Self {
        let scope = config
            .resolve("/")
            .unwrap_or_else(|_| config.origin.clone());
        let (controller, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                config,
                scope,
                container,
                environment,
                state: Arc::new(Mutex::new(PageState::default())),
                listeners: Arc::new(Listeners::default()),
                controller: Arc::new(controller),
                session: tokio::sync::Mutex::new(None),
                install_prompt: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn container(&self) -> &Arc<ServiceWorkerContainer> {
        &self.inner.container
    }

    /// Client id of the page once attached.
    pub async fn client_id(&self) -> Option<String> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.client_id.clone())
    }

    /// Generation the page's assets belong to.
    pub fn loaded_version(&self) -> Option<String> {
        self.state().loaded.clone()
    }

    /// Generation currently controlling the page.
    pub fn controller_version(&self) -> Option<String> {
        self.inner.controller.borrow().clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PageState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach the page to the host and start the event pump. No-op when
    /// already attached.
    async fn attach(&self) -> String {
        let mut session = self.inner.session.lock().await;
        if let Some(existing) = session.as_ref() {
            return existing.client_id.clone();
        }

        let (client_id, events) = self
            .inner
            .container
            .connect_client(self.inner.scope.clone())
            .await;
        let controller = self
            .inner
            .container
            .controller(&client_id)
            .await
            .map(|info| info.version);
        self.state().loaded = controller.clone();
        self.inner.controller.send_replace(controller);

        let pump = Pump {
            state: self.inner.state.clone(),
            listeners: self.inner.listeners.clone(),
            controller: self.inner.controller.clone(),
        }
        .spawn(events);
        debug!(client = %client_id, "Page attached");

        *session = Some(Session {
            client_id: client_id.clone(),
            pump,
        });
        client_id
    }

    /// Detach the page from the host and stop its event pump. Returns whether
    /// the page was attached.
    pub async fn detach(&self) -> bool {
        let Some(session) = self.inner.session.lock().await.take() else {
            return false;
        };
        let removed = self.inner.container.disconnect_client(&session.client_id).await;
        debug!(client = %session.client_id, removed, "Page detached");
        removed
    }

    /// Drop every registration of the origin, then register the worker script
    /// at the root scope. Calling it again leaves exactly one registration.
    pub async fn initialize(&self) -> Result<RegistrationInfo> {
        self.attach().await;

        for stale in self.inner.container.get_registrations().await {
            if self.inner.container.unregister(&stale.scope).await {
                debug!(scope = %stale.scope, "Removed existing registration");
            }
        }

        let script_url = self.inner.config.script_url()?;
        let options = RegistrationOptions {
            scope: Some(self.inner.scope.clone()),
        };
        let info = self
            .inner
            .container
            .register(&script_url, options)
            .await
            .map_err(|e| host_error(format!("failed to register {script_url}"), e))?;

        info!(
            scope = %info.scope,
            active = ?info.active.as_ref().map(|w| w.version.as_str()),
            "Update manager initialized"
        );
        Ok(info)
    }

    async fn update_pending(&self) -> bool {
        if self.state().pending.is_some() {
            return true;
        }
        self.inner
            .container
            .get_registration(&self.inner.scope)
            .await
            .is_some_and(|r| r.waiting.is_some())
    }

    /// Ask the host to re-fetch the worker script. Returns whether an update
    /// was already known before this check.
    pub async fn check_for_updates(&self) -> bool {
        let was_pending = self.update_pending().await;
        match self.inner.container.update(&self.inner.scope).await {
            Ok(found) => debug!(found, "Update check finished"),
            Err(e) => {
                let err = host_error("update check failed", e);
                warn!(
                    error = %err,
                    category = err.category(),
                    retryable = err.is_retryable(),
                    "Update check failed"
                );
            }
        }
        was_pending
    }

    /// Run [`check_for_updates`](Self::check_for_updates) on an interval until
    /// the returned handle is aborted.
    pub fn spawn_periodic_checks(&self, interval: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        let period = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                manager.check_for_updates().await;
            }
        })
    }

    /// Activate the waiting generation and reload once it controls the page.
    ///
    /// The handshake is bounded by `update_timeout`; on expiry the page stays
    /// on its current generation and [`TreadError::Timeout`] is returned.
    pub async fn force_update(&self) -> Result<UpdateOutcome> {
        let waiting = self
            .inner
            .container
            .get_registration(&self.inner.scope)
            .await
            .and_then(|r| r.waiting);

        let Some(waiting) = waiting else {
            let controller = match self.client_id().await {
                Some(client) => self.inner.container.controller(&client).await.map(|w| w.version),
                None => None,
            };
            if controller.is_some() && controller != self.loaded_version() {
                self.reload(controller);
                return Ok(UpdateOutcome::Reloaded);
            }
            debug!("No waiting worker to activate");
            return Ok(UpdateOutcome::NoUpdate);
        };

        let client_id = self.client_id().await;
        let mut controller = self.inner.controller.subscribe();
        info!(version = %waiting.version, "Asking waiting worker to take over");
        self.inner
            .container
            .post_message(
                &self.inner.scope,
                WorkerSlot::Waiting,
                PageMessage::SkipWaiting.to_value(),
                client_id.as_deref(),
            )
            .await
            .map_err(|e| host_error("SKIP_WAITING was not delivered", e))?;

        let target = waiting.version.clone();
        with_timeout(self.inner.config.update_timeout(), || async move {
            controller
                .wait_for(|current| current.as_deref() == Some(target.as_str()))
                .await
                .map(|_| ())
        })
        .await?
        .map_err(|_| TreadError::internal("page event pump stopped"))?;

        self.reload(Some(waiting.version));
        Ok(UpdateOutcome::Reloaded)
    }

    fn reload(&self, controller: Option<String>) {
        {
            let mut state = self.state();
            state.loaded = controller.clone();
            state.pending = None;
            state.dismissed = false;
        }
        info!(version = ?controller, "Reloading page");
        self.inner.environment.reload();
    }

    pub fn on_update_available<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&UpdateInfo) + Send + Sync + 'static,
    {
        self.inner.listeners.add(Arc::new(callback))
    }

    pub fn remove_update_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Hide the pending update for this session. It stays pending.
    pub fn dismiss_update(&self) {
        let mut state = self.state();
        if state.pending.is_some() {
            state.dismissed = true;
        }
    }

    /// Fire the listeners again for a dismissed update that is still pending.
    pub fn resurface_update(&self) -> bool {
        let version = {
            let mut state = self.state();
            match (&state.pending, state.dismissed) {
                (Some(version), true) => {
                    let version = version.clone();
                    state.dismissed = false;
                    version
                }
                _ => return false,
            }
        };
        self.inner.listeners.fire(&UpdateInfo { version });
        true
    }

    /// Whether the page runs as an installed app.
    pub fn get_install_status(&self) -> bool {
        self.inner.environment.display_mode() == DisplayMode::Standalone
    }

    /// Keep the browser's deferred install prompt for later.
    pub fn capture_install_prompt(&self, prompt: Arc<dyn InstallPrompt>) {
        *self
            .inner
            .install_prompt
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(prompt);
        debug!("Install prompt captured");
    }

    pub fn can_install(&self) -> bool {
        self.inner
            .install_prompt
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Show the captured install prompt. Returns whether the user accepted.
    pub async fn install_app(&self) -> bool {
        let prompt = self
            .inner
            .install_prompt
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(prompt) = prompt else {
            debug!("No install prompt available");
            return false;
        };
        let choice = prompt.prompt().await;
        info!(?choice, "Install prompt answered");
        choice == InstallChoice::Accepted
    }

    /// Delete every cache partition of every generation, every database and
    /// all local storage of the origin. Not reversible.
    pub async fn clear_app_data(&self) -> ClearedData {
        let cache_partitions = self.inner.container.caches().write().await.clear();
        let databases = self.inner.container.storage().clear_all().await;
        warn!(cache_partitions, databases, "Application data cleared");
        ClearedData {
            cache_partitions,
            databases,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use tread_net::MemoryNetwork;
    use tread_storage::{MutationKind, MutationQueue, QueuedMutation};
    use tread_sw::{
        Deployment, EventOutcome, ServiceWorkerError, ServiceWorkerScript, WorkerEvent, WorkerScope,
    };
    use tread_worker::CacheWorker;

    const ORIGIN: &str = "https://shop.example/";

    #[derive(Default)]
    struct Page {
        reloads: AtomicUsize,
        standalone: bool,
    }

    impl PageEnvironment for Page {
        fn reload(&self) {
            self.reloads.fetch_add(1, Ordering::SeqCst);
        }

        fn display_mode(&self) -> DisplayMode {
            if self.standalone {
                DisplayMode::Standalone
            } else {
                DisplayMode::Browser
            }
        }
    }

    /// Installs fine but never honours SKIP_WAITING.
    struct Stubborn;

    #[async_trait]
    impl ServiceWorkerScript for Stubborn {
        fn version(&self) -> &str {
            "stubborn"
        }

        async fn handle_event(
            &self,
            _event: WorkerEvent,
            _scope: &WorkerScope,
        ) -> std::result::Result<EventOutcome, ServiceWorkerError> {
            Ok(EventOutcome::Handled)
        }
    }

    struct Prompt(InstallChoice);

    #[async_trait]
    impl InstallPrompt for Prompt {
        async fn prompt(&self) -> InstallChoice {
            self.0
        }
    }

    struct Harness {
        manager: UpdateManager,
        page: Arc<Page>,
        deployment: Arc<Deployment>,
        container: Arc<ServiceWorkerContainer>,
    }

    fn config(generation: &str) -> AppConfig {
        AppConfig {
            origin: Url::parse(ORIGIN).unwrap(),
            skip_waiting_on_install: false,
            update_timeout_ms: 200,
            ..AppConfig::default()
        }
        .with_generation(generation)
    }

    impl Harness {
        fn new() -> Self {
            Self::with_page(Page::default())
        }

        fn with_page(page: Page) -> Self {
            let origin = Url::parse(ORIGIN).unwrap();
            let network = Arc::new(MemoryNetwork::new(origin.clone()));
            for path in config("A").static_manifest {
                network.serve_text(&path, "text/html", "<html></html>");
            }
            let deployment = Arc::new(Deployment::new());
            let container = Arc::new(ServiceWorkerContainer::new(origin, network, deployment.clone()));
            let page = Arc::new(page);
            let manager = UpdateManager::new(config("A"), container.clone(), page.clone());
            Self {
                manager,
                page,
                deployment,
                container,
            }
        }

        async fn deploy(&self, generation: &str) {
            let config = config(generation);
            let script_url = config.script_url().unwrap();
            let worker = CacheWorker::new(config).unwrap();
            self.deployment.deploy(&script_url, Arc::new(worker)).await;
        }

        fn listen(&self) -> mpsc::UnboundedReceiver<String> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.manager.on_update_available(move |info| {
                let _ = tx.send(info.version.clone());
            });
            rx
        }

        fn reloads(&self) -> usize {
            self.page.reloads.load(Ordering::SeqCst)
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let h = Harness::new();
        h.deploy("A").await;

        let info = h.manager.initialize().await.unwrap();
        assert_eq!(info.active.unwrap().version, "A");

        // Reinstalling the running generation is not an update.
        let mut rx = h.listen();
        h.manager.initialize().await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err());

        let registrations = h.container.get_registrations().await;
        assert_eq!(registrations.len(), 1);
        assert_eq!(registrations[0].scope.as_str(), ORIGIN);
        assert!(h.manager.client_id().await.is_some());
        assert_eq!(h.manager.loaded_version().as_deref(), Some("A"));
        assert_eq!(h.manager.controller_version().as_deref(), Some("A"));
        assert!(!h.manager.check_for_updates().await);
        assert_eq!(h.reloads(), 0);
    }

    #[tokio::test]
    async fn test_initialize_fails_without_script() {
        let h = Harness::new();
        let err = h.manager.initialize().await.unwrap_err();
        assert!(matches!(err, TreadError::Network { .. }));
        assert_eq!(err.category(), "network");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_host_errors_keep_their_category() {
        let quota = host_error("put", ServiceWorkerError::QuotaExceeded { requested: 10, quota: 5 });
        assert_eq!(quota.category(), "cache");
        assert!(!quota.is_retryable());

        let storage = host_error(
            "replay",
            ServiceWorkerError::Storage(tread_storage::StorageError::NotFound("cart".into())),
        );
        assert_eq!(storage.category(), "storage");

        let missing = host_error("update", ServiceWorkerError::NotFound(ORIGIN.into()));
        assert!(matches!(missing, TreadError::NotFound(ref what) if what.contains(ORIGIN)));

        let state = host_error("post", ServiceWorkerError::StateError("no worker".into()));
        assert_eq!(state.category(), "worker");
    }

    #[tokio::test]
    async fn test_detach_disconnects_the_page() {
        let h = Harness::new();
        h.deploy("A").await;
        h.manager.initialize().await.unwrap();
        assert_eq!(h.container.client_urls().await.len(), 1);

        assert!(h.manager.detach().await);
        assert!(h.container.client_urls().await.is_empty());
        assert!(h.manager.client_id().await.is_none());
        assert!(!h.manager.detach().await);
    }

    #[tokio::test]
    async fn test_first_controller_is_not_an_update() {
        let h = Harness::new();
        let mut rx = h.listen();
        h.deploy("A").await;
        h.manager.initialize().await.unwrap();

        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err());
        assert_eq!(h.manager.controller_version().as_deref(), Some("A"));
        assert_eq!(h.manager.loaded_version().as_deref(), Some("A"));
        assert!(!h.manager.check_for_updates().await);
    }

    #[tokio::test]
    async fn test_waiting_worker_is_announced_and_forced() {
        let h = Harness::new();
        h.deploy("A").await;
        h.manager.initialize().await.unwrap();
        let mut rx = h.listen();

        h.deploy("B").await;
        assert!(!h.manager.check_for_updates().await);
        assert_eq!(next(&mut rx).await, "B");
        assert!(h.manager.check_for_updates().await);

        let outcome = h.manager.force_update().await.unwrap();
        assert_eq!(outcome, UpdateOutcome::Reloaded);
        assert_eq!(h.reloads(), 1);
        assert_eq!(h.manager.controller_version().as_deref(), Some("B"));
        assert_eq!(h.manager.loaded_version().as_deref(), Some("B"));

        let names = h.container.caches().read().await.keys();
        assert!(names.iter().all(|n| n.contains("vB")));
    }

    #[tokio::test]
    async fn test_force_update_without_waiting_worker() {
        let h = Harness::new();
        h.deploy("A").await;
        h.manager.initialize().await.unwrap();

        assert_eq!(h.manager.force_update().await.unwrap(), UpdateOutcome::NoUpdate);
        assert_eq!(h.reloads(), 0);
    }

    #[tokio::test]
    async fn test_force_update_after_immediate_activation_reloads() {
        let h = Harness::new();
        h.deploy("A").await;
        h.manager.initialize().await.unwrap();
        let mut rx = h.listen();

        let config = AppConfig {
            skip_waiting_on_install: true,
            ..config("B")
        };
        let script_url = config.script_url().unwrap();
        h.deployment
            .deploy(&script_url, Arc::new(CacheWorker::new(config).unwrap()))
            .await;
        h.manager.check_for_updates().await;
        assert_eq!(next(&mut rx).await, "B");

        assert_eq!(h.manager.force_update().await.unwrap(), UpdateOutcome::Reloaded);
        assert_eq!(h.reloads(), 1);
    }

    #[tokio::test]
    async fn test_force_update_times_out() {
        let h = Harness::new();
        h.deploy("A").await;
        h.manager.initialize().await.unwrap();

        let script_url = h.manager.config().script_url().unwrap();
        h.deployment.deploy(&script_url, Arc::new(Stubborn)).await;
        h.manager.check_for_updates().await;

        let result = h.manager.force_update().await;
        assert!(matches!(result, Err(TreadError::Timeout(_))));
        assert_eq!(h.reloads(), 0);
        assert_eq!(h.manager.controller_version().as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_dismiss_and_resurface() {
        let h = Harness::new();
        h.deploy("A").await;
        h.manager.initialize().await.unwrap();
        let mut rx = h.listen();
        assert!(!h.manager.resurface_update());

        h.deploy("B").await;
        h.manager.check_for_updates().await;
        assert_eq!(next(&mut rx).await, "B");

        assert!(!h.manager.resurface_update());
        h.manager.dismiss_update();
        assert!(h.manager.resurface_update());
        assert_eq!(next(&mut rx).await, "B");
    }

    #[tokio::test]
    async fn test_removed_listener_is_not_called() {
        let h = Harness::new();
        h.deploy("A").await;
        h.manager.initialize().await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = h.manager.on_update_available(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(h.manager.remove_update_listener(id));
        let mut rx = h.listen();

        h.deploy("B").await;
        h.manager.check_for_updates().await;
        assert_eq!(next(&mut rx).await, "B");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_periodic_checks_find_updates() {
        let h = Harness::new();
        h.deploy("A").await;
        h.manager.initialize().await.unwrap();
        let mut rx = h.listen();

        let checks = h.manager.spawn_periodic_checks(Duration::from_millis(20));
        h.deploy("B").await;
        assert_eq!(next(&mut rx).await, "B");
        checks.abort();
    }

    #[tokio::test]
    async fn test_install_status_and_prompt() {
        let h = Harness::with_page(Page {
            standalone: true,
            ..Page::default()
        });
        assert!(h.manager.get_install_status());
        assert!(!Harness::new().manager.get_install_status());

        assert!(!h.manager.can_install());
        assert!(!h.manager.install_app().await);

        h.manager
            .capture_install_prompt(Arc::new(Prompt(InstallChoice::Accepted)));
        assert!(h.manager.can_install());
        assert!(h.manager.install_app().await);
        assert!(!h.manager.can_install());

        h.manager
            .capture_install_prompt(Arc::new(Prompt(InstallChoice::Dismissed)));
        assert!(!h.manager.install_app().await);
    }

    #[tokio::test]
    async fn test_clear_app_data() {
        let h = Harness::new();
        h.deploy("A").await;
        h.manager.initialize().await.unwrap();

        let storage = h.container.storage();
        MutationQueue::new(storage.databases.clone())
            .enqueue(QueuedMutation::new(MutationKind::Cart, "POST", "/api/cart", json!({})))
            .await
            .unwrap();
        storage.local.set("token", "abc").await;

        let cleared = h.manager.clear_app_data().await;
        assert_eq!(cleared.cache_partitions, 1);
        assert_eq!(cleared.databases, 1);
        assert!(h.container.caches().read().await.keys().is_empty());
        assert!(storage.local.is_empty().await);
    }
}
