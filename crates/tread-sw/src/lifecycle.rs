//! Worker identity, states and the registration slot machine.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::scope::WorkerScope;
use crate::script::ServiceWorkerScript;

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Initial state, script loaded.
    #[default]
    Parsed,
    /// Installing (install event).
    Installing,
    /// Installed but waiting for activation.
    Installed,
    /// Activating (activate event).
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Redundant (replaced or install failed).
    Redundant,
}

/// Registration slot a worker occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSlot {
    Installing,
    Waiting,
    Active,
}

// ==================== Service Worker ====================

/// A service worker instance.
#[derive(Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Script URL.
    pub script_url: Url,

    /// Current state.
    pub state: ServiceWorkerState,

    /// Loaded script.
    pub script: Arc<dyn ServiceWorkerScript>,

    /// Capabilities handed to the script.
    pub scope: Arc<WorkerScope>,

    /// Error message if failed.
    pub error: Option<String>,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id)
            .field("script_url", &self.script_url.as_str())
            .field("version", &self.version())
            .field("state", &self.state)
            .field("error", &self.error)
            .finish()
    }
}

impl ServiceWorker {
    /// Create a new service worker.
    pub fn new(
        id: ServiceWorkerId,
        script_url: Url,
        script: Arc<dyn ServiceWorkerScript>,
        scope: Arc<WorkerScope>,
    ) -> Self {
        Self {
            id,
            script_url,
            state: ServiceWorkerState::Parsed,
            script,
            scope,
            error: None,
            state_changed_at: Instant::now(),
        }
    }

    /// Version label of the loaded script.
    pub fn version(&self) -> &str {
        self.script.version()
    }

    /// Set state.
    pub fn set_state(&mut self, state: ServiceWorkerState) {
        self.state = state;
        self.state_changed_at = Instant::now();
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }

    /// Snapshot for observers.
    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            version: self.version().to_string(),
            state: self.state,
            script_url: self.script_url.clone(),
        }
    }
}

/// What a page can see of a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: ServiceWorkerId,
    pub version: String,
    pub state: ServiceWorkerState,
    pub script_url: Url,
}

/// What a page can see of a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationInfo {
    pub scope: Url,
    pub installing: Option<WorkerInfo>,
    pub waiting: Option<WorkerInfo>,
    pub active: Option<WorkerInfo>,
}

// ==================== Registration ====================

/// A service worker registration.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    /// Installing worker.
    pub installing: Option<ServiceWorker>,

    /// Waiting worker (installed but not active).
    pub waiting: Option<ServiceWorker>,

    /// Active worker.
    pub active: Option<ServiceWorker>,

    /// Last update check time.
    pub last_update_check: Option<Instant>,
}

impl ServiceWorkerRegistration {
    /// Create a new registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            last_update_check: None,
        }
    }

    /// Get the active worker.
    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// The most recent worker: installing, else waiting, else active.
    pub fn newest_worker(&self) -> Option<&ServiceWorker> {
        self.installing
            .as_ref()
            .or(self.waiting.as_ref())
            .or(self.active.as_ref())
    }

    /// Find a worker by id in any slot.
    pub fn worker(&self, id: ServiceWorkerId) -> Option<&ServiceWorker> {
        [&self.installing, &self.waiting, &self.active]
            .into_iter()
            .flatten()
            .find(|w| w.id == id)
    }

    /// Worker in a slot.
    pub fn slot(&self, slot: WorkerSlot) -> Option<&ServiceWorker> {
        match slot {
            WorkerSlot::Installing => self.installing.as_ref(),
            WorkerSlot::Waiting => self.waiting.as_ref(),
            WorkerSlot::Active => self.active.as_ref(),
        }
    }

    /// Check if update is needed.
    pub fn needs_update(&self, check_interval: Duration) -> bool {
        match self.last_update_check {
            Some(last) => last.elapsed() > check_interval,
            None => true,
        }
    }

    /// Put a worker in the installing slot. Returns a displaced installer.
    pub fn start_install(&mut self, mut worker: ServiceWorker) -> Option<ServiceWorker> {
        worker.set_state(ServiceWorkerState::Installing);
        self.last_update_check = Some(Instant::now());
        let displaced = self.installing.replace(worker);
        displaced.map(|mut w| {
            w.set_state(ServiceWorkerState::Redundant);
            w
        })
    }

    /// Transition installing to waiting. Returns a displaced waiting worker.
    pub fn install_complete(&mut self) -> Option<ServiceWorker> {
        let mut worker = self.installing.take()?;
        worker.set_state(ServiceWorkerState::Installed);
        let displaced = self.waiting.replace(worker);
        displaced.map(|mut w| {
            w.set_state(ServiceWorkerState::Redundant);
            w
        })
    }

    /// Discard the installing worker after a failed install.
    pub fn install_failed(&mut self, error: &str) -> Option<ServiceWorker> {
        let mut worker = self.installing.take()?;
        worker.set_state(ServiceWorkerState::Redundant);
        worker.error = Some(error.to_string());
        Some(worker)
    }

    /// Promote the waiting worker to active in the `Activating` state.
    /// Returns the new worker and the retired one, if any.
    pub fn begin_activation(&mut self) -> Option<(ServiceWorker, Option<ServiceWorker>)> {
        let mut worker = self.waiting.take()?;
        worker.set_state(ServiceWorkerState::Activating);

        let retired = self.active.take().map(|mut old| {
            old.set_state(ServiceWorkerState::Redundant);
            old
        });

        self.active = Some(worker.clone());
        Some((worker, retired))
    }

    /// Mark the active worker activated once its activate event settled.
    pub fn finish_activation(&mut self, id: ServiceWorkerId) -> Option<&ServiceWorker> {
        let active = self.active.as_mut().filter(|w| w.id == id)?;
        active.set_state(ServiceWorkerState::Activated);
        Some(active)
    }

    /// Whether nothing usable is left.
    pub fn is_empty(&self) -> bool {
        self.installing.is_none() && self.waiting.is_none() && self.active.is_none()
    }

    /// Unregister. Returns every worker made redundant.
    pub fn unregister(&mut self) -> Vec<ServiceWorker> {
        [self.installing.take(), self.waiting.take(), self.active.take()]
            .into_iter()
            .flatten()
            .map(|mut w| {
                w.set_state(ServiceWorkerState::Redundant);
                w
            })
            .collect()
    }

    /// Snapshot for observers.
    pub fn info(&self) -> RegistrationInfo {
        RegistrationInfo {
            scope: self.scope.clone(),
            installing: self.installing.as_ref().map(ServiceWorker::info),
            waiting: self.waiting.as_ref().map(ServiceWorker::info),
            active: self.active.as_ref().map(ServiceWorker::info),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventOutcome, WorkerEvent};
    use crate::ServiceWorkerError;
    use async_trait::async_trait;

    struct Noop(&'static str);

    #[async_trait]
    impl ServiceWorkerScript for Noop {
        fn version(&self) -> &str {
            self.0
        }

        async fn handle_event(
            &self,
            _event: WorkerEvent,
            _scope: &WorkerScope,
        ) -> Result<EventOutcome, ServiceWorkerError> {
            Ok(EventOutcome::Handled)
        }
    }

    fn worker(version: &'static str) -> ServiceWorker {
        let id = ServiceWorkerId::new();
        let scope = Arc::new(WorkerScope::detached(id, version));
        ServiceWorker::new(
            id,
            Url::parse("https://shop.example/sw.js").unwrap(),
            Arc::new(Noop(version)),
            scope,
        )
    }

    fn registration() -> ServiceWorkerRegistration {
        ServiceWorkerRegistration::new(Url::parse("https://shop.example/").unwrap())
    }

    #[test]
    fn test_service_worker_creation() {
        let w = worker("v1");
        assert_eq!(w.state, ServiceWorkerState::Parsed);
        assert_eq!(w.version(), "v1");
        assert!(!w.is_active());
        assert!(!w.is_redundant());
    }

    #[test]
    fn test_registration_lifecycle() {
        let mut reg = registration();
        assert!(reg.needs_update(Duration::from_secs(60)));

        assert!(reg.start_install(worker("v1")).is_none());
        assert_eq!(reg.installing.as_ref().unwrap().state, ServiceWorkerState::Installing);
        assert!(!reg.needs_update(Duration::from_secs(60)));

        assert!(reg.install_complete().is_none());
        assert!(reg.installing.is_none());
        assert_eq!(reg.waiting.as_ref().unwrap().state, ServiceWorkerState::Installed);

        let (new, retired) = reg.begin_activation().unwrap();
        assert!(retired.is_none());
        assert_eq!(new.state, ServiceWorkerState::Activating);
        assert!(reg.finish_activation(new.id).unwrap().is_active());
        assert!(reg.waiting.is_none());
    }

    #[test]
    fn test_activation_retires_previous_worker() {
        let mut reg = registration();
        reg.start_install(worker("v1"));
        reg.install_complete();
        let (first, _) = reg.begin_activation().unwrap();
        reg.finish_activation(first.id);

        reg.start_install(worker("v2"));
        reg.install_complete();
        assert_eq!(reg.newest_worker().unwrap().version(), "v2");

        let (second, retired) = reg.begin_activation().unwrap();
        let retired = retired.unwrap();
        assert_eq!(retired.id, first.id);
        assert!(retired.is_redundant());
        assert_eq!(reg.get_active().unwrap().id, second.id);

        // Stale ids do not flip the new worker's state.
        assert!(reg.finish_activation(first.id).is_none());
    }

    #[test]
    fn test_install_failure_leaves_no_worker() {
        let mut reg = registration();
        reg.start_install(worker("v1"));
        let failed = reg.install_failed("asset missing").unwrap();

        assert!(failed.is_redundant());
        assert_eq!(failed.error.as_deref(), Some("asset missing"));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_newer_waiting_worker_displaces_older() {
        let mut reg = registration();
        reg.start_install(worker("v1"));
        reg.install_complete();
        reg.start_install(worker("v2"));

        let displaced = reg.install_complete().unwrap();
        assert_eq!(displaced.version(), "v1");
        assert!(displaced.is_redundant());
        assert_eq!(reg.slot(WorkerSlot::Waiting).unwrap().version(), "v2");
    }

    #[test]
    fn test_unregister_makes_everything_redundant() {
        let mut reg = registration();
        reg.start_install(worker("v1"));
        reg.install_complete();
        reg.begin_activation();
        reg.start_install(worker("v2"));

        let retired = reg.unregister();
        assert_eq!(retired.len(), 2);
        assert!(retired.iter().all(ServiceWorker::is_redundant));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_registration_info() {
        let mut reg = registration();
        reg.start_install(worker("v1"));
        let info = reg.info();
        assert_eq!(info.installing.unwrap().version, "v1");
        assert!(info.active.is_none());
    }
}
