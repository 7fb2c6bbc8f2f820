//! Page event pump.
//!
//! Reads the events the host delivers to the page and turns them into the
//! manager's view: which generation controls the page and whether an update
//! is available.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use tread_core::WorkerMessage;
use tread_sw::{ClientEvent, ServiceWorkerState};

use crate::listeners::{Listeners, UpdateInfo};

/// What the page knows about its generations.
#[derive(Debug, Default)]
pub(crate) struct PageState {
    /// Generation the running assets belong to.
    pub loaded: Option<String>,
    /// Update announced to listeners and not yet applied by a reload.
    pub pending: Option<String>,
    pub dismissed: bool,
}

pub(crate) struct Pump {
    pub state: Arc<Mutex<PageState>>,
    pub listeners: Arc<Listeners>,
    pub controller: Arc<watch::Sender<Option<String>>>,
}

impl Pump {
    pub fn spawn(self, mut events: mpsc::UnboundedReceiver<ClientEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.handle(event);
            }
            debug!("Page event pump stopped");
        })
    }

    fn handle(&self, event: ClientEvent) {
        match event {
            ClientEvent::ControllerChange { version, .. } => {
                debug!(version = %version, "Controller changed");
                {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    // An uncontrolled page adopts its first controller as is.
                    if state.loaded.is_none() {
                        state.loaded = Some(version.clone());
                    }
                }
                self.controller.send_replace(Some(version));
            }
            ClientEvent::StateChange {
                version,
                state: ServiceWorkerState::Installed,
                ..
            } => {
                if self.controller.borrow().is_some() {
                    self.announce(version);
                }
            }
            ClientEvent::StateChange {
                version,
                state: ServiceWorkerState::Redundant,
                ..
            } => {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let controlling = self.controller.borrow().as_deref() == Some(version.as_str());
                if state.pending.as_deref() == Some(version.as_str()) && !controlling {
                    debug!(version = %version, "Pending update became redundant");
                    state.pending = None;
                }
            }
            ClientEvent::Message { data, .. } => match WorkerMessage::from_value(&data) {
                Some(WorkerMessage::SwUpdated { version, .. }) => {
                    let loaded = self
                        .state
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .loaded
                        .clone();
                    if loaded.is_some_and(|loaded| loaded != version) {
                        self.announce(version);
                    }
                }
                Some(WorkerMessage::Version { version, .. }) => {
                    debug!(version = %version, "Worker reported its version");
                }
                None => debug!(data = %data, "Ignoring worker message"),
            },
            ClientEvent::UpdateFound { scope } => debug!(scope = %scope, "Update found"),
            ClientEvent::StateChange { .. } => {}
        }
    }

    fn announce(&self, version: String) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            // The running generation is never an update, even when reinstalled.
            if state.loaded.as_deref() == Some(version.as_str())
                || state.pending.as_deref() == Some(version.as_str())
            {
                return;
            }
            state.pending = Some(version.clone());
            state.dismissed = false;
        }
        let notified = self.listeners.fire(&UpdateInfo {
            version: version.clone(),
        });
        info!(version = %version, notified, "Update available");
    }
}
