//! Clients API: the pages of the origin and what they observe.

use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::trace;
use url::Url;

use crate::lifecycle::{ServiceWorkerId, ServiceWorkerState};
use crate::ServiceWorkerError;

/// Something a page observes from its service worker container.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// A worker posted a message to this page.
    Message {
        source: ServiceWorkerId,
        data: JsonValue,
    },
    /// The page's controller changed.
    ControllerChange {
        controller: ServiceWorkerId,
        version: String,
    },
    /// A worker of the registration changed state.
    StateChange {
        worker: ServiceWorkerId,
        version: String,
        state: ServiceWorkerState,
    },
    /// A new worker started installing.
    UpdateFound { scope: Url },
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    All,
}

/// A client (page).
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Whether focused.
    pub focused: bool,

    /// Controlling worker.
    pub controller: Option<ServiceWorkerId>,

    /// Delivery channel; absent for windows the worker opened itself.
    sender: Option<mpsc::UnboundedSender<ClientEvent>>,
}

impl Client {
    fn new(url: Url, sender: Option<mpsc::UnboundedSender<ClientEvent>>) -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self {
            id: format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed)),
            url,
            client_type: ClientType::Window,
            focused: true,
            controller: None,
            sender,
        }
    }

    /// Whether the page sits inside a registration scope.
    pub fn in_scope(&self, scope: &Url) -> bool {
        self.url.as_str().starts_with(scope.as_str())
    }

    fn deliver(&self, event: ClientEvent) {
        if let Some(sender) = &self.sender {
            if sender.send(event).is_err() {
                trace!(client = %self.id, "Client receiver dropped");
            }
        }
    }

    /// Focus the client.
    pub fn focus(&mut self) -> Result<(), ServiceWorkerError> {
        if self.client_type != ClientType::Window {
            return Err(ServiceWorkerError::StateError(
                "Can only focus window clients".to_string(),
            ));
        }
        self.focused = true;
        Ok(())
    }
}

/// Options for `match_all`.
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

// ==================== Clients ====================

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a page. Returns its id and the receiver for its events.
    pub fn connect(
        &mut self,
        url: Url,
        controller: Option<ServiceWorkerId>,
    ) -> (String, mpsc::UnboundedReceiver<ClientEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut client = Client::new(url, Some(tx));
        client.controller = controller;
        let id = client.id.clone();
        self.clients.insert(id.clone(), client);
        (id, rx)
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Match clients for a worker.
    pub fn match_all(&self, options: &ClientMatchOptions, worker: ServiceWorkerId) -> Vec<&Client> {
        let mut matched: Vec<&Client> = self
            .clients
            .values()
            .filter(|c| options.include_uncontrolled || c.controller == Some(worker))
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    /// Ids of clients controlled by a worker.
    pub fn controlled_by(&self, worker: ServiceWorkerId) -> Vec<String> {
        self.clients
            .values()
            .filter(|c| c.controller == Some(worker))
            .map(|c| c.id.clone())
            .collect()
    }

    /// Open a window. The worker gets no channel to it.
    pub fn open_window(&mut self, url: Url) -> Client {
        let client = Client::new(url, None);
        self.clients.insert(client.id.clone(), client.clone());
        client
    }

    /// Make `worker` the controller of every in-scope client it does not
    /// control yet. Returns the claimed ids.
    pub fn claim(&mut self, worker: ServiceWorkerId, version: &str, scope: &Url) -> Vec<String> {
        let mut claimed = Vec::new();
        for client in self.clients.values_mut() {
            if client.in_scope(scope) && client.controller != Some(worker) {
                client.controller = Some(worker);
                client.deliver(ClientEvent::ControllerChange {
                    controller: worker,
                    version: version.to_string(),
                });
                claimed.push(client.id.clone());
            }
        }
        claimed
    }

    /// Move clients from a retired controller to its successor.
    pub fn hand_over(&mut self, from: ServiceWorkerId, to: ServiceWorkerId, version: &str) -> usize {
        let mut moved = 0;
        for client in self.clients.values_mut() {
            if client.controller == Some(from) {
                client.controller = Some(to);
                client.deliver(ClientEvent::ControllerChange {
                    controller: to,
                    version: version.to_string(),
                });
                moved += 1;
            }
        }
        moved
    }

    /// Post a message to one client.
    pub fn post_message(
        &self,
        id: &str,
        source: ServiceWorkerId,
        data: JsonValue,
    ) -> Result<(), ServiceWorkerError> {
        let client = self
            .clients
            .get(id)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {id}")))?;
        client.deliver(ClientEvent::Message { source, data });
        Ok(())
    }

    /// Deliver a registration event to every client in scope.
    pub fn broadcast(&self, scope: &Url, event: ClientEvent) {
        for client in self.clients.values().filter(|c| c.in_scope(scope)) {
            client.deliver(event.clone());
        }
    }
}
