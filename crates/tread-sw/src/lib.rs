//! # TreadCache Service Worker Host
//!
//! Host runtime that runs a service worker script for one origin.
//!
//! ## Features
//!
//! - **Registration**: register, update, unregister
//! - **Lifecycle**: install, waiting, activate, redundant
//! - **Cache API**: named partitions with an optional byte quota
//! - **Clients API**: pages, controllers, claim, message delivery
//! - **Functional events**: fetch, message, sync, push, notification click
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerContainer (one per origin)
//!     │
//!     ├── ServiceWorkerRegistration
//!     │       ├── installing (ServiceWorker)
//!     │       ├── waiting (ServiceWorker)
//!     │       └── active (ServiceWorker) ──► ServiceWorkerScript + WorkerScope
//!     │
//!     ├── CacheStorage ── Cache ── Request → CacheEntry
//!     ├── Clients ── Client ──► mpsc::UnboundedSender<ClientEvent>
//!     ├── NotificationCenter
//!     └── OriginStorage (databases, local storage)
//! ```
//!
//! The host never holds a lock while a worker handles an event. Every
//! dispatch is awaited until the handler settles.

use thiserror::Error;
use tread_storage::StorageError;

pub mod cache;
pub mod clients;
pub mod container;
pub mod events;
pub mod lifecycle;
pub mod notifications;
pub mod scope;
pub mod script;

pub use cache::{Cache, CacheEntry, CacheStorage, SharedCacheStorage};
pub use clients::{Client, ClientEvent, ClientMatchOptions, ClientType, Clients};
pub use container::{RegistrationOptions, ServiceWorkerContainer};
pub use events::{
    EventOutcome, FetchEvent, MessageEvent, NotificationClickEvent, PushEvent, SyncEvent,
    WorkerEvent,
};
pub use lifecycle::{
    RegistrationInfo, ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration,
    ServiceWorkerState, WorkerInfo, WorkerSlot,
};
pub use notifications::{Notification, NotificationActionButton, NotificationCenter, NotificationOptions};
pub use scope::WorkerScope;
pub use script::{Deployment, ScriptSource, ServiceWorkerScript};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Script error: {0}")]
    ScriptError(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Quota exceeded: {requested} bytes requested, quota is {quota}")]
    QuotaExceeded { requested: usize, quota: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ServiceWorkerError {
    /// Whether the failure came from cache writes.
    pub fn is_cache_failure(&self) -> bool {
        matches!(self, Self::CacheError(_) | Self::QuotaExceeded { .. })
    }
}

impl From<tread_net::NetError> for ServiceWorkerError {
    fn from(err: tread_net::NetError) -> Self {
        Self::NetworkError(err.to_string())
    }
}
