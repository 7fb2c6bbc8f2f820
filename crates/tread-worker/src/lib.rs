//! # TreadCache Worker
//!
//! The storefront's cache worker. It pre-caches the app shell at install,
//! drops partitions of older generations at activation, routes fetches
//! through the cache policies, replays offline cart and wishlist writes on
//! background sync and turns push messages into notifications.
//!
//! ## Fetch policies
//!
//! | request | policy |
//! |---|---|
//! | cacheable API GET | network-first, cached copy tagged `offline: true` |
//! | other API GET | network-only, 503 `offline: true` on failure |
//! | anything else GET | cache-first, then network, then offline fallback |
//! | non-GET, non-http(s) | not intercepted |

use async_trait::async_trait;
use tracing::{debug, warn};
use tread_core::{AppConfig, PageMessage, WorkerMessage};
use tread_sw::{
    EventOutcome, MessageEvent, ServiceWorkerError, ServiceWorkerScript, WorkerEvent, WorkerScope,
};

mod fetch;
mod lifecycle;
mod notify;
pub mod routing;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use routing::{RouteClass, Router};
pub use sync::ReplayReport;

/// The storefront cache worker for one generation.
#[derive(Debug, Clone)]
pub struct CacheWorker {
    config: AppConfig,
    router: Router,
    static_cache: String,
    dynamic_cache: String,
}

impl CacheWorker {
    pub fn new(config: AppConfig) -> tread_common::Result<Self> {
        config.validate()?;
        Ok(Self {
            router: Router::new(&config)?,
            static_cache: config.static_cache_name(),
            dynamic_cache: config.dynamic_cache_name(),
            config,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn static_cache(&self) -> &str {
        &self.static_cache
    }

    pub fn dynamic_cache(&self) -> &str {
        &self.dynamic_cache
    }

    fn timestamp(&self) -> String {
        self.config.build_timestamp.to_rfc3339()
    }

    async fn on_message(
        &self,
        event: MessageEvent,
        scope: &WorkerScope,
    ) -> Result<EventOutcome, ServiceWorkerError> {
        match PageMessage::from_value(&event.data) {
            Some(PageMessage::SkipWaiting) => scope.skip_waiting(),
            Some(PageMessage::GetVersion) => match event.source {
                Some(client) => {
                    let reply = WorkerMessage::Version {
                        version: self.config.generation.clone(),
                        timestamp: self.timestamp(),
                    };
                    scope.post_message(&client, reply.to_value()).await?;
                }
                None => warn!("GET_VERSION without a client to answer"),
            },
            None => debug!(data = %event.data, "Ignoring unknown message"),
        }
        Ok(EventOutcome::Handled)
    }
}

#[async_trait]
impl ServiceWorkerScript for CacheWorker {
    fn version(&self) -> &str {
        &self.config.generation
    }

    async fn handle_event(
        &self,
        event: WorkerEvent,
        scope: &WorkerScope,
    ) -> Result<EventOutcome, ServiceWorkerError> {
        match event {
            WorkerEvent::Install => self.on_install(scope).await,
            WorkerEvent::Activate => self.on_activate(scope).await,
            WorkerEvent::Fetch(event) => self.on_fetch(event, scope).await,
            WorkerEvent::Message(event) => self.on_message(event, scope).await,
            WorkerEvent::Sync(event) => self.on_sync(event, scope).await,
            WorkerEvent::Push(event) => self.on_push(event, scope).await,
            WorkerEvent::NotificationClick(event) => self.on_notification_click(event, scope).await,
        }
    }
}
