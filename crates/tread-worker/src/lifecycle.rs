//! Install and activate handlers.

use futures::future::join_all;
use tracing::{debug, info, warn};
use tread_core::WorkerMessage;
use tread_net::Request;
use tread_sw::{EventOutcome, ServiceWorkerError, WorkerScope};

use crate::CacheWorker;

impl CacheWorker {
    /// Pre-cache the static manifest. Any missing asset fails the install and
    /// removes the partially filled partition.
    pub(crate) async fn on_install(&self, scope: &WorkerScope) -> Result<EventOutcome, ServiceWorkerError> {
        info!(
            generation = %self.config.generation,
            assets = self.config.static_manifest.len(),
            "Pre-caching static manifest"
        );

        let requests = self
            .config
            .static_manifest
            .iter()
            .map(|path| {
                self.config
                    .resolve(path)
                    .map(Request::get)
                    .map_err(|e| ServiceWorkerError::InstallFailed(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let responses = join_all(requests.iter().cloned().map(|r| scope.fetch(r))).await;

        if let Err(e) = self.store_manifest(scope, &requests, responses).await {
            warn!(generation = %self.config.generation, error = %e, "Install failed");
            scope.caches().write().await.delete(&self.static_cache);
            return Err(e);
        }

        if self.config.skip_waiting_on_install {
            scope.skip_waiting();
        }
        Ok(EventOutcome::Handled)
    }

    async fn store_manifest(
        &self,
        scope: &WorkerScope,
        requests: &[Request],
        responses: Vec<Result<tread_net::Response, tread_net::NetError>>,
    ) -> Result<(), ServiceWorkerError> {
        for (request, response) in requests.iter().zip(responses) {
            let response = response?;
            if !response.ok() {
                return Err(ServiceWorkerError::InstallFailed(format!(
                    "{} answered {}",
                    request.url, response.status
                )));
            }
            scope
                .caches()
                .write()
                .await
                .put(&self.static_cache, request, &response)?;
            debug!(url = %request.url, "Pre-cached");
        }
        Ok(())
    }

    /// Drop partitions of other generations, take over every page and
    /// announce the new generation.
    pub(crate) async fn on_activate(&self, scope: &WorkerScope) -> Result<EventOutcome, ServiceWorkerError> {
        let stale: Vec<String> = {
            let mut caches = scope.caches().write().await;
            let stale: Vec<String> = caches
                .keys()
                .into_iter()
                .filter(|name| !self.config.is_current_partition(name))
                .collect();
            for name in &stale {
                caches.delete(name);
            }
            stale
        };
        if !stale.is_empty() {
            info!(deleted = ?stale, "Removed stale cache partitions");
        }

        let claimed = scope.claim().await;

        let announcement = WorkerMessage::SwUpdated {
            version: self.config.generation.clone(),
            timestamp: self.timestamp(),
        }
        .to_value();
        let pages = scope.match_all(true).await;
        for client in &pages {
            if let Err(e) = scope.post_message(client, announcement.clone()).await {
                warn!(client = %client, error = %e, "Failed to announce update");
            }
        }

        info!(
            generation = %self.config.generation,
            claimed,
            notified = pages.len(),
            "Worker activated"
        );
        Ok(EventOutcome::Handled)
    }
}
