//! Worker scripts and where the host loads them from.

use std::sync::Arc;

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use crate::events::{EventOutcome, WorkerEvent};
use crate::scope::WorkerScope;
use crate::ServiceWorkerError;

/// Code that runs inside a service worker.
#[async_trait]
pub trait ServiceWorkerScript: Send + Sync {
    /// Version label; two scripts with the same label are the same worker.
    fn version(&self) -> &str;

    /// Handle one event. The host awaits the returned future until it settles.
    async fn handle_event(
        &self,
        event: WorkerEvent,
        scope: &WorkerScope,
    ) -> Result<EventOutcome, ServiceWorkerError>;
}

/// Resolves a script URL to the currently deployed script.
#[async_trait]
pub trait ScriptSource: Send + Sync {
    async fn load(&self, script_url: &Url) -> Result<Arc<dyn ServiceWorkerScript>, ServiceWorkerError>;
}

/// Scripts currently served by the origin.
#[derive(Default)]
pub struct Deployment {
    scripts: RwLock<HashMap<String, Arc<dyn ServiceWorkerScript>>>,
}

impl Deployment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve a script at a URL, replacing whatever was there.
    pub async fn deploy(&self, script_url: &Url, script: Arc<dyn ServiceWorkerScript>) {
        debug!(url = %script_url, version = script.version(), "Script deployed");
        self.scripts
            .write()
            .await
            .insert(script_url.to_string(), script);
    }

    /// Stop serving a script.
    pub async fn withdraw(&self, script_url: &Url) -> bool {
        self.scripts.write().await.remove(script_url.as_str()).is_some()
    }
}

#[async_trait]
impl ScriptSource for Deployment {
    async fn load(&self, script_url: &Url) -> Result<Arc<dyn ServiceWorkerScript>, ServiceWorkerError> {
        self.scripts
            .read()
            .await
            .get(script_url.as_str())
            .cloned()
            .ok_or_else(|| ServiceWorkerError::NetworkError(format!("404 for {script_url}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    #[async_trait]
    impl ServiceWorkerScript for Fixed {
        fn version(&self) -> &str {
            "fixed"
        }

        async fn handle_event(
            &self,
            _event: WorkerEvent,
            _scope: &WorkerScope,
        ) -> Result<EventOutcome, ServiceWorkerError> {
            Ok(EventOutcome::Handled)
        }
    }

    #[tokio::test]
    async fn test_deploy_and_withdraw() {
        let deployment = Deployment::new();
        let url = Url::parse("https://shop.example/sw.js").unwrap();

        assert!(deployment.load(&url).await.is_err());

        deployment.deploy(&url, Arc::new(Fixed)).await;
        assert_eq!(deployment.load(&url).await.unwrap().version(), "fixed");

        assert!(deployment.withdraw(&url).await);
        assert!(matches!(
            deployment.load(&url).await,
            Err(ServiceWorkerError::NetworkError(_))
        ));
    }
}
