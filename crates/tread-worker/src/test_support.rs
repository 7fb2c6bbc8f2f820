//! A storefront origin wired to a host, for worker tests.

use std::sync::Arc;

use http::{Method, StatusCode};
use serde_json::json;
use tokio::sync::mpsc;
use tread_core::AppConfig;
use tread_net::{MemoryNetwork, Request, Response};
use tread_sw::{
    ClientEvent, Deployment, RegistrationInfo, RegistrationOptions, ServiceWorkerContainer,
    ServiceWorkerError,
};
use url::Url;

use crate::CacheWorker;

pub(crate) const ORIGIN: &str = "https://shop.example/";

pub(crate) struct Shop {
    pub container: ServiceWorkerContainer,
    pub network: Arc<MemoryNetwork>,
    pub deployment: Arc<Deployment>,
}

impl Shop {
    pub fn new() -> Self {
        let origin = Self::origin();
        let network = Arc::new(MemoryNetwork::new(origin.clone()));
        for page in ["/", "/products", "/cart", "/account"] {
            network.serve_text(page, "text/html", &format!("<html>{page}</html>"));
        }
        network.serve_json("/manifest.json", &json!({"name": "TreadHub"}));
        for icon in ["/icons/icon-192x192.png", "/icons/icon-512x512.png"] {
            network.serve(Method::GET, icon, StatusCode::OK, "image/png", &b"\x89PNG"[..]);
        }
        network.serve_json(
            "/api/products",
            &json!({"products": [{"id": 1, "name": "All-Season 205/55R16"}]}),
        );
        network.serve_json("/api/categories", &json!(["winter", "summer"]));
        network.serve_json("/api/cart", &json!({"items": []}));

        let deployment = Arc::new(Deployment::new());
        let container = ServiceWorkerContainer::new(origin, network.clone(), deployment.clone());
        Self {
            container,
            network,
            deployment,
        }
    }

    pub fn origin() -> Url {
        Url::parse(ORIGIN).unwrap()
    }

    pub fn url(path: &str) -> Url {
        Self::origin().join(path).unwrap()
    }

    pub fn config(generation: &str) -> AppConfig {
        AppConfig {
            origin: Self::origin(),
            ..AppConfig::default()
        }
        .with_generation(generation)
    }

    /// Registration scope of the worker.
    pub fn scope(&self) -> Url {
        Self::origin()
    }

    /// Deploy a generation: register the first one, update to later ones.
    pub async fn deploy(&self, generation: &str) -> Result<RegistrationInfo, ServiceWorkerError> {
        self.deploy_config(Self::config(generation)).await
    }

    pub async fn deploy_config(&self, config: AppConfig) -> Result<RegistrationInfo, ServiceWorkerError> {
        let script_url = config.script_url().unwrap();
        let worker = CacheWorker::new(config).unwrap();
        self.deployment.deploy(&script_url, Arc::new(worker)).await;

        if self.container.get_registration(&self.scope()).await.is_none() {
            return self
                .container
                .register(&script_url, RegistrationOptions::default())
                .await;
        }
        self.container.update(&self.scope()).await?;
        self.container
            .get_registration(&self.scope())
            .await
            .ok_or_else(|| ServiceWorkerError::NotFound("registration".to_string()))
    }

    /// Open a page at the root.
    pub async fn page(&self) -> (String, mpsc::UnboundedReceiver<ClientEvent>) {
        self.container.connect_client(Self::origin()).await
    }

    pub async fn get(&self, client: &str, path: &str) -> Response {
        self.container
            .fetch(Some(client), Request::get(Self::url(path)))
            .await
            .unwrap()
    }

    pub async fn navigate(&self, path: &str) -> Response {
        self.container
            .fetch(None, Request::navigate(Self::url(path)))
            .await
            .unwrap()
    }

    pub async fn cache_names(&self) -> Vec<String> {
        self.container.caches().read().await.keys()
    }
}

pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
