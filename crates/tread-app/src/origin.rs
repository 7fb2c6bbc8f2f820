//! Simulated storefront origin.

use http::{Method, StatusCode};
use serde_json::json;
use tread_core::AppConfig;
use tread_net::MemoryNetwork;

/// Serve the app shell and the storefront API the worker talks to.
pub fn simulated(config: &AppConfig) -> MemoryNetwork {
    let network = MemoryNetwork::new(config.origin.clone());

    for path in &config.static_manifest {
        if path.ends_with(".png") {
            network.serve(Method::GET, path, StatusCode::OK, "image/png", &b"\x89PNG\r\n"[..]);
        } else if path.ends_with(".json") {
            network.serve_json(path, &json!({"name": "TreadHub", "display": "standalone"}));
        } else {
            network.serve_text(
                path,
                "text/html",
                &format!("<!doctype html><title>TreadHub</title><main data-route=\"{path}\"></main>"),
            );
        }
    }

    network.serve_json(
        "/api/products",
        &json!({"products": [
            {"id": 1, "name": "All-Season 205/55R16", "price": 89.0},
            {"id": 2, "name": "Winter Grip 225/45R17", "price": 124.0}
        ]}),
    );
    network.serve_json("/api/categories", &json!(["all-season", "winter", "summer"]));
    network.serve_json("/api/banners", &json!({"banner": "Free fitting this week"}));
    network.serve_json("/api/cart", &json!({"items": []}));
    network.serve(Method::POST, "/api/cart", StatusCode::CREATED, "application/json", "{}");

    network
}
