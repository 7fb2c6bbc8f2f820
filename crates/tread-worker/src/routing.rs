//! Request classification.

use http::Method;
use regex::Regex;
use tread_common::Result;
use tread_core::AppConfig;
use tread_net::Request;

/// Which caching policy applies to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteClass {
    /// Not intercepted: non-GET or non-http(s).
    Passthrough,
    /// Network-first, cached for offline reads.
    CacheableApi,
    /// Network-only API call.
    NetworkOnlyApi,
    /// Cache-first for documents and assets.
    Static,
}

/// Maps requests to a [`RouteClass`].
#[derive(Debug, Clone)]
pub struct Router {
    cacheable: Vec<Regex>,
    api_prefix: String,
}

impl Router {
    pub fn new(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            cacheable: config.compiled_api_patterns()?,
            api_prefix: config.api_prefix.clone(),
        })
    }

    pub fn classify(&self, request: &Request) -> RouteClass {
        if request.method != Method::GET || !request.is_http() {
            return RouteClass::Passthrough;
        }

        let path = request.url.path();
        if self.cacheable.iter().any(|re| re.is_match(path)) {
            RouteClass::CacheableApi
        } else if path.starts_with(&self.api_prefix) {
            RouteClass::NetworkOnlyApi
        } else {
            RouteClass::Static
        }
    }
}
