//! Storefront offline configuration

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use tread_common::{Result, TreadError};
use url::Url;

/// Environment variable overriding the cache generation.
pub const GENERATION_ENV: &str = "TREAD_GENERATION";

/// Environment variable overriding the served origin.
pub const ORIGIN_ENV: &str = "TREAD_ORIGIN";

/// Offline controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Prefix of every cache partition name
    pub app_name: String,

    /// Origin the worker is registered for
    pub origin: Url,

    /// Worker script path, registered at root scope
    pub script_path: String,

    /// Deployment identifier; partitions of other generations are garbage
    pub generation: String,

    /// Build time announced to pages alongside the generation
    pub build_timestamp: DateTime<Utc>,

    /// Shell routes and icons pre-cached at install
    pub static_manifest: Vec<String>,

    /// Path regexes served network-first and cached for offline reads
    pub cacheable_api_patterns: Vec<String>,

    /// Everything under this prefix that is not cacheable is network-only
    pub api_prefix: String,

    /// Document served to navigations when both network and cache miss
    pub offline_document: String,

    /// Page opened by the "explore" notification action
    pub explore_path: String,

    /// Activate a freshly installed worker without waiting for tabs to close
    pub skip_waiting_on_install: bool,

    /// Upper bound on the skip-waiting/reload handshake, in milliseconds
    pub update_timeout_ms: u64,

    /// Interval between background update checks, in seconds
    pub update_check_interval_secs: u64,

    /// Notification defaults for push events
    pub push: PushDefaults,
}

/// Notification fields used when a push carries no override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushDefaults {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,
    pub vibrate: Vec<u32>,
    pub data: serde_json::Value,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: "treadhub".to_string(),
            origin: Url::parse("http://localhost:3000/").expect("static origin is valid"),
            script_path: "/sw.js".to_string(),
            generation: default_generation(),
            build_timestamp: Utc::now(),
            static_manifest: vec![
                "/".to_string(),
                "/products".to_string(),
                "/cart".to_string(),
                "/account".to_string(),
                "/manifest.json".to_string(),
                "/icons/icon-192x192.png".to_string(),
                "/icons/icon-512x512.png".to_string(),
            ],
            cacheable_api_patterns: vec![
                r"^/api/products".to_string(),
                r"^/api/categories".to_string(),
                r"^/api/banners".to_string(),
            ],
            api_prefix: "/api/".to_string(),
            offline_document: "/".to_string(),
            explore_path: "/products".to_string(),
            skip_waiting_on_install: true,
            update_timeout_ms: 10_000,
            update_check_interval_secs: 60 * 60,
            push: PushDefaults::default(),
        }
    }
}

impl Default for PushDefaults {
    fn default() -> Self {
        Self {
            title: "TreadHub".to_string(),
            body: "New tire deals are waiting for you".to_string(),
            icon: "/icons/icon-192x192.png".to_string(),
            badge: "/icons/icon-72x72.png".to_string(),
            vibrate: vec![100, 50, 100],
            data: serde_json::json!({ "primaryKey": 1 }),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: AppConfig = serde_json::from_str(&raw).map_err(|e| {
            TreadError::config_with_source(format!("invalid config {}", path.display()), e)
        })?;
        config.apply_env()?;
        config.validate()?;
        info!(
            path = %path.display(),
            generation = %config.generation,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Apply `TREAD_GENERATION` and `TREAD_ORIGIN` when set.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(generation) = std::env::var(GENERATION_ENV) {
            debug!(%generation, "Generation overridden from environment");
            self.generation = generation;
        }
        if let Ok(origin) = std::env::var(ORIGIN_ENV) {
            self.origin = Url::parse(&origin)
                .map_err(|e| TreadError::config_with_source("invalid TREAD_ORIGIN", e))?;
        }
        Ok(())
    }

    /// Check invariants the worker relies on.
    pub fn validate(&self) -> Result<()> {
        if self.app_name.is_empty() {
            return Err(TreadError::config("app_name must not be empty"));
        }
        if self.generation.is_empty() {
            return Err(TreadError::config("generation must not be empty"));
        }
        if !matches!(self.origin.scheme(), "http" | "https") {
            return Err(TreadError::config(format!(
                "origin must be http(s), got {}",
                self.origin.scheme()
            )));
        }
        if !self.api_prefix.starts_with('/') {
            return Err(TreadError::config("api_prefix must start with '/'"));
        }
        if let Some(bad) = self.static_manifest.iter().find(|p| !p.starts_with('/')) {
            return Err(TreadError::config(format!(
                "static manifest entry must be a root-relative path: {bad}"
            )));
        }
        self.compiled_api_patterns()?;
        Ok(())
    }

    /// Compile the cacheable API patterns.
    pub fn compiled_api_patterns(&self) -> Result<Vec<Regex>> {
        self.cacheable_api_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    TreadError::config_with_source(format!("invalid API pattern {p}"), e)
                })
            })
            .collect()
    }

    /// Name of the static partition for the current generation.
    pub fn static_cache_name(&self) -> String {
        format!("{}-static-v{}", self.app_name, self.generation)
    }

    /// Name of the dynamic partition for the current generation.
    pub fn dynamic_cache_name(&self) -> String {
        format!("{}-dynamic-v{}", self.app_name, self.generation)
    }

    /// Whether a partition belongs to the live generation.
    pub fn is_current_partition(&self, name: &str) -> bool {
        name.contains(&self.generation)
    }

    /// Absolute URL of the worker script.
    pub fn script_url(&self) -> Result<Url> {
        self.resolve(&self.script_path)
    }

    /// Resolve a root-relative path against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url> {
        self.origin
            .join(path)
            .map_err(|e| TreadError::config_with_source(format!("cannot resolve {path}"), e))
    }

    /// Bound on the update handshake.
    pub fn update_timeout(&self) -> Duration {
        Duration::from_millis(self.update_timeout_ms)
    }

    /// Interval between periodic update checks.
    pub fn update_check_interval(&self) -> Duration {
        Duration::from_secs(self.update_check_interval_secs)
    }

    /// Same configuration deployed as another generation.
    pub fn with_generation(mut self, generation: impl Into<String>) -> Self {
        self.generation = generation.into();
        self.build_timestamp = Utc::now();
        self
    }
}

/// Generation derived from the environment or the current UTC time.
fn default_generation() -> String {
    std::env::var(GENERATION_ENV).unwrap_or_else(|_| Utc::now().format("%Y%m%d%H%M%S").to_string())
}
