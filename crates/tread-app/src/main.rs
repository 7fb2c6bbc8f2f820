//! TreadCache harness
//!
//! Drives the storefront cache worker through a full session: registration
//! and pre-caching, online and offline fetches, background sync, a push
//! notification and a generation update with the skip-waiting handshake.
//! Prints a JSON report on stdout.
//!
//! By default the origin is simulated in memory. `--origin <url>` runs the
//! online part of the session against a live server instead.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tracing::{error, info};
use tread_common::{init_logging, LogConfig, LogFormat};
use tread_core::AppConfig;
use tread_net::{Fetcher, HttpFetcher, LoaderConfig, Request, Response};
use tread_sw::{Deployment, ServiceWorkerContainer};
use tread_update::{DisplayMode, PageEnvironment, UpdateManager, UpdateOutcome};
use tread_worker::CacheWorker;
use url::Url;

mod origin;

/// Parse command line arguments
struct Args {
    config: Option<PathBuf>,
    origin: Option<Url>,
    generation: Option<String>,
    log_format: LogFormat,
    log_filter: Option<String>,
    verbosity: u8,
    output: Option<PathBuf>,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self {
            config: None,
            origin: None,
            generation: None,
            log_format: LogFormat::Compact,
            log_filter: None,
            verbosity: 0,
            output: None,
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => parsed.config = args.next().map(PathBuf::from),
                "--origin" => {
                    let value = args.next().context("--origin needs a URL")?;
                    parsed.origin =
                        Some(Url::parse(&value).with_context(|| format!("invalid origin {value}"))?);
                }
                "--simulate" => parsed.origin = None,
                "--generation" => parsed.generation = args.next(),
                "--log-format" => {
                    let value = args.next().context("--log-format needs a value")?;
                    parsed.log_format = value.parse()?;
                }
                "--log-filter" => parsed.log_filter = args.next(),
                "--verbose" | "-v" => parsed.verbosity = parsed.verbosity.saturating_add(1),
                "-vv" => parsed.verbosity = parsed.verbosity.saturating_add(2),
                "--output" => parsed.output = args.next().map(PathBuf::from),
                other => eprintln!("Warning: ignoring unknown argument {other}"),
            }
        }
        Ok(parsed)
    }

    fn app_config(&self) -> Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => {
                let mut config = AppConfig::default();
                config.apply_env()?;
                config
            }
        };
        if let Some(origin) = &self.origin {
            config.origin = origin.clone();
        }
        if let Some(generation) = &self.generation {
            config = config.with_generation(generation.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

/// The harness page: counts reloads.
#[derive(Default)]
struct HarnessPage {
    reloads: AtomicUsize,
}

impl PageEnvironment for HarnessPage {
    fn reload(&self) {
        self.reloads.fetch_add(1, Ordering::SeqCst);
    }

    fn display_mode(&self) -> DisplayMode {
        DisplayMode::Browser
    }
}

/// Collected probe results.
#[derive(Default)]
struct Report {
    checks: Vec<Value>,
    failures: usize,
}

impl Report {
    fn record(&mut self, name: &str, passed: bool, detail: Value) {
        if !passed {
            self.failures += 1;
            error!(check = name, %detail, "Check failed");
        } else {
            info!(check = name, "Check passed");
        }
        self.checks.push(json!({"check": name, "passed": passed, "detail": detail}));
    }

    fn response(&mut self, name: &str, response: &Response, expect: impl FnOnce(&Response) -> bool) {
        let detail = json!({
            "status": response.status.as_u16(),
            "offline": response.is_offline(),
            "body": response.json_body::<Value>().ok(),
        });
        let passed = expect(response);
        self.record(name, passed, detail);
    }
}

struct Session {
    config: AppConfig,
    simulated: Option<Arc<tread_net::MemoryNetwork>>,
    deployment: Arc<Deployment>,
    container: Arc<ServiceWorkerContainer>,
    page: Arc<HarnessPage>,
    manager: UpdateManager,
}

impl Session {
    fn new(config: AppConfig, live: bool) -> Result<Self> {
        let simulated = (!live).then(|| Arc::new(origin::simulated(&config)));
        let network: Arc<dyn Fetcher> = match &simulated {
            Some(memory) => memory.clone(),
            None => Arc::new(HttpFetcher::new(LoaderConfig::default())?),
        };

        let deployment = Arc::new(Deployment::new());
        let container = Arc::new(ServiceWorkerContainer::new(
            config.origin.clone(),
            network,
            deployment.clone(),
        ));
        let page = Arc::new(HarnessPage::default());
        let manager = UpdateManager::new(config.clone(), container.clone(), page.clone());
        Ok(Self {
            config,
            simulated,
            deployment,
            container,
            page,
            manager,
        })
    }

    async fn deploy(&self, config: AppConfig) -> Result<()> {
        let script_url = config.script_url()?;
        let worker = CacheWorker::new(config)?;
        self.deployment.deploy(&script_url, Arc::new(worker)).await;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Response> {
        let client = self.manager.client_id().await;
        let request = Request::get(self.config.resolve(path)?);
        Ok(self.container.fetch(client.as_deref(), request).await?)
    }

    async fn navigate(&self, path: &str) -> Result<Response> {
        let request = Request::navigate(self.config.resolve(path)?);
        Ok(self.container.fetch(None, request).await?)
    }

    async fn partitions(&self) -> Vec<String> {
        self.container.caches().read().await.keys()
    }

    fn set_online(&self, online: bool) {
        if let Some(network) = &self.simulated {
            network.set_online(online);
        }
    }
}

async fn run(args: &Args) -> Result<Value> {
    let config = args.app_config()?;
    let live = args.origin.is_some();
    info!(origin = %config.origin, generation = %config.generation, live, "Starting harness");

    let session = Session::new(config.clone(), live)?;
    let mut report = Report::default();

    // Install and activate the first generation.
    session.deploy(config.clone()).await?;
    let registration = session.manager.initialize().await?;
    let partitions = session.partitions().await;
    report.record(
        "install",
        registration.active.is_some() && partitions.contains(&config.static_cache_name()),
        json!({"registration": registration, "partitions": partitions}),
    );

    let response = session.get("/api/products").await?;
    report.response("catalog online", &response, |r| r.ok() && !r.is_offline());

    if !live {
        session.set_online(false);

        let response = session.get("/api/products").await?;
        report.response("catalog offline", &response, |r| {
            r.ok() && r.json_body::<Value>().is_ok_and(|b| b["offline"] == json!(true))
        });

        let response = session.get("/api/cart").await?;
        report.response("cart offline", &response, |r| {
            r.status.as_u16() == 503 && r.json_body::<Value>().is_ok_and(|b| b["offline"] == json!(true))
        });

        let response = session.navigate("/products").await?;
        report.response("shell offline", &response, |r| r.ok());

        let response = session.navigate("/orders").await?;
        report.response("unknown page offline", &response, |r| r.ok());

        session.set_online(true);

        let scope = config.resolve("/")?;
        let synced = session.container.sync(&scope, "sync-cart", false).await;
        report.record("sync", synced.is_ok(), json!({"error": synced.err().map(|e| e.to_string())}));

        session
            .container
            .push(&scope, Some(br#"{"body": "Winter tires are in"}"#.to_vec().into()))
            .await?;
        let shown = session.container.notifications().read().await.len();
        report.record("push", shown == 1, json!({"notifications": shown}));
    }

    // Roll out the next generation and apply it through the handshake.
    let next = AppConfig {
        skip_waiting_on_install: false,
        ..config.clone()
    }
    .with_generation(format!("{}-next", config.generation));
    session.deploy(next.clone()).await?;
    session.manager.check_for_updates().await;

    let started = Instant::now();
    let outcome = session.manager.force_update().await?;
    let partitions = session.partitions().await;
    report.record(
        "update",
        outcome == UpdateOutcome::Reloaded
            && session.manager.controller_version().as_deref() == Some(next.generation.as_str())
            && partitions.iter().all(|p| p.contains(&next.generation)),
        json!({
            "outcome": format!("{outcome:?}"),
            "handshake_ms": started.elapsed().as_millis() as u64,
            "reloads": session.page.reloads.load(Ordering::SeqCst),
            "partitions": partitions,
        }),
    );

    // Close the page.
    let detached = session.manager.detach().await;
    let open = session.container.client_urls().await;
    report.record(
        "detach",
        detached && open.is_empty(),
        json!({"open": open.iter().map(Url::as_str).collect::<Vec<_>>()}),
    );

    let passed = report.failures == 0;
    Ok(json!({
        "origin": config.origin.as_str(),
        "mode": if live { "live" } else { "simulated" },
        "generation": config.generation,
        "next_generation": next.generation,
        "checks": report.checks,
        "failures": report.failures,
        "passed": passed,
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse()?;

    let mut log_config = LogConfig::for_verbosity(args.verbosity).with_format(args.log_format);
    if let Some(filter) = &args.log_filter {
        log_config = log_config.with_filter(filter.clone());
    }
    init_logging(log_config)?;

    let result = run(&args).await?;
    let rendered = serde_json::to_string_pretty(&result)?;
    match &args.output {
        Some(path) => std::fs::write(path, &rendered)
            .with_context(|| format!("failed to write {}", path.display()))?,
        None => println!("{rendered}"),
    }

    if result["passed"] != json!(true) {
        bail!("{} harness checks failed", result["failures"]);
    }
    Ok(())
}
