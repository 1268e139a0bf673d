//! makevisor daemon - pooled-sandbox job broker.
//!
//! The daemon keeps per-image pools of warm execution environments, pairs
//! incoming jobs with them in submission order, supervises each run under
//! its time budget, and serves the requester surface over HTTP.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: process driver, listen on :3000
//! ./makevisor
//!
//! # With a configuration file
//! ./makevisor --config broker.json
//!
//! # Override the listen address
//! ./makevisor --config broker.json --listen 127.0.0.1:8600
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use makevisor::config::Config;
use makevisor::job::manager::JobManager;
use makevisor::job::queue::JobQueue;
use makevisor::job::worker::WorkerContext;
use makevisor::logging;
use makevisor::server::{self, AppState};
use makevisor::storage::Storage;
use makevisor::vm::{PoolSettings, Preallocator};
use makevisor::vmms::DriverRegistry;

struct Args {
    config: Option<PathBuf>,
    listen: Option<SocketAddr>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();

    let config = args
        .iter()
        .position(|a| a == "--config" || a == "-c")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from);

    let listen = args
        .iter()
        .position(|a| a == "--listen" || a == "-l")
        .and_then(|i| args.get(i + 1))
        .and_then(|s| s.parse().ok());

    Args { config, listen }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = parse_args();
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    let config = Arc::new(config);

    logging::init_logging("info,makevisor=debug");

    // ─────────────────────────────────────────────────────────────────────
    // 1. DRIVER
    // ─────────────────────────────────────────────────────────────────────
    let registry = DriverRegistry::builtin();
    let driver = registry.create(&config.driver, &config)?;
    tracing::info!(driver = driver.name(), "driver initialised");

    // ─────────────────────────────────────────────────────────────────────
    // 2. QUEUE, STORAGE, POOLS
    // ─────────────────────────────────────────────────────────────────────
    let storage = Arc::new(Storage::new(config.storage_root.clone()));
    let queue = Arc::new(JobQueue::new(config.dead_ring_capacity));
    let pool = Preallocator::new(Arc::clone(&driver), PoolSettings::from_config(&config));

    for (image, target) in &config.pools {
        pool.define_image(image, target.keep_alive).await;
    }
    // Adopt or destroy whatever a previous process left behind, then
    // bring every pool to its configured target.
    pool.reconcile().await?;
    for (image, target) in &config.pools {
        pool.update(image, target.target).await?;
    }

    // ─────────────────────────────────────────────────────────────────────
    // 3. SCHEDULER
    // ─────────────────────────────────────────────────────────────────────
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let ctx = WorkerContext {
        driver: Arc::clone(&driver),
        queue: Arc::clone(&queue),
        pool: Arc::clone(&pool),
        storage: Arc::clone(&storage),
        http,
        ready_timeout: config.ready_timeout(),
        retry_budget: config.retry_budget,
    };
    let manager = JobManager::new(
        Arc::clone(&queue),
        Arc::clone(&pool),
        ctx,
        config.tick_period(),
        config.retry_budget,
    );
    let _scheduler = Arc::clone(&manager).start();

    // ─────────────────────────────────────────────────────────────────────
    // 4. HTTP FACADE
    // ─────────────────────────────────────────────────────────────────────
    let state = AppState {
        config: Arc::clone(&config),
        queue,
        pool: Arc::clone(&pool),
        manager,
        storage,
        driver,
    };
    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "makevisor listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(pool))
        .await?;
    Ok(())
}

async fn shutdown_signal(pool: Arc<Preallocator>) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutting down; destroying free VMs");
    pool.shutdown().await;
}
