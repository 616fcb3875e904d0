use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::api::{self, AppState};
use super::collaborators::{ArtifactProcessor, Generator, HttpGenerator, HttpProcessor};
use super::coordinator::{CoordinatorOptions, SequenceCoordinator};
use super::db::SqliteStore;
use super::store::StateStore;
use crate::config::SequencerConfig;

/// Configuration for the sequencer server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub ttl: Duration,
    pub purge_interval: Duration,
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_config(&SequencerConfig::default())
    }
}

impl ServerConfig {
    pub fn from_config(config: &SequencerConfig) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            db_path: config.server.db_path.clone(),
            dev_mode: config.server.dev_mode,
            ttl: config.ttl(),
            purge_interval: Duration::from_secs(config.timing.purge_interval_secs),
            shutdown_grace: Duration::from_secs(config.server.shutdown_grace_secs),
        }
    }
}

/// Build the full application router with request tracing, plus permissive
/// CORS in dev mode.
pub fn build_router(state: Arc<AppState>, dev_mode: bool) -> Router {
    let mut app = api::api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Build the HTTP generator and processors named in the config.
pub fn build_collaborators(
    config: &SequencerConfig,
) -> Result<(Arc<dyn Generator>, Vec<Arc<dyn ArtifactProcessor>>)> {
    let generator = HttpGenerator::new(
        config.generator.url.clone(),
        Duration::from_secs(config.generator.timeout_secs),
    )
    .context("Failed to build generator client")?;

    let mut processors: Vec<Arc<dyn ArtifactProcessor>> = Vec::new();
    for p in &config.processors {
        let processor = HttpProcessor::new(
            p.name.clone(),
            p.url.clone(),
            Duration::from_secs(p.timeout_secs),
        )
        .with_context(|| format!("Failed to build client for processor '{}'", p.name))?;
        processors.push(Arc::new(processor));
    }
    Ok((Arc::new(generator), processors))
}

/// Open (creating if needed) the SQLite store at `path`.
pub fn open_store(path: &std::path::Path, ttl: Duration) -> Result<SqliteStore> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    SqliteStore::open(path, ttl).context("Failed to initialize sequence database")
}

/// Drop expired sequences every `interval` until `cancel` fires.
pub fn spawn_purge_task(
    store: Arc<dyn StateStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match store.purge_expired().await {
                    Ok(0) => {}
                    Ok(n) => info!(removed = n, "purged expired sequences"),
                    Err(e) => warn!(error = %e, "purge failed"),
                },
            }
        }
        debug!("purge task stopped");
    })
}

/// Start the sequencer server and block until Ctrl+C.
pub async fn start_server(
    server: ServerConfig,
    options: CoordinatorOptions,
    generator: Arc<dyn Generator>,
    processors: Vec<Arc<dyn ArtifactProcessor>>,
) -> Result<()> {
    let store: Arc<dyn StateStore> = Arc::new(open_store(&server.db_path, server.ttl)?);
    let coordinator = SequenceCoordinator::new(store.clone(), generator, processors, options);
    let purge = spawn_purge_task(
        store,
        server.purge_interval,
        coordinator.shutdown_token(),
    );

    let state = Arc::new(AppState::new(coordinator.clone()));
    let app = build_router(state, server.dev_mode);

    let addr = format!("{}:{}", server.host, server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, db = %server.db_path.display(), "sequencer listening");
    println!("Sequencer running at http://{}", local_addr);

    // Open push streams end on the coordinator's token, so cancel it as soon
    // as the signal arrives or graceful shutdown would wait on them.
    let stop = coordinator.shutdown_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            stop.cancel();
        })
        .await
        .context("Server error")?;

    if !coordinator.shutdown(server.shutdown_grace).await {
        warn!(
            remaining = coordinator.in_flight(),
            "in-flight jobs did not finish within the grace period"
        );
    }
    let _ = purge.await;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
