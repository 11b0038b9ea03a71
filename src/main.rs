mod cache;
mod config;
mod git;
mod http;
mod metrics;
#[cfg(test)]
mod testing;
mod upstream;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::cache::{CacheKey, CacheStore, Coalescer};
use crate::config::{Config, Overrides};
use crate::git::ArchiveBuilder;
use crate::http::clone::BuildResult;
use crate::http::proxy::FetchResult;
use crate::metrics::MetricsRegistry;
use crate::upstream::UpstreamClient;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gitaccel", about = "Caching HTTP forward proxy with git clone acceleration")]
struct Cli {
    /// Path to an optional YAML configuration file.
    #[arg(short, long, env = "GITACCEL_CONFIG")]
    config: Option<PathBuf>,

    /// Listen host.
    #[arg(long, env = "PROXY_HOST")]
    host: Option<String>,

    /// Listen port.
    #[arg(long, env = "PROXY_PORT")]
    port: Option<u16>,

    /// Directory for cached bodies and repository archives.
    #[arg(long, env = "PROXY_CACHE_DIR")]
    cache_dir: Option<PathBuf>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            host: self.host.clone(),
            port: self.port,
            cache_dir: self.cache_dir.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub upstream: Arc<UpstreamClient>,
    pub cache: CacheStore,
    pub archiver: ArchiveBuilder,
    pub metrics: MetricsRegistry,
    /// In-flight fetches for plain `GET` cache misses.
    pub fetches: Coalescer<CacheKey, FetchResult>,
    /// In-flight repository archive builds.
    pub builds: Coalescer<CacheKey, BuildResult>,
}

impl AppState {
    /// Wire up every component.  The upstream client is created but not
    /// started.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            upstream: Arc::new(UpstreamClient::new(config.upstream.clone())),
            cache: CacheStore::new(config.storage.cache_dir.clone()),
            archiver: ArchiveBuilder::new(&config.git, config.storage.scratch_dir.as_deref()),
            metrics: MetricsRegistry::new(),
            fetches: Coalescer::new(),
            builds: Coalescer::new(),
            config,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP servers (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>) -> Result<()> {
    let listen_addr = state.config.listen_addr();
    let app = http::handler::create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

async fn run_metrics_server(listen_addr: String, metrics: MetricsRegistry) -> Result<()> {
    let app = http::handler::create_metrics_router(metrics);

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "metrics server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("metrics server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let config = config::load_config(cli.config.as_deref(), cli.overrides())?;
    let config = Arc::new(config);

    tracing::info!(
        config_path = ?cli.config,
        listen = %config.listen_addr(),
        "starting gitaccel"
    );

    // ---- App state ----
    let state = Arc::new(AppState::new(Arc::clone(&config)));

    // ---- Ensure local cache directory exists ----
    state.cache.ensure_root().await?;
    tracing::info!(
        cache_dir = %state.cache.root().display(),
        scratch_dir = %state.archiver.scratch_dir().display(),
        "storage ready"
    );

    // ---- git ----
    match git::commands::git_version(&config.git.binary).await {
        Ok(version) => tracing::info!(%version, "git available"),
        Err(e) => tracing::warn!(
            error = %e,
            binary = %config.git.binary,
            "git not usable; clone requests will fail"
        ),
    }

    // ---- Upstream client ----
    state.upstream.start()?;

    // ---- Spawn services ----
    let metrics_handle = config.proxy.metrics_listen.clone().map(|listen_addr| {
        let metrics = state.metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(listen_addr, metrics).await {
                tracing::error!(error = %e, "metrics server failed");
            }
        })
    });

    let result = run_http_server(Arc::clone(&state)).await;

    // ---- Shutdown ----
    state.upstream.shutdown();
    if let Some(handle) = metrics_handle {
        handle.abort();
    }

    if let Err(e) = &result {
        tracing::error!(error = %e, "HTTP server failed");
    } else {
        tracing::info!("gitaccel shut down cleanly");
    }
    result
}
