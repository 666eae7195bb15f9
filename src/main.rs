//! browserhub - multi-tenant browser session service.
//!
//! Clients request a remote headless browser over HTTP; the service
//! provisions a short-lived container in one of several regions, exposes a
//! proxied CDP WebSocket endpoint, and can persist the browser profile
//! across sessions.
//!
//! Usage:
//!   browserhub [--listen 0.0.0.0:8080]

mod browser;
mod config;
mod error;
mod http_server;
mod models;
mod proxy;
mod ratelimit;
mod region;
mod session;
mod sidecar;
mod store;

use clap::Parser;
use config::Config;
use http_server::AppState;
use ratelimit::Limiter;
use region::RegionManager;
use session::SessionManager;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use store::ContextStore;
use tracing::{error, info, warn};

const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "browserhub")]
#[command(about = "Multi-tenant browser session service")]
struct Args {
    /// Listen address override (defaults to LISTEN_ADDR or 0.0.0.0:8080)
    #[arg(long)]
    listen: Option<String>,

    /// Skip the browser image pull at startup
    #[arg(long)]
    skip_image_pull: bool,
}

#[tokio::main]
async fn main() {
    // .env first so RUST_LOG from the file reaches the subscriber.
    let dotenv = dotenvy::dotenv();
    tracing_subscriber::fmt::init();
    if dotenv.is_err() {
        info!("No .env file found, using process environment");
    }

    let args = Args::parse();
    let config = Config::from_env();

    info!("Starting browserhub...");

    let region_mgr = Arc::new(RegionManager::new());
    info!(regions = ?region_mgr.regions(), "Region manager initialized");

    if !args.skip_image_pull {
        info!("Ensuring browser image is available...");
        match tokio::time::timeout(IMAGE_PULL_TIMEOUT, region_mgr.ensure_images()).await {
            Ok(Ok(())) => info!("Browser image ready in all regions"),
            Ok(Err(e)) => {
                error!("Failed to ensure browser image: {}", e);
                exit(1);
            }
            Err(_) => {
                error!("Browser image pull timed out");
                exit(1);
            }
        }
    }

    let store = match ContextStore::new(&config.context_store_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to create context store: {}", e);
            exit(1);
        }
    };
    info!(path = %config.context_store_path, "Context store initialized");

    let limiter = Arc::new(Limiter::new(
        config.rate_limit_per_hour,
        config.rate_limit_burst,
    ));
    info!(
        per_hour = config.rate_limit_per_hour,
        burst = config.rate_limit_burst,
        "Rate limiter initialized"
    );

    let session_mgr = Arc::new(SessionManager::new(
        region_mgr.clone(),
        store.clone(),
        config.clone(),
    ));
    info!("Session manager initialized");

    let app = http_server::router(AppState {
        session_mgr,
        store,
        limiter,
    });

    let addr = args.listen.unwrap_or_else(|| config.listen_addr.clone());
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            exit(1);
        }
    };
    info!("Server starting on http://{}", addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                wait_for_signal().await;
                let _ = shutdown_tx.send(());
            })
            .await
    });

    // Once a signal lands, in-flight connections get a bounded drain window.
    let _ = shutdown_rx.await;
    info!("Shutting down server gracefully...");

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, server).await {
        Ok(Ok(Ok(()))) => info!("Server stopped cleanly"),
        Ok(Ok(Err(e))) => error!("Server error during shutdown: {}", e),
        Ok(Err(e)) => error!("Server task failed: {}", e),
        Err(_) => warn!("Shutdown timed out, exiting"),
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install ctrl-c handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
