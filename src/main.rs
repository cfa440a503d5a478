//! ==============================================================================
//! main.rs - smart bin hub entry point
//! ==============================================================================
//!
//! purpose:
//!     receives telemetry from the bin's sensor node and serves the latest
//!     state to the dashboard.
//!
//! responsibilities:
//!     - load configuration (config.rs)
//!     - set up the log stream
//!     - open the store once; if that fails, exit instead of serving
//!     - serve the json api until ctrl-c / sigterm
//!
//! architecture:
//!
//!     ┌──────────────┐   POST /sensor-data    ┌─────────────────────────┐
//!     │ sensor node  │ ─────────────────────> │        hub (axum)       │
//!     │ (bin + lid)  │   POST /estado-tapa    │  api.rs -> store.rs     │
//!     └──────────────┘                        │            │            │
//!     ┌──────────────┐   GET /datos-actuales  │      ┌─────┴─────┐      │
//!     │  dashboard   │ <───────────────────── │      │  sqlite   │      │
//!     └──────────────┘                        │      └───────────┘      │
//!                                             └─────────────────────────┘
//!
//! ==============================================================================

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use smartbin_hub::{api, config, store};

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // startup banner
    println!("===========================================================");
    println!("  Smart Bin Hub - telemetry ingestion");
    println!("===========================================================");

    // step 1: load configuration
    let config = config::HubConfig::load_or_default();

    // step 2: log stream
    init_tracing(&config.logging.level);
    config.print_summary();

    // step 3: open the store, fatal on failure
    let store = match store::open_store(&config.storage) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("fatal: failed to open store: {:#}", e);
            return Err(e);
        }
    };

    // step 4: serve
    let state = api::AppState::new(store, &config);
    run_server(&config.server, state).await
}

/// RUST_LOG wins over the configured level
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

// ==============================================================================
// web server
// ==============================================================================

async fn run_server(server: &config::ServerConfig, state: api::AppState) -> Result<()> {
    let app = api::router(state, server.body_limit_bytes());

    let addr = server.socket_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("hub listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    tracing::info!("hub stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl-c: {}", e);
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
                tracing::error!("failed to listen for sigterm: {}", e);
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
    tracing::info!("shutdown signal received");
}
