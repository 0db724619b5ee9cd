//! lipsync-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise tracing (console, plus a rotated file when `LIPSYNC_LOG_DIR` is set).
//! 3. Open the SQLite database and run pending migrations.
//! 4. Build the production pipeline and start the dispatcher.
//! 5. Recover tasks left unfinished by a previous run.
//! 6. Build the Axum router and start the HTTP server with graceful shutdown.
//! 7. Drain the dispatcher once the server has stopped accepting requests.

mod config;
mod error;
mod logging;
mod middleware;
mod routes;
mod schemas;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use lipsync_core::Dispatcher;
use lipsync_core::services;
use lipsync_core::storage::SqliteStore;
use tracing::{info, warn};

use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let _log_guard = logging::init(&cfg)?;
    info!(version = env!("CARGO_PKG_VERSION"), "lipsync-server starting");

    for dir in [&cfg.temp_dir, &cfg.output_dir, &cfg.runtime.work_root] {
        tokio::fs::create_dir_all(dir).await?;
    }

    // ── 3. Database ────────────────────────────────────────────────────────────
    let store = SqliteStore::connect(&cfg.database_url).await?;
    info!(database_url = %cfg.database_url, "database ready");

    // ── 4. Pipeline + dispatcher ───────────────────────────────────────────────
    let pipeline = services::pipeline(cfg.tools.clone(), &cfg.runtime)?;
    let dispatcher = Dispatcher::start(Arc::new(store), pipeline, cfg.runtime.clone())?;

    // ── 5. Recovery ────────────────────────────────────────────────────────────
    let report = dispatcher.recover().await?;
    if !report.interrupted.is_empty() {
        warn!(
            count = report.interrupted.len(),
            "tasks interrupted by the previous shutdown were marked as failed"
        );
    }
    info!(
        requeued = report.requeued.len(),
        interrupted = report.interrupted.len(),
        "recovery complete"
    );

    // ── 6. HTTP server with graceful shutdown ──────────────────────────────────
    let state = Arc::new(AppState {
        config: Arc::new(cfg.clone()),
        dispatcher: dispatcher.clone(),
    });
    let app = routes::build(state);
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // ── 7. Dispatcher drain ────────────────────────────────────────────────────
    // Queued tasks stay queued in the store and are picked up on next start.
    dispatcher.shutdown().await;

    info!("lipsync-server stopped");
    Ok(())
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
