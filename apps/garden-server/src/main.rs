//! # Beer Garden Server
//!
//! Runs one garden of a federation.
//!
//! ## Startup
//! ```text
//! load config ──► wait for database ──► start GardenAgent ──► wait for broker
//!                 (supervised backoff)                        (the connection's
//!                                                              own backoff)
//!                                                                   │
//!                                                                   ▼
//!                                                               serve HTTP
//!
//! Ctrl-C / SIGTERM ──► stop root lifecycle ──► agent.shutdown (bounded)
//!                                              HTTP drain, DISCONNECT, close pool
//! ```
//!
//! ## Usage
//! ```text
//! beer-garden [path/to/garden.toml]
//! ```
//! Every setting can be overridden with a `BG_*` environment variable.

mod http;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use garden_db::Database;
use garden_sync::{GardenAgent, GardenConfig, Lifecycle, Readiness, Supervisor, SyncError};

use crate::http::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = GardenConfig::load(config_path).context("loading configuration")?;
    config.validate().context("validating configuration")?;

    init_tracing(&config.log.level);
    info!(garden = %config.garden_name(), "Starting beer-garden");

    let root = Lifecycle::new();
    tokio::spawn({
        let root = root.clone();
        async move {
            shutdown_signal().await;
            root.stop();
        }
    });

    let db = match connect_database(&config, &root)
        .await
        .context("connecting to the database")?
    {
        Some(db) => db,
        None => {
            info!("Shutdown requested before the database came up");
            return Ok(());
        }
    };

    let mut agent = GardenAgent::new(config.clone(), db.clone(), &root);
    let handle = agent.start().await.context("starting garden agent")?;

    if handle.until_connected().await == Readiness::Stopped {
        info!("Shutdown requested before the broker came up");
        agent.shutdown().await;
        db.close().await;
        return Ok(());
    }

    let server = if config.http.enabled {
        let bind_addr = config.http.bind_address();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("binding HTTP listener to {}", bind_addr))?;
        info!(addr = %bind_addr, "HTTP server listening");

        let app = http::app(AppState {
            router: handle.router().clone(),
            agent: Some(handle.clone()),
        });
        let stop = root.clone();
        Some(tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.stopped().await })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "HTTP server failed");
            }
        }))
    } else {
        None
    };

    root.stopped().await;

    agent.shutdown().await;

    if let Some(server) = server {
        if tokio::time::timeout(config.shutdown_grace(), server).await.is_err() {
            warn!("HTTP server did not drain in time");
        }
    }

    db.close().await;
    info!("Server shutdown complete");
    Ok(())
}

/// Opens the database, retrying with backoff until it answers. `None` when
/// shutdown is requested first.
async fn connect_database(
    config: &GardenConfig,
    root: &Lifecycle,
) -> Result<Option<Database>, SyncError> {
    let db_config = config.db_config();
    if let Some(dir) = db_config.database_path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }

    let opened: Arc<Mutex<Option<Database>>> = Arc::new(Mutex::new(None));
    let supervisor = Supervisor::new(config.backoff_policy());

    let readiness = supervisor
        .run(
            || {
                let db_config = db_config.clone();
                let opened = opened.clone();
                async move {
                    match Database::new(db_config).await {
                        Ok(db) if db.health_check().await => {
                            if let Ok(mut slot) = opened.lock() {
                                *slot = Some(db);
                            }
                            true
                        }
                        Ok(_) => false,
                        Err(e) => {
                            warn!(error = %e, "Database connection attempt failed");
                            false
                        }
                    }
                }
            },
            root,
            "Unable to connect to the database, is it started?",
        )
        .await;

    if readiness == Readiness::Stopped {
        return Ok(None);
    }

    let db = opened.lock().ok().and_then(|mut slot| slot.take());
    db.map(Some)
        .ok_or_else(|| SyncError::Internal("database probe succeeded without a pool".into()))
}

/// Installs the global subscriber.
///
/// `RUST_LOG` wins over the configured level.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn", level)));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
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

    info!("Shutdown signal received, starting graceful shutdown...");
}
