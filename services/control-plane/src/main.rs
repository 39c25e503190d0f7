//! metalcast control plane
//!
//! Serves discovery, the role scheduler and the lifecycle tracker over HTTP,
//! and optionally runs promotion passes in the background.

use anyhow::Result;
use metalcast_control_plane::{
    api, config,
    db::Database,
    scheduler::SchedulerWorker,
    state::{ApiSettings, AppState},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::load()?;

    // Initialize tracing (prefer RUST_LOG, fallback to configured log_level)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting metalcast control plane");
    info!(
        listen_addr = %config.listen_addr,
        matchbox_uri = %config.matchbox_uri,
        "Configuration loaded"
    );

    let db = match Database::connect(&config.database()).await {
        Ok(db) => {
            info!(endpoint = %db.endpoint(), "Database connection established");
            db
        }
        Err(e) => {
            error!(error = %e, "Failed to connect to database");
            return Err(e.into());
        }
    };

    if config.run_migrations {
        if let Err(e) = db.run_migrations().await {
            error!(error = %e, "Failed to run migrations");
            return Err(e.into());
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Promotion is usually driven externally; run it in-process when configured.
    let scheduler_handle = config.scheduler_interval().map(|interval| {
        let worker = SchedulerWorker::new(db.pool().clone(), &config.policy(), interval);
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            worker.run(shutdown_rx).await;
        })
    });

    let state = AppState::new(db, ApiSettings::from_config(&config)?)?;
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    if let Some(handle) = scheduler_handle {
        let shutdown_timeout = std::time::Duration::from_secs(10);
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(error = %e, "Scheduler worker did not shut down in time");
        }
    }

    info!("Control plane shutdown complete");
    Ok(())
}
