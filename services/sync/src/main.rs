//! `sync` binary: run the sync engine once or on an interval.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use metalcast_sync::{config::SyncConfig, ConfigSyncSchedules};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Render scheduled machines into boot-config profiles and groups.
#[derive(Debug, Parser)]
#[command(name = "sync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON).
    #[arg(long, env = "METALCAST_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Report ignition templates, then run one retried sync pass (default).
    Once,

    /// Report ignition templates, then sync every `--interval` seconds.
    Watch {
        #[arg(long, default_value_t = 60)]
        interval: u64,
    },

    /// Only report ignition templates to the API.
    ReportIgnitions,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SyncConfig::load(cli.config)?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        api_uri = %config.api_uri,
        matchbox_path = %config.matchbox_path.display(),
        "Configuration loaded"
    );

    let retry = config.retry();
    let engine = ConfigSyncSchedules::new(config)?;

    match cli.command.unwrap_or(Command::Once) {
        Command::ReportIgnitions => {
            let reported = engine.report_ignitions().await?;
            info!(reported, "ignition templates reported");
        }
        Command::Once => {
            engine.report_ignitions().await?;
            let synced = engine.apply(retry).await?;
            info!(synced, "sync complete");
        }
        Command::Watch { interval } => {
            engine.report_ignitions().await?;
            let mut ticker = tokio::time::interval(Duration::from_secs(interval.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match engine.apply(retry).await {
                            Ok(synced) => info!(synced, "sync complete"),
                            Err(e) => error!(error = %e, "sync pass failed"),
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received shutdown signal");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
