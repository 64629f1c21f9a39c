//! Meshbridge Node - mesh radio bridge daemon
//!
//! This binary runs a bridge between one LoRa mesh radio and the bundled
//! plugins:
//! - Loads the JSON configuration (generating a command alias on first run)
//! - Connects to the first working transport and keeps the link up
//! - Discovers plugin directories and loads the enabled ones
//! - Shuts down gracefully on Ctrl-C

mod plugins;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meshbridge_core::{BridgeConfig, BridgeHandle, MeshBridge};

#[derive(Parser)]
#[command(name = "meshbridge-node")]
#[command(about = "Bridge a LoRa mesh radio to pluggable services")]
struct Args {
    /// Configuration file (JSON)
    #[arg(long, short, default_value = "meshbridge.json")]
    config: PathBuf,

    /// Plugin directory, overriding the configured one
    #[arg(long, short)]
    plugins: Option<PathBuf>,

    /// Log a status line at this interval (e.g. "5m")
    #[arg(long, value_parser = humantime::parse_duration)]
    status_interval: Option<Duration>,

    /// Print the bridge status as JSON once the link is up, then exit
    #[arg(long)]
    print_status: bool,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

/// How long `--print-status` waits for the radio
const PRINT_STATUS_LINK_WAIT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let mut config = BridgeConfig::load(&args.config)
        .await
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    if let Some(dir) = args.plugins {
        config.plugins.root = dir;
    }

    info!("Starting Meshbridge Node: {}", config.node.name);
    info!(
        alias = config.commands.alias(),
        plugins = %config.plugins.root.display(),
        transports = config.transports.len(),
        "Configuration loaded"
    );

    let (bridge, handle) = MeshBridge::from_config(config, plugins::catalog())
        .context("creating the bridge")?;
    let mut task = tokio::spawn(bridge.run());

    if args.print_status {
        if !handle.link().wait_until_usable(PRINT_STATUS_LINK_WAIT).await {
            warn!("Radio link not up; status reflects a disconnected bridge");
        }
        let status = handle.status().await?;
        println!("{}", status.to_json()?);
        handle.shutdown().await?;
        task.await??;
        return Ok(());
    }

    let mut ticker = args.status_interval.map(|period| {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        tokio::select! {
            finished = &mut task => {
                // The bridge only stops on its own when it cannot run at all
                let result = finished.context("bridge task panicked")?;
                if let Err(e) = &result {
                    error!(error = %e, "Bridge stopped");
                }
                return result.map_err(Into::into);
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("listening for Ctrl-C")?;
                info!("Ctrl-C received, shutting down");
                break;
            }
            _ = next_tick(&mut ticker) => log_status(&handle).await,
        }
    }

    handle.shutdown().await?;
    task.await.context("bridge task panicked")??;
    info!("Meshbridge Node stopped");
    Ok(())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn log_status(handle: &BridgeHandle) {
    match handle.status().await {
        Ok(status) => info!("Status: {}", status),
        Err(e) => warn!(error = %e, "Status unavailable"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from([
            "meshbridge-node",
            "--config",
            "bridge.json",
            "--plugins",
            "/srv/plugins",
            "--status-interval",
            "5m",
            "-v",
        ]);
        assert_eq!(args.config, PathBuf::from("bridge.json"));
        assert_eq!(args.plugins, Some(PathBuf::from("/srv/plugins")));
        assert_eq!(args.status_interval, Some(Duration::from_secs(300)));
        assert!(args.verbose);
        assert!(!args.print_status);
    }

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["meshbridge-node"]);
        assert_eq!(args.config, PathBuf::from("meshbridge.json"));
        assert!(args.plugins.is_none());
        assert!(args.status_interval.is_none());
    }
}
