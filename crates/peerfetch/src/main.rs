//! PeerFetch edge proxy
//!
//! Usage:
//!   peerfetch-proxy [--config <file>] [--peerid-file <file>]
//!
//! Registers with the configured PeerJS server and proxies HTTP requests
//! from remote peers until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use peerfetch::{HttpFetcher, HttpRoomDiscovery, LifecycleController, PeerJsSessionFactory, TunnelConfig};
use peerfetch_config::{get_config_path, get_peerid_path, Config, IdentityStore, CONFIG_FILE_ENV, PEERID_FILE_ENV};

#[derive(Parser)]
#[command(name = "peerfetch-proxy")]
#[command(about = "HTTP proxy over WebRTC data channels", long_about = None)]
struct Cli {
    /// Config file, created with defaults if missing
    #[arg(long, env = CONFIG_FILE_ENV)]
    config: Option<PathBuf>,

    /// File holding the persisted peer id
    #[arg(long, env = PEERID_FILE_ENV)]
    peerid_file: Option<PathBuf>,
}

/// Map a configured log level to a tracing filter directive.
///
/// Accepts the level names older config files use.
fn level_directive(level: &str) -> &'static str {
    match level.trim().to_ascii_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "INFO" | "SUCCESS" => "info",
        "WARN" | "WARNING" => "warn",
        "ERROR" | "CRITICAL" => "error",
        _ => "info",
    }
}

fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level_directive(level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let identity = IdentityStore::new(cli.peerid_file.unwrap_or_else(get_peerid_path));
    let peer_id = identity
        .load()
        .with_context(|| format!("Failed to load peer id from {}", identity.path().display()))?;

    let config_path = cli.config.unwrap_or_else(get_config_path);
    let (config, existed) = Config::load_from(&config_path)?;

    init_logging(&config.log_level);
    info!("Log level is: {}", config.log_level);
    if !existed {
        info!("Wrote default config to {}", config_path.display());
    }
    info!("Last saved peer id: {:?}", peer_id);

    let fetcher = Arc::new(HttpFetcher::new().context("Failed to build HTTP client")?);
    let factory = PeerJsSessionFactory::new(config.clone())?;
    let discovery = HttpRoomDiscovery::new(&config)?;

    let mut controller = LifecycleController::new(
        factory,
        discovery,
        identity,
        fetcher.clone(),
        TunnelConfig::from_config(&config),
    )
    .with_peer_id(peer_id);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                error!("Cannot listen for interrupts: {}", e);
                // Keep the sender alive so the controller keeps running
                std::future::pending::<()>().await;
            }
        }
    });

    info!(
        "Starting http-proxy over webrtc via {}:{}",
        config.signaling_server, config.port
    );
    controller.run(shutdown_rx).await;

    drop(controller);
    drop(fetcher);
    info!("All done.");
    Ok(())
}
