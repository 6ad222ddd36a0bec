//! pgrelay - single-backend intercepting proxy for PostgreSQL
//!
//! This binary runs the proxy in front of one configured backend:
//! - Terminates client connections (optionally over TLS)
//! - Authenticates to the backend with the client's startup parameters
//! - Relays all traffic transparently afterwards
//! - Routes CancelRequests to the backend that owns the session

use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use pgrelay::{config, Proxy, Result};

#[derive(Parser)]
#[command(name = "pgrelay")]
#[command(version)]
#[command(about = "Single-backend intercepting proxy for the PostgreSQL wire protocol")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Override listen address
    #[arg(long)]
    listen_address: Option<String>,

    /// Override listen port
    #[arg(long)]
    listen_port: Option<u16>,

    /// Enable verbose/debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = config::load_config(&cli.config)?;

    // Priority: --verbose flag, then RUST_LOG env var, then the config's level
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone())
    };
    tracing_subscriber::fmt().with_env_filter(&log_level).init();

    info!("Starting pgrelay v{}", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from {:?}", cli.config);

    // Apply CLI overrides
    if let Some(addr) = cli.listen_address {
        config.server.listen_address = addr;
    }
    if let Some(port) = cli.listen_port {
        config.server.listen_port = port;
    }

    let proxy = Proxy::new(config.dialer(), config.proxy_options()?);
    let stats = proxy.stats();

    let listener = TcpListener::bind(config.listen_addr()).await?;
    info!(
        "Proxy ready: listening on {} -> {}:{}",
        config.listen_addr(),
        config.target.host,
        config.target.port
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let mut listener_handle = tokio::spawn(async move { proxy.serve(listener, shutdown_rx).await });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
        result = &mut listener_handle => {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Listener error: {}", e),
                Err(e) => error!("Listener task failed: {}", e),
            }
            return Ok(());
        }
    }

    // Send shutdown signal
    let _ = shutdown_tx.send(());

    match listener_handle.await {
        Ok(Err(e)) => error!("Listener error: {}", e),
        Err(e) => error!("Listener task failed: {}", e),
        Ok(Ok(())) => {}
    }

    info!(
        "Shutdown complete. Total connections handled: {}",
        stats.connections_accepted.load(Ordering::Relaxed)
    );

    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
