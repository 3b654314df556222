//! pairlink - Main entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use pairlink::{
    cli::{Cli, Command, run_sessions_command},
    config::Config,
    gateway::{GatewayState, RateLimiter, start_server},
    keepalive,
    observability::create_observer,
    pairing::{FileSessionStore, PairingSessionManager},
    protocol::create_adapter,
};

/// How long live sessions get to close their connections on shutdown.
const SESSION_DRAIN: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle maintenance commands first (they don't need the gateway)
    match &cli.command {
        Some(Command::Sessions(cmd)) => {
            // Simple logging for CLI commands
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
                )
                .init();

            return run_sessions_command(cmd.clone());
        }
        None | Some(Command::Serve) => {
            // Continue to serve
        }
    }

    let _ = dotenvy::dotenv(); // Load .env if present
    let config = Config::from_env()?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("pairlink=info,tower_http=info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    tracing::info!("Starting pairlink v{}...", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        session_dir = %config.pairing.session_dir.display(),
        settle_delay_ms = config.pairing.settle_delay.as_millis() as u64,
        closed_retention_secs = config.pairing.closed_retention.as_secs(),
        backend = ?config.protocol.backend,
        "Loaded configuration"
    );

    std::fs::create_dir_all(&config.pairing.session_dir)?;
    let store = Arc::new(FileSessionStore::new(&config.pairing.session_dir));
    let adapter = create_adapter(&config.protocol);
    let observer = create_observer(&config.observability);
    let manager = Arc::new(PairingSessionManager::new(
        config.pairing.clone(),
        store,
        adapter,
        observer.clone(),
    ));

    let state = Arc::new(GatewayState::new(
        Arc::clone(&manager),
        RateLimiter::new(
            u64::from(config.gateway.rate_limit),
            config.gateway.rate_window.as_secs(),
        ),
    ));
    let addr: SocketAddr = config.gateway.bind_address().parse()?;
    let bound = start_server(addr, state.clone()).await?;
    tracing::info!("Pairing gateway ready on http://{}", bound);

    let pinger = keepalive::spawn(config.keepalive.clone());

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    if let Some(pinger) = pinger {
        pinger.abort();
    }
    state.shutdown().await;
    if manager.shutdown().await > 0 {
        tokio::time::sleep(SESSION_DRAIN).await;
    }
    observer.flush();

    tracing::info!("Shutdown complete");
    Ok(())
}
