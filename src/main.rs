//! Tunnelrat - local proxy and tunnel endpoint
//!
//! This is the main entry point for the Tunnelrat application.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tunnelrat::config::load_config;
use tunnelrat::inbound::{InboundContext, InboundKind, InboundServer, Outbounds};
use tunnelrat::relay::BufferPool;
use tunnelrat::router::Router;
use tunnelrat::tunnel::TunnelServer;

/// Tunnelrat - SOCKS5/HTTP proxy with a disguised tunnel
#[derive(Parser, Debug)]
#[command(name = "tunnelrat")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); RUST_LOG overrides it
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,

    /// Seconds to let active sessions finish after a shutdown signal
    #[arg(long, default_value_t = 10)]
    shutdown_grace: u64,
}

enum Server {
    Inbound(Arc<InboundServer>),
    Tunnel(Arc<TunnelServer>),
}

impl Server {
    async fn shutdown_timeout(&self, grace: Duration) -> bool {
        match self {
            Server::Inbound(server) => server.shutdown_timeout(grace).await,
            Server::Tunnel(server) => server.shutdown_timeout(grace).await,
        }
    }

    fn close(&self) {
        match self {
            Server::Inbound(server) => server.close(),
            Server::Tunnel(server) => server.close(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level, args.json_log)?;

    let config = load_config(&args.config)?;
    config.validate()?;

    info!("Tunnelrat v{}", tunnelrat::VERSION);
    info!("Configuration loaded from: {:?}", args.config);

    let buffers = BufferPool::new(config.relay.buffer_size, config.relay.max_cached_buffers);
    let outbounds = Arc::new(Outbounds::from_config(&config)?);
    let context = InboundContext {
        dispatch: Router::new(&config.rules)?.into_dispatch(),
        outbounds: outbounds.clone(),
        buffers: buffers.clone(),
        config: config.inbound.clone(),
    };

    let mut servers = Vec::new();
    if let Some(addr) = &config.socks_listen {
        let server = InboundServer::bind(InboundKind::Socks5, addr, context.clone()).await?;
        servers.push(Server::Inbound(Arc::new(server)));
    }
    if let Some(addr) = &config.http_listen {
        let server = InboundServer::bind(InboundKind::Http, addr, context.clone()).await?;
        servers.push(Server::Inbound(Arc::new(server)));
    }
    for tunnel in &config.tunnel_servers {
        let server = TunnelServer::bind(tunnel, buffers.clone()).await?;
        servers.push(Server::Tunnel(Arc::new(server)));
    }

    let mut tasks = JoinSet::new();
    for server in &servers {
        match server {
            Server::Inbound(server) => {
                let server = server.clone();
                tasks.spawn(async move { server.serve().await });
            }
            Server::Tunnel(server) => {
                let server = server.clone();
                tasks.spawn(async move { server.serve().await });
            }
        }
    }

    tokio::select! {
        result = shutdown_signal() => result?,
        Some(joined) = tasks.join_next() => {
            match joined {
                Ok(Err(e)) => error!("Listener failed: {:#}", e),
                Err(e) => error!("Listener task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    info!(
        "Shutting down, waiting up to {}s for active sessions",
        args.shutdown_grace
    );
    let deadline = Instant::now() + Duration::from_secs(args.shutdown_grace);
    let drain = async {
        let mut drained = true;
        for server in &servers {
            drained &= server
                .shutdown_timeout(deadline.saturating_duration_since(Instant::now()))
                .await;
        }
        drained
    };
    tokio::select! {
        drained = drain => {
            if !drained {
                warn!("Grace period expired, remaining sessions were closed");
            }
        }
        result = shutdown_signal() => {
            result?;
            warn!("Second signal, closing remaining sessions");
            for server in &servers {
                server.close();
            }
        }
    }
    outbounds.close().await;
    tasks.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or, on unix, SIGTERM
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C, shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

/// Setup logging based on command line flags
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.to_lowercase()))
        .context("Invalid log level")?;

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
            .map_err(|e| anyhow::anyhow!(e))?;
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|e| anyhow::anyhow!(e))?;
    }

    Ok(())
}
