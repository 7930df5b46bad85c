//! avatarmux - GPU avatar worker pool manager
//!
//! This binary keeps a bounded pool of avatar worker processes, shares one
//! worker between every user of the same avatar, and restarts or reaps
//! workers in the background.

use anyhow::{Context, Result};
use avatarmux::{Config, Orchestrator};
use clap::Parser;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "avatarmux")]
#[command(about = "GPU avatar worker pool manager")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Control API port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Idle reaper threshold in seconds, <= 0 disables it (overrides config)
    #[arg(long, env = "AVATARMUX_IDLE_TIMEOUT", allow_negative_numbers = true)]
    idle_timeout: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Worker output never reaches this log; it stays in per-instance files.
    let filter = if args.verbose {
        EnvFilter::new("avatarmux=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting avatarmux");

    let mut config = Config::from_file(&args.config)
        .await
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(idle_timeout) = args.idle_timeout {
        config.idle_timeout_secs = idle_timeout;
    }

    info!(
        worker = %config.worker.command,
        port = config.port,
        max_instances = config.max_instances,
        "Configuration loaded"
    );

    let (control_router, metrics_router, orchestrator) = avatarmux::build_app(config.clone())
        .await
        .context("Failed to build application")?;

    // Spawn metrics server if enabled
    if let Some(metrics_router) = metrics_router {
        let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr)
            .await
            .with_context(|| format!("Failed to bind metrics to {}", metrics_addr))?;
        info!(addr = %metrics_addr, "Serving metrics");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, metrics_router).await {
                error!(error = %e, "Metrics server error");
            }
        });
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(addr = %addr, "Serving control API");

    let served = axum::serve(listener, control_router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    shutdown(&orchestrator).await;
    served
}

async fn shutdown(orchestrator: &Orchestrator) {
    info!("Stopping all workers before exit");
    orchestrator.shutdown().await;
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
