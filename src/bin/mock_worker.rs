//! Mock avatar worker for testing avatarmux
//!
//! `mock-worker --port 8615` (or `AVATAR_PORT=8615 mock-worker`) serves
//! `/health` and `/info` on 127.0.0.1. Flags make it misbehave the ways real
//! workers do: bind late, die during startup, never bind, or fork a helper.

use axum::{Json, Router, extract::State, routing::get};
use clap::Parser;
use serde::Serialize;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "mock-worker")]
#[command(about = "Mock avatar worker for testing")]
struct Args {
    /// Port to listen on
    #[arg(short, long, env = "AVATAR_PORT")]
    port: u16,

    /// Logical avatar name
    #[arg(long, env = "AVATAR_NAME", default_value = "mock")]
    name: String,

    /// Instance id that requested this worker
    #[arg(long, env = "AVATAR_INSTANCE_ID", default_value = "")]
    instance: String,

    /// Delay before binding the port (ms)
    #[arg(long, default_value = "0")]
    startup_delay_ms: u64,

    /// Exit with status 1 after this many ms instead of serving
    #[arg(long)]
    exit_after_ms: Option<u64>,

    /// Stay alive but never bind the port
    #[arg(long)]
    never_bind: bool,

    /// Fork a long-lived helper process (like a GPU engine subprocess)
    #[arg(long)]
    spawn_helper: bool,
}

#[derive(Debug, Clone, Serialize)]
struct WorkerInfo {
    port: u16,
    name: String,
    instance: String,
    gpu: Option<String>,
    pid: u32,
    helper_pid: Option<u32>,
}

/// Append one line per launch to `$MOCK_WORKER_SPAWN_LOG`, if set.
fn record_launch(info: &WorkerInfo) -> anyhow::Result<()> {
    let Some(path) = std::env::var_os("MOCK_WORKER_SPAWN_LOG") else {
        return Ok(());
    };
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(
        file,
        "{} {} {} {}",
        info.name,
        info.port,
        info.gpu.as_deref().unwrap_or("-"),
        info.pid
    )?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("mock_worker=debug")
        .with_ansi(false)
        .init();

    let args = Args::parse();

    let helper = if args.spawn_helper {
        Some(std::process::Command::new("sleep").arg("300").spawn()?)
    } else {
        None
    };

    let info = WorkerInfo {
        port: args.port,
        name: args.name.clone(),
        instance: args.instance.clone(),
        gpu: std::env::var("CUDA_VISIBLE_DEVICES").ok(),
        pid: std::process::id(),
        helper_pid: helper.as_ref().map(|h| h.id()),
    };
    record_launch(&info)?;
    info!(port = args.port, name = %args.name, gpu = ?info.gpu, "Mock worker starting");

    if let Some(ms) = args.exit_after_ms {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        eprintln!("mock worker failing on purpose after {ms}ms");
        std::process::exit(1);
    }

    if args.never_bind {
        info!("Never binding, as requested");
        std::future::pending::<()>().await;
    }

    if args.startup_delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(args.startup_delay_ms)).await;
    }

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/info", get(worker_info))
        .with_state(Arc::new(info));

    let listener = TcpListener::bind(("127.0.0.1", args.port)).await?;
    println!("READY {}", args.port);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn worker_info(State(info): State<Arc<WorkerInfo>>) -> Json<WorkerInfo> {
    Json((*info).clone())
}
