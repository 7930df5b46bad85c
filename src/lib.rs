//! # avatarmux
//!
//! Multiplexes a fixed pool of GPU-bound avatar worker processes across many
//! users.
//!
//! This crate provides:
//! - **Orchestrator**: Starts one worker per logical avatar name and shares it
//!   between every holder of that name
//! - **LifecycleSweeper**: Restarts dead workers and reaps idle ones
//! - **Control API**: Axum router exposing start/stop/restart/status
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          avatarmux                           │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ Control API  /avatar/start  /avatar/stop  /status ...  │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                            │                                 │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │ Orchestrator (one lock over the registry)              │  │
//! │  │ - PortAllocator   - GpuSelector   - ProcessSupervisor  │  │
//! │  │ - sharing: logical name -> instance, ref counted       │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │          ▲                 │                                 │
//! │   LifecycleSweeper         │ spawn / kill                    │
//! │          ┌─────────────────┼─────────────────┐               │
//! │          ▼                 ▼                 ▼               │
//! │   [worker:8615]     [worker:8616]     [worker:8617]          │
//! │    tutorA, GPU1      tutorB, GPU0      tutorC, GPU1          │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod config;
pub mod control;
mod orchestrator;
pub mod telemetry;
mod types;

pub use config::{Config, GpuTelemetryMode, PrestartEntry, WorkerConfig};
pub use orchestrator::{
    GpuSelector, GpuTelemetry, LifecycleSweeper, ListenerProbe, NoTelemetry, NvidiaSmi,
    Orchestrator, ProcNetListeners, StaticTelemetry, SweepReport, TelemetryError,
    parse_nvidia_smi,
};
pub use types::{GpuMemory, InstanceSummary, OrchestratorError, ReleaseOutcome, StatusSummary};

use anyhow::Result;
use tracing::{error, info};

/// Build the complete avatarmux stack
///
/// Returns:
/// - The control API router
/// - An optional metrics router (when `config.metrics_port > 0`)
/// - The orchestrator handle, for shutdown
pub async fn build_app(config: Config) -> Result<(axum::Router, Option<axum::Router>, Orchestrator)> {
    config.validate()?;
    let orchestrator = Orchestrator::new(&config);
    build_app_with(config, orchestrator).await
}

/// Like [`build_app`], but around an orchestrator the caller constructed.
pub async fn build_app_with(
    config: Config,
    orchestrator: Orchestrator,
) -> Result<(axum::Router, Option<axum::Router>, Orchestrator)> {
    info!(
        max_instances = config.max_instances,
        base_port = config.base_port,
        port_count = config.effective_port_count(),
        gpus = ?config.gpus,
        "Building avatarmux"
    );

    // Warm workers at boot; a failing prestart is logged, not fatal
    for entry in &config.prestart {
        match orchestrator.warm(&entry.instance_id, &entry.logical_name).await {
            Ok(summary) => info!(
                instance_id = %summary.instance_id,
                port = summary.port,
                gpu_id = summary.gpu_id,
                "Prestarted worker"
            ),
            Err(e) => error!(
                instance_id = %entry.instance_id,
                error = %e,
                "Failed to prestart worker"
            ),
        }
    }

    if let Some(interval) = config.health_check_interval() {
        let _sweeper_handle =
            LifecycleSweeper::new(orchestrator.clone(), interval, config.idle_timeout_secs)
                .spawn();
    }

    let control = control::control_router(orchestrator.clone(), config.idle_timeout_secs);

    let metrics_router = if config.metrics_port > 0 {
        telemetry::install().map(telemetry::metrics_router)
    } else {
        None
    };

    Ok((control, metrics_router, orchestrator))
}
