//! Shared domain types used across the codebase.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

/// Errors from the orchestrator
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("capacity exceeded: {max} instances already running")]
    CapacityExceeded { max: usize },

    #[error("no free port in {base}..{end}")]
    NoPortAvailable { base: u16, end: u32 },

    #[error("worker for {instance_id} exited immediately, see {}: {log_tail}", log_path.display())]
    ImmediateExit {
        instance_id: String,
        log_path: PathBuf,
        log_tail: String,
    },

    #[error("worker for {instance_id} did not bind port {port} within {timeout:?}")]
    BindTimeout {
        instance_id: String,
        port: u16,
        timeout: Duration,
    },

    #[error("failed to spawn worker for {instance_id}: {reason}")]
    SpawnFailed { instance_id: String, reason: String },

    #[error("instance not found: {0}")]
    ProcessNotFound(String),

    #[error("instance {instance_id} already serves {existing}, cannot serve {requested}")]
    InstanceConflict {
        instance_id: String,
        existing: String,
        requested: String,
    },
}

impl OrchestratorError {
    /// Whether the failed start was fully rolled back and may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ImmediateExit { .. } | Self::BindTimeout { .. } | Self::SpawnFailed { .. }
        )
    }
}

/// Result of releasing a holder of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// Other holders remain; the worker keeps running
    Released { ref_count: u32 },
    /// The worker was torn down
    Stopped,
    /// Another caller is already tearing the worker down
    AlreadyStopping,
    /// Nothing by that id is running
    NotFound,
}

/// Snapshot of one instance, returned by start/restart/list/info
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceSummary {
    pub instance_id: String,
    pub logical_name: String,
    pub port: u16,
    pub gpu_id: u32,
    pub pid: Option<u32>,
    pub ref_count: u32,
    pub running: bool,
    /// Unix seconds
    pub started_at: u64,
    pub uptime_seconds: f64,
    pub idle_seconds: f64,
    pub endpoint: String,
    pub log_path: PathBuf,
}

/// Per-device memory telemetry, MiB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GpuMemory {
    pub gpu_id: u32,
    pub total_mb: u64,
    pub used_mb: u64,
    pub free_mb: u64,
}

/// System-wide view returned by `status()`
#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub running: usize,
    pub capacity: usize,
    pub available: usize,
    pub gpu_distribution: BTreeMap<u32, usize>,
    pub total_refs: u32,
    pub shared_instances: usize,
    pub sharing: HashMap<String, String>,
    pub starting: Vec<String>,
    pub instances: Vec<InstanceSummary>,
    pub gpus: Vec<GpuMemory>,
}
