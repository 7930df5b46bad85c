//! GPU selection for new workers.

use crate::types::GpuMemory;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

const NVIDIA_SMI_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("GPU telemetry unavailable: {0}")]
    Unavailable(String),

    #[error("unparseable GPU telemetry line {line:?}")]
    Parse { line: String },
}

/// Source of per-device memory readings.
#[async_trait]
pub trait GpuTelemetry: Send + Sync {
    async fn snapshot(&self) -> Result<Vec<GpuMemory>, TelemetryError>;
}

/// Reads memory usage from `nvidia-smi`.
#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    binary: String,
}

impl Default for NvidiaSmi {
    fn default() -> Self {
        Self {
            binary: "nvidia-smi".to_string(),
        }
    }
}

impl NvidiaSmi {
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl GpuTelemetry for NvidiaSmi {
    async fn snapshot(&self) -> Result<Vec<GpuMemory>, TelemetryError> {
        let output = tokio::time::timeout(
            NVIDIA_SMI_TIMEOUT,
            Command::new(&self.binary)
                .args([
                    "--query-gpu=index,memory.total,memory.used,memory.free",
                    "--format=csv,noheader,nounits",
                ])
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| TelemetryError::Unavailable(format!("{} timed out", self.binary)))?
        .map_err(|e| TelemetryError::Unavailable(format!("failed to run {}: {e}", self.binary)))?;

        if !output.status.success() {
            return Err(TelemetryError::Unavailable(format!(
                "{} failed with status {}",
                self.binary, output.status
            )));
        }

        parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
    }
}

/// `index, total, used, free` per line, MiB.
pub fn parse_nvidia_smi(output: &str) -> Result<Vec<GpuMemory>, TelemetryError> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let parse_err = || TelemetryError::Parse {
                line: line.to_string(),
            };
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            let &[index, total, used, free] = parts.as_slice() else {
                return Err(parse_err());
            };
            Ok(GpuMemory {
                gpu_id: index.parse().map_err(|_| parse_err())?,
                total_mb: total.parse().map_err(|_| parse_err())?,
                used_mb: used.parse().map_err(|_| parse_err())?,
                free_mb: free.parse().map_err(|_| parse_err())?,
            })
        })
        .collect()
}

/// Telemetry for hosts without NVIDIA tooling; selection falls back to round robin.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTelemetry;

#[async_trait]
impl GpuTelemetry for NoTelemetry {
    async fn snapshot(&self) -> Result<Vec<GpuMemory>, TelemetryError> {
        Err(TelemetryError::Unavailable("disabled".to_string()))
    }
}

/// Fixed readings that can be swapped at runtime. `None` behaves like [`NoTelemetry`].
#[derive(Debug, Default)]
pub struct StaticTelemetry {
    readings: Mutex<Option<Vec<GpuMemory>>>,
}

impl StaticTelemetry {
    pub fn new(readings: Vec<GpuMemory>) -> Self {
        Self {
            readings: Mutex::new(Some(readings)),
        }
    }

    pub fn set(&self, readings: Option<Vec<GpuMemory>>) {
        if let Ok(mut guard) = self.readings.lock() {
            *guard = readings;
        }
    }
}

#[async_trait]
impl GpuTelemetry for StaticTelemetry {
    async fn snapshot(&self) -> Result<Vec<GpuMemory>, TelemetryError> {
        self.readings
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or_else(|| TelemetryError::Unavailable("no readings".to_string()))
    }
}

/// Picks a GPU for a new worker from an ordered candidate list.
#[derive(Debug, Clone)]
pub struct GpuSelector {
    candidates: Vec<u32>,
    required_free_mb: u64,
}

impl GpuSelector {
    pub fn new(candidates: Vec<u32>, required_free_mb: u64) -> Self {
        Self {
            candidates,
            required_free_mb,
        }
    }

    pub fn is_candidate(&self, gpu_id: u32) -> bool {
        self.candidates.contains(&gpu_id)
    }

    /// Choose a GPU.
    ///
    /// With telemetry the candidate with the most free memory wins, preferring
    /// ones above the requirement. Without it the least loaded candidate wins.
    /// Ties go to the earlier candidate.
    pub fn select(&self, telemetry: Option<&[GpuMemory]>, load: &HashMap<u32, usize>) -> u32 {
        let Some(&primary) = self.candidates.first() else {
            warn!("No candidate GPUs configured, using GPU 0");
            return 0;
        };

        if let Some(readings) = telemetry
            && let Some(gpu_id) = self.select_by_memory(readings)
        {
            return gpu_id;
        }

        let mut best = primary;
        let mut best_load = usize::MAX;
        for &gpu_id in &self.candidates {
            let n = load.get(&gpu_id).copied().unwrap_or(0);
            if n < best_load {
                best = gpu_id;
                best_load = n;
            }
        }
        debug!(gpu_id = best, load = best_load, "Selected GPU by instance count");
        best
    }

    fn select_by_memory(&self, readings: &[GpuMemory]) -> Option<u32> {
        let known: Vec<&GpuMemory> = self
            .candidates
            .iter()
            .filter_map(|id| readings.iter().find(|r| r.gpu_id == *id))
            .collect();

        let most_free = |pool: &[&GpuMemory]| -> Option<GpuMemory> {
            // max_by_key keeps the last maximum; fold keeps the first
            pool.iter().fold(None, |best: Option<GpuMemory>, r| match best {
                Some(b) if b.free_mb >= r.free_mb => Some(b),
                _ => Some(**r),
            })
        };

        let roomy: Vec<&GpuMemory> = known
            .iter()
            .copied()
            .filter(|r| r.free_mb >= self.required_free_mb)
            .collect();
        if let Some(pick) = most_free(&roomy) {
            debug!(gpu_id = pick.gpu_id, free_mb = pick.free_mb, "Selected GPU by free memory");
            return Some(pick.gpu_id);
        }

        let pick = most_free(&known)?;
        warn!(
            gpu_id = pick.gpu_id,
            free_mb = pick.free_mb,
            required_mb = self.required_free_mb,
            "No GPU has the required free memory, using the one with the most"
        );
        Some(pick.gpu_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem(gpu_id: u32, free_mb: u64) -> GpuMemory {
        GpuMemory {
            gpu_id,
            total_mb: 24_000,
            used_mb: 24_000u64.saturating_sub(free_mb),
            free_mb,
        }
    }

    #[test]
    fn parses_nvidia_smi_csv() {
        let out = "0, 24564, 1200, 23364\n1, 24564, 20000, 4564\n\n";
        let gpus = parse_nvidia_smi(out).unwrap();
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[1].gpu_id, 1);
        assert_eq!(gpus[1].free_mb, 4564);

        assert!(matches!(
            parse_nvidia_smi("0, 24564, [N/A], 1"),
            Err(TelemetryError::Parse { .. })
        ));
        assert!(parse_nvidia_smi("0, 1, 2").is_err());
    }

    #[test]
    fn prefers_most_free_above_requirement() {
        let selector = GpuSelector::new(vec![1, 0], 11_000);
        let readings = [mem(0, 20_000), mem(1, 12_000)];
        assert_eq!(selector.select(Some(&readings), &HashMap::new()), 0);
    }

    #[test]
    fn requirement_is_soft() {
        let selector = GpuSelector::new(vec![1, 0], 11_000);
        let readings = [mem(0, 3_000), mem(1, 9_000)];
        assert_eq!(selector.select(Some(&readings), &HashMap::new()), 1);
    }

    #[test]
    fn ties_go_to_primary() {
        let selector = GpuSelector::new(vec![1, 0], 11_000);
        let readings = [mem(0, 15_000), mem(1, 15_000)];
        assert_eq!(selector.select(Some(&readings), &HashMap::new()), 1);
        assert_eq!(selector.select(None, &HashMap::new()), 1);
    }

    #[test]
    fn round_robin_without_telemetry() {
        let selector = GpuSelector::new(vec![1, 0], 11_000);
        let load = HashMap::from([(1, 2), (0, 1)]);
        assert_eq!(selector.select(None, &load), 0);

        // Readings for non-candidates only: treated as no telemetry
        let readings = [mem(7, 40_000)];
        assert_eq!(selector.select(Some(&readings), &load), 0);
    }

    #[test]
    fn empty_candidates_fall_back_to_zero() {
        let selector = GpuSelector::new(vec![], 11_000);
        assert_eq!(selector.select(None, &HashMap::new()), 0);
    }

    #[tokio::test]
    async fn static_telemetry_can_be_cleared() {
        let telemetry = StaticTelemetry::new(vec![mem(0, 1)]);
        assert_eq!(telemetry.snapshot().await.unwrap().len(), 1);
        telemetry.set(None);
        assert!(telemetry.snapshot().await.is_err());
        assert!(NoTelemetry.snapshot().await.is_err());
    }

    #[tokio::test]
    async fn missing_nvidia_smi_is_unavailable() {
        let smi = NvidiaSmi::with_binary("/nonexistent/nvidia-smi");
        assert!(matches!(
            smi.snapshot().await,
            Err(TelemetryError::Unavailable(_))
        ));
    }
}
