//! Configuration for avatarmux

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// How avatar workers are launched
    pub worker: WorkerConfig,

    /// Control API port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Metrics port (0 to disable)
    #[serde(default)]
    pub metrics_port: u16,

    /// Maximum number of concurrently running instances
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,

    /// First port of the worker port range
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Size of the worker port range (defaults to `max_instances`)
    #[serde(default)]
    pub port_count: Option<u16>,

    /// Candidate GPU ids, primary first
    #[serde(default = "default_gpus")]
    pub gpus: Vec<u32>,

    /// Free memory (MiB) a GPU needs to count as "has enough room"
    #[serde(default = "default_gpu_required_free_mb")]
    pub gpu_required_free_mb: u64,

    /// Where GPU memory telemetry comes from
    #[serde(default)]
    pub gpu_telemetry: GpuTelemetryMode,

    /// How long a freshly spawned worker has to start listening on its port
    #[serde(default = "default_bind_timeout_secs")]
    pub bind_timeout_secs: u64,

    /// Delay before the immediate-exit check
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,

    /// Interval between readiness probes while waiting for the bind
    #[serde(default = "default_bind_poll_interval_ms")]
    pub bind_poll_interval_ms: u64,

    /// Wait after killing a worker so the driver can reclaim its GPU memory
    #[serde(default = "default_gpu_release_grace_ms")]
    pub gpu_release_grace_ms: u64,

    /// Idle reaper threshold in seconds (<= 0 disables the reaper)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: i64,

    /// Sweeper interval in seconds (0 disables the background sweeper)
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Directory for per-instance worker logs
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Workers started at boot without a holder
    #[serde(default)]
    pub prestart: Vec<PrestartEntry>,
}

/// One worker to warm up at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrestartEntry {
    pub instance_id: String,
    pub logical_name: String,
}

/// Command used to launch one avatar worker.
///
/// Every argument may contain the placeholders `{port}`, `{gpu}`, `{name}` and
/// `{instance}`, which are expanded per launch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Program to execute
    pub command: String,

    /// Argument template
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory for the worker (defaults to the manager's)
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuTelemetryMode {
    /// Query `nvidia-smi` for per-device memory
    #[default]
    NvidiaSmi,
    /// No telemetry, always round robin
    Disabled,
}

fn default_port() -> u16 {
    8610
}

fn default_max_instances() -> usize {
    5
}

fn default_base_port() -> u16 {
    8615
}

fn default_gpus() -> Vec<u32> {
    vec![1, 0]
}

fn default_gpu_required_free_mb() -> u64 {
    11_000
}

fn default_bind_timeout_secs() -> u64 {
    29
}

fn default_startup_grace_ms() -> u64 {
    1000
}

fn default_bind_poll_interval_ms() -> u64 {
    100
}

fn default_gpu_release_grace_ms() -> u64 {
    3000
}

fn default_idle_timeout_secs() -> i64 {
    1800
}

fn default_health_check_interval_secs() -> u64 {
    60
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Config {
    /// Build a config with every optional field at its default.
    pub fn new(worker: WorkerConfig) -> Self {
        Self {
            worker,
            port: default_port(),
            metrics_port: 0,
            max_instances: default_max_instances(),
            base_port: default_base_port(),
            port_count: None,
            gpus: default_gpus(),
            gpu_required_free_mb: default_gpu_required_free_mb(),
            gpu_telemetry: GpuTelemetryMode::default(),
            bind_timeout_secs: default_bind_timeout_secs(),
            startup_grace_ms: default_startup_grace_ms(),
            bind_poll_interval_ms: default_bind_poll_interval_ms(),
            gpu_release_grace_ms: default_gpu_release_grace_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            log_dir: default_log_dir(),
            prestart: Vec::new(),
        }
    }

    /// Load configuration from a JSON file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Number of ports in the worker range.
    pub fn effective_port_count(&self) -> u16 {
        self.port_count
            .unwrap_or_else(|| u16::try_from(self.max_instances).unwrap_or(u16::MAX))
    }

    pub fn bind_timeout(&self) -> Duration {
        Duration::from_secs(self.bind_timeout_secs)
    }

    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn bind_poll_interval(&self) -> Duration {
        Duration::from_millis(self.bind_poll_interval_ms)
    }

    pub fn gpu_release_grace(&self) -> Duration {
        Duration::from_millis(self.gpu_release_grace_ms)
    }

    /// Sweeper interval, `None` when the background sweeper is disabled.
    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_secs > 0)
            .then(|| Duration::from_secs(self.health_check_interval_secs))
    }

    /// Validate configuration.
    ///
    /// Fatal problems are returned as errors; suspicious but workable values
    /// are logged as warnings.
    pub fn validate(&self) -> Result<()> {
        use tracing::warn;

        if self.max_instances == 0 {
            bail!("max_instances must be at least 1");
        }

        if self.worker.command.trim().is_empty() {
            bail!("worker.command must not be empty");
        }

        let count = self.effective_port_count();
        if count == 0 {
            bail!("port_count must be at least 1");
        }
        if u32::from(self.base_port) + u32::from(count) > u32::from(u16::MAX) + 1 {
            bail!(
                "worker port range {}..{} overflows the port space",
                self.base_port,
                u32::from(self.base_port) + u32::from(count)
            );
        }

        let range = u32::from(self.base_port)..u32::from(self.base_port) + u32::from(count);
        if range.contains(&u32::from(self.port)) {
            warn!(
                port = self.port,
                "Control API port lies inside the worker port range and will never be allocated"
            );
        }

        if usize::from(count) < self.max_instances {
            warn!(
                port_count = count,
                max_instances = self.max_instances,
                "Port range is smaller than max_instances; NoPortAvailable will be hit first"
            );
        }

        if self.gpus.is_empty() {
            warn!("No candidate GPUs configured; workers will be started with GPU 0");
        }

        if self.prestart.len() > self.max_instances {
            warn!(
                prestart = self.prestart.len(),
                max_instances = self.max_instances,
                "More prestart entries than max_instances; the extra ones will be refused"
            );
        }

        if self.bind_timeout() <= self.startup_grace() {
            warn!(
                bind_timeout_secs = self.bind_timeout_secs,
                startup_grace_ms = self.startup_grace_ms,
                "Bind timeout is not longer than the startup grace period"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"worker": {"command": "python"}}"#).unwrap();

        assert_eq!(config.max_instances, 5);
        assert_eq!(config.base_port, 8615);
        assert_eq!(config.effective_port_count(), 5);
        assert_eq!(config.gpus, vec![1, 0]);
        assert_eq!(config.gpu_telemetry, GpuTelemetryMode::NvidiaSmi);
        assert_eq!(config.idle_timeout_secs, 1800);
        assert_eq!(config.health_check_interval(), Some(Duration::from_secs(60)));
        assert!(config.worker.args.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn telemetry_mode_is_snake_case() {
        let config: Config = serde_json::from_str(
            r#"{"worker": {"command": "x"}, "gpu_telemetry": "disabled", "health_check_interval_secs": 0}"#,
        )
        .unwrap();
        assert_eq!(config.gpu_telemetry, GpuTelemetryMode::Disabled);
        assert_eq!(config.health_check_interval(), None);
    }

    #[test]
    fn overflowing_port_range_is_rejected() {
        let mut config = Config::new(WorkerConfig {
            command: "x".to_string(),
            args: vec![],
            working_dir: None,
            env: HashMap::new(),
        });
        config.base_port = 65_530;
        config.port_count = Some(10);
        assert!(config.validate().is_err());

        config.port_count = Some(6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_instances_is_rejected() {
        let mut config = Config::new(WorkerConfig {
            command: "x".to_string(),
            args: vec![],
            working_dir: None,
            env: HashMap::new(),
        });
        config.max_instances = 0;
        assert!(config.validate().is_err());
    }
}
