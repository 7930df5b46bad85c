//! Orchestrator - manages avatar worker lifecycle
//!
//! The orchestrator is responsible for:
//! - Starting one worker per logical name and sharing it between holders
//! - Assigning each worker a free port and a GPU
//! - Confirming a worker actually listens before handing it out
//! - Tearing workers down when their last holder leaves, or on demand

mod gpu;
mod ports;
mod process;
mod registry;
mod sweeper;

pub use gpu::{
    GpuSelector, GpuTelemetry, NoTelemetry, NvidiaSmi, StaticTelemetry, TelemetryError,
    parse_nvidia_smi,
};
pub use ports::{ListenerProbe, ProcNetListeners};
pub use sweeper::{LifecycleSweeper, SweepReport};

use crate::config::{Config, GpuTelemetryMode};
use crate::types::{GpuMemory, InstanceSummary, OrchestratorError, ReleaseOutcome, StatusSummary};
use metrics::{counter, gauge, histogram};
use ports::PortAllocator;
use process::{LaunchSpec, ProcessSupervisor, SupervisorOptions, WorkerHandle};
use registry::{Instance, InstanceState, Registry, TransitionKind};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Why an instance is being torn down. Used as a metric label.
#[derive(Debug, Clone, Copy)]
enum StopReason {
    Released,
    Forced,
    Restart,
    Dead,
    Idle,
}

impl StopReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Released => "released",
            Self::Forced => "forced",
            Self::Restart => "restart",
            Self::Dead => "dead",
            Self::Idle => "idle",
        }
    }
}

/// Parameters of one ensure-running attempt.
struct StartRequest {
    instance_id: String,
    logical_name: String,
    gpu_hint: Option<u32>,
    exclude_port: Option<u16>,
    /// Holders added on success (0 for a warm start)
    holders: u32,
}

impl StartRequest {
    fn new(instance_id: &str, logical_name: &str, holders: u32) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            logical_name: logical_name.to_string(),
            gpu_hint: None,
            exclude_port: None,
            holders,
        }
    }
}

/// A teardown that has been claimed under the lock and must be finished outside it.
struct Teardown {
    instance_id: String,
    logical_name: String,
    port: u16,
    worker: Option<WorkerHandle>,
    reason: StopReason,
}

struct Inner {
    max_instances: usize,
    gpu_release_grace: Duration,
    registry: Mutex<Registry>,
    ports: PortAllocator,
    gpus: GpuSelector,
    telemetry: Arc<dyn GpuTelemetry>,
    supervisor: ProcessSupervisor,
}

/// Shared handle to the worker pool. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create an orchestrator backed by the host's `/proc` and `nvidia-smi`.
    pub fn new(config: &Config) -> Self {
        let telemetry: Arc<dyn GpuTelemetry> = match config.gpu_telemetry {
            GpuTelemetryMode::NvidiaSmi => Arc::new(NvidiaSmi::default()),
            GpuTelemetryMode::Disabled => Arc::new(NoTelemetry),
        };
        Self::with_collaborators(config, telemetry, Arc::new(ProcNetListeners))
    }

    /// Create an orchestrator with explicit telemetry and listener sources.
    ///
    /// This is useful for testing without GPUs.
    pub fn with_collaborators(
        config: &Config,
        telemetry: Arc<dyn GpuTelemetry>,
        probe: Arc<dyn ListenerProbe>,
    ) -> Self {
        let supervisor = ProcessSupervisor::new(
            config.worker.clone(),
            SupervisorOptions {
                log_dir: config.log_dir.clone(),
                startup_grace: config.startup_grace(),
                bind_timeout: config.bind_timeout(),
                poll_interval: config.bind_poll_interval(),
            },
        );

        Self {
            inner: Arc::new(Inner {
                max_instances: config.max_instances,
                gpu_release_grace: config.gpu_release_grace(),
                registry: Mutex::new(Registry::default()),
                ports: PortAllocator::new(config.base_port, config.effective_port_count(), probe),
                gpus: GpuSelector::new(config.gpus.clone(), config.gpu_required_free_mb),
                telemetry,
                supervisor,
            }),
        }
    }

    /// Acquire a worker for `logical_name`, starting one if none is running.
    ///
    /// Concurrent callers for the same logical name share one worker; each
    /// successful call adds one holder.
    pub async fn start(
        &self,
        instance_id: &str,
        logical_name: &str,
    ) -> Result<InstanceSummary, OrchestratorError> {
        self.ensure_running(StartRequest::new(instance_id, logical_name, 1))
            .await
    }

    /// Make sure a worker for `logical_name` is running without holding it.
    ///
    /// A warm worker with no holders is collected by the idle reaper.
    pub async fn warm(
        &self,
        instance_id: &str,
        logical_name: &str,
    ) -> Result<InstanceSummary, OrchestratorError> {
        self.ensure_running(StartRequest::new(instance_id, logical_name, 0))
            .await
    }

    /// Release one holder, or tear the worker down when `force` is set.
    ///
    /// `key` may be an instance id, the id of a holder that joined it, or a
    /// logical name.
    pub async fn stop(&self, key: &str, force: bool) -> ReleaseOutcome {
        let teardown = {
            let mut registry = self.inner.registry.lock().await;
            let Some(instance_id) = registry.resolve(key) else {
                debug!(key = %key, "Stop for unknown instance, already stopped");
                return ReleaseOutcome::NotFound;
            };
            // A holder releases its own hold once; afterwards its id is unknown
            if registry.holders.remove(key).is_some() {
                debug!(holder = %key, instance_id = %instance_id, "Holder released");
            }
            let Some(instance) = registry.instances.get_mut(&instance_id) else {
                return ReleaseOutcome::NotFound;
            };
            if instance.state == InstanceState::Stopping {
                debug!(instance_id = %instance_id, "Instance already stopping");
                return ReleaseOutcome::AlreadyStopping;
            }

            if !force {
                instance.ref_count = instance.ref_count.saturating_sub(1);
                if instance.ref_count > 0 {
                    instance.touch();
                    info!(
                        instance_id = %instance_id,
                        ref_count = instance.ref_count,
                        "Released holder, worker stays up"
                    );
                    return ReleaseOutcome::Released {
                        ref_count: instance.ref_count,
                    };
                }
                info!(instance_id = %instance_id, "Last holder released");
            }

            let reason = if force {
                StopReason::Forced
            } else {
                StopReason::Released
            };
            match Self::claim_teardown(&mut registry, &instance_id, reason) {
                Some(teardown) => teardown,
                None => return ReleaseOutcome::AlreadyStopping,
            }
        };

        self.finish_teardown(teardown).await;
        ReleaseOutcome::Stopped
    }

    /// Kill a worker and start a fresh one for the same logical name.
    ///
    /// The old GPU is kept when it is still a candidate. Holders carry over.
    pub async fn restart(&self, instance_id: &str) -> Result<InstanceSummary, OrchestratorError> {
        let (teardown, request) = {
            let mut registry = self.inner.registry.lock().await;
            let Some(instance) = registry.instances.get(instance_id) else {
                return Err(OrchestratorError::ProcessNotFound(instance_id.to_string()));
            };
            if instance.state == InstanceState::Stopping {
                return Err(OrchestratorError::ProcessNotFound(instance_id.to_string()));
            }

            let request = StartRequest {
                instance_id: instance.instance_id.clone(),
                logical_name: instance.logical_name.clone(),
                gpu_hint: Some(instance.gpu_id),
                exclude_port: Some(instance.port),
                holders: instance.ref_count,
            };
            let teardown = Self::claim_teardown(&mut registry, instance_id, StopReason::Restart)
                .ok_or_else(|| OrchestratorError::ProcessNotFound(instance_id.to_string()))?;
            (teardown, request)
        };

        info!(
            instance_id = %request.instance_id,
            logical_name = %request.logical_name,
            gpu_id = ?request.gpu_hint,
            ref_count = request.holders,
            "Restarting instance"
        );
        self.finish_teardown(teardown).await;

        let result = self.ensure_running(request).await;
        if result.is_err() {
            self.inner.registry.lock().await.drop_holders(instance_id);
        }
        let outcome = if result.is_ok() { "ok" } else { "failed" };
        counter!("avatarmux_instance_restarts_total", "outcome" => outcome).increment(1);
        result
    }

    /// Snapshot of every registered instance.
    pub async fn list(&self) -> Vec<InstanceSummary> {
        let mut registry = self.inner.registry.lock().await;
        let mut summaries: Vec<InstanceSummary> = registry
            .instances
            .values_mut()
            .map(Instance::summary)
            .collect();
        summaries.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        summaries
    }

    /// Snapshot of one instance, by instance id or logical name.
    pub async fn info(&self, key: &str) -> Result<InstanceSummary, OrchestratorError> {
        let mut registry = self.inner.registry.lock().await;
        registry
            .resolve(key)
            .and_then(|id| registry.instances.get_mut(&id).map(Instance::summary))
            .ok_or_else(|| OrchestratorError::ProcessNotFound(key.to_string()))
    }

    /// System-wide counts and per-GPU distribution.
    pub async fn status(&self) -> StatusSummary {
        let gpus = self.gpu_readings().await.unwrap_or_default();

        let mut registry = self.inner.registry.lock().await;
        let mut starting: Vec<String> = registry
            .transitions
            .values()
            .filter(|t| matches!(t.kind, TransitionKind::Starting { .. }))
            .map(|t| t.instance_id.clone())
            .collect();
        starting.sort();

        let mut gpu_distribution = BTreeMap::new();
        let mut running = 0;
        for instance in registry.instances.values() {
            if instance.state == InstanceState::Running {
                *gpu_distribution.entry(instance.gpu_id).or_default() += 1;
                running += 1;
            }
        }
        // Stopping instances still hold their slot until the kill is confirmed
        let occupied = registry.instances.len() + starting.len();
        let total_refs = registry.instances.values().map(|i| i.ref_count).sum();
        let shared_instances = registry
            .instances
            .values()
            .filter(|i| i.ref_count > 1)
            .count();
        let sharing = registry.sharing.clone();
        let mut instances: Vec<InstanceSummary> = registry
            .instances
            .values_mut()
            .map(Instance::summary)
            .collect();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        StatusSummary {
            running,
            capacity: self.inner.max_instances,
            available: self.inner.max_instances.saturating_sub(occupied),
            gpu_distribution,
            total_refs,
            shared_instances,
            sharing,
            starting,
            instances,
            gpus,
        }
    }

    /// Restart every instance whose worker process has died.
    pub async fn health_check_tick(&self) -> SweepReport {
        let dead: Vec<String> = {
            let mut registry = self.inner.registry.lock().await;
            registry
                .instances
                .values_mut()
                .filter_map(|i| {
                    (i.state == InstanceState::Running && !i.is_healthy())
                        .then(|| i.instance_id.clone())
                })
                .collect()
        };

        let mut report = SweepReport::default();
        for instance_id in dead {
            warn!(instance_id = %instance_id, "Worker process died, restarting");
            match self.restart(&instance_id).await {
                Ok(summary) => {
                    info!(
                        instance_id = %instance_id,
                        port = summary.port,
                        gpu_id = summary.gpu_id,
                        "Restarted dead worker"
                    );
                    report.restarted.push(instance_id);
                }
                Err(e) => {
                    error!(instance_id = %instance_id, error = %e, "Failed to restart dead worker");
                    report.failed.push(instance_id);
                }
            }
        }
        report
    }

    /// Tear down instances with no holders that have been idle longer than
    /// `idle_timeout_secs`. Non-positive values disable the reaper.
    pub async fn idle_sweep_tick(&self, idle_timeout_secs: i64) -> SweepReport {
        let Ok(secs) = u64::try_from(idle_timeout_secs) else {
            return SweepReport::default();
        };
        if secs == 0 {
            return SweepReport::default();
        }
        self.reap_idle(Duration::from_secs(secs)).await
    }

    async fn reap_idle(&self, idle_timeout: Duration) -> SweepReport {
        let teardowns: Vec<Teardown> = {
            let mut registry = self.inner.registry.lock().await;
            let idle: Vec<String> = registry
                .instances
                .values()
                .filter(|i| {
                    i.state == InstanceState::Running
                        && i.ref_count == 0
                        && i.last_active.elapsed() > idle_timeout
                })
                .map(|i| i.instance_id.clone())
                .collect();
            idle.iter()
                .filter_map(|id| Self::claim_teardown(&mut registry, id, StopReason::Idle))
                .collect()
        };

        let mut report = SweepReport::default();
        for teardown in teardowns {
            info!(
                instance_id = %teardown.instance_id,
                idle_timeout_secs = idle_timeout.as_secs_f64(),
                "Reaping idle instance"
            );
            report.reaped.push(teardown.instance_id.clone());
            self.finish_teardown(teardown).await;
        }
        report
    }

    /// Force-stop every instance.
    pub async fn stop_all(&self) -> usize {
        let teardowns: Vec<Teardown> = {
            let mut registry = self.inner.registry.lock().await;
            let ids: Vec<String> = registry.instances.keys().cloned().collect();
            ids.iter()
                .filter_map(|id| Self::claim_teardown(&mut registry, id, StopReason::Forced))
                .collect()
        };

        let count = teardowns.len();
        info!(count, "Stopping all instances");
        for teardown in teardowns {
            self.finish_teardown(teardown).await;
        }
        count
    }

    /// Stop everything before the process exits.
    pub async fn shutdown(&self) {
        let stopped = self.stop_all().await;
        info!(stopped, "Orchestrator shut down");
    }

    async fn ensure_running(
        &self,
        request: StartRequest,
    ) -> Result<InstanceSummary, OrchestratorError> {
        let instance_id = request.instance_id.clone();
        let this = self.clone();
        // Detached: a caller that gives up cannot interrupt commit or rollback
        tokio::spawn(async move { this.ensure_running_inner(request).await })
            .await
            .unwrap_or_else(|e| {
                Err(OrchestratorError::SpawnFailed {
                    instance_id,
                    reason: format!("start task failed: {e}"),
                })
            })
    }

    async fn ensure_running_inner(
        &self,
        request: StartRequest,
    ) -> Result<InstanceSummary, OrchestratorError> {
        let name = request.logical_name.as_str();
        // Fetched outside the lock, at most once per start
        let mut readings: Option<Option<Vec<GpuMemory>>> = None;

        let (port, gpu_id) = loop {
            let mut registry = self.inner.registry.lock().await;

            // Another start or stop for this name is in flight: wait, then re-check
            if let Some(mut done) = registry.transition_waiter(name) {
                drop(registry);
                debug!(logical_name = %name, "Logical name is in transition, waiting");
                let _ = done.changed().await;
                continue;
            }

            if let Some(existing_id) = registry.sharing.get(name).cloned() {
                match registry.instances.get_mut(&existing_id) {
                    Some(instance) => {
                        if instance.is_healthy() {
                            instance.ref_count += request.holders;
                            instance.touch();
                            let summary = instance.summary();
                            counter!("avatarmux_instance_shares_total").increment(1);
                            info!(
                                instance_id = %existing_id,
                                requested_by = %request.instance_id,
                                logical_name = %name,
                                ref_count = instance.ref_count,
                                "Sharing running instance"
                            );
                            if request.holders > 0 && request.instance_id != existing_id {
                                registry
                                    .holders
                                    .insert(request.instance_id.clone(), existing_id);
                            }
                            return Ok(summary);
                        }

                        warn!(
                            instance_id = %existing_id,
                            logical_name = %name,
                            "Shared instance is dead, tearing it down before starting fresh"
                        );
                        let teardown =
                            Self::claim_teardown(&mut registry, &existing_id, StopReason::Dead);
                        drop(registry);
                        if let Some(teardown) = teardown {
                            self.finish_teardown(teardown).await;
                        }
                        continue;
                    }
                    None => {
                        warn!(logical_name = %name, instance_id = %existing_id, "Dropping stale sharing entry");
                        registry.sharing.remove(name);
                    }
                }
            }

            if let Some(existing) = registry.claimed_name(&request.instance_id) {
                return Err(OrchestratorError::InstanceConflict {
                    instance_id: request.instance_id.clone(),
                    existing,
                    requested: name.to_string(),
                });
            }

            let live = registry.instances.len() + registry.starting_count();
            if live >= self.inner.max_instances {
                warn!(live, max = self.inner.max_instances, "Refusing start, at capacity");
                counter!("avatarmux_instance_starts_total", "outcome" => "capacity").increment(1);
                return Err(OrchestratorError::CapacityExceeded {
                    max: self.inner.max_instances,
                });
            }

            let hinted = request.gpu_hint.filter(|g| self.inner.gpus.is_candidate(*g));
            if hinted.is_none() && readings.is_none() {
                // Never hold the lock across nvidia-smi; re-check everything after
                drop(registry);
                readings = Some(self.gpu_readings().await);
                continue;
            }

            let port = match self.inner.ports.reserve(&mut registry, request.exclude_port) {
                Ok(port) => port,
                Err(_) if request.exclude_port.is_some() => {
                    debug!("No port besides the previous one, retrying with the full range");
                    self.inner.ports.reserve(&mut registry, None)?
                }
                Err(e) => {
                    counter!("avatarmux_instance_starts_total", "outcome" => "no_port")
                        .increment(1);
                    return Err(e);
                }
            };

            let gpu_id = match hinted {
                Some(gpu_id) => gpu_id,
                None => self.inner.gpus.select(
                    readings.as_ref().and_then(|r| r.as_deref()),
                    &registry.gpu_load(),
                ),
            };

            registry
                .sharing
                .insert(name.to_string(), request.instance_id.clone());
            registry.begin_transition(
                name,
                &request.instance_id,
                TransitionKind::Starting { gpu_id },
            );
            break (port, gpu_id);
        };

        info!(
            instance_id = %request.instance_id,
            logical_name = %name,
            port,
            gpu_id,
            "Starting worker"
        );
        let launch = LaunchSpec {
            instance_id: &request.instance_id,
            logical_name: name,
            port,
            gpu_id,
        };
        let spawn_started = Instant::now();
        let result = self.inner.supervisor.spawn_and_verify(&launch).await;
        histogram!("avatarmux_spawn_duration_seconds").record(spawn_started.elapsed().as_secs_f64());

        let mut registry = self.inner.registry.lock().await;
        // The committed instance holds the port from here on
        self.inner.ports.release(&mut registry, port);
        let outcome = match result {
            Ok(mut worker) if registry.instances.contains_key(&request.instance_id) => {
                // Never replace a registered instance; its worker would be orphaned
                let existing = registry
                    .claimed_name(&request.instance_id)
                    .unwrap_or_default();
                registry.unshare(name, &request.instance_id);
                registry.end_transition(name);
                drop(registry);
                self.inner.supervisor.kill(&mut worker).await;
                return Err(OrchestratorError::InstanceConflict {
                    instance_id: request.instance_id.clone(),
                    existing,
                    requested: name.to_string(),
                });
            }
            Ok(worker) => {
                let mut instance = Instance::new(
                    request.instance_id.clone(),
                    name.to_string(),
                    port,
                    gpu_id,
                    worker,
                    request.holders,
                );
                let summary = instance.summary();
                registry
                    .instances
                    .insert(request.instance_id.clone(), instance);
                counter!("avatarmux_instance_starts_total", "outcome" => "ok").increment(1);
                gauge!("avatarmux_instances_running").set(registry.instances.len() as f64);
                info!(
                    instance_id = %request.instance_id,
                    port,
                    gpu_id,
                    ref_count = request.holders,
                    "Instance running"
                );
                Ok(summary)
            }
            Err(e) => {
                registry.unshare(name, &request.instance_id);
                counter!("avatarmux_instance_starts_total", "outcome" => "failed").increment(1);
                error!(
                    instance_id = %request.instance_id,
                    port,
                    gpu_id,
                    error = %e,
                    "Start failed, rolled back"
                );
                Err(e)
            }
        };
        registry.end_transition(name);
        outcome
    }

    async fn gpu_readings(&self) -> Option<Vec<GpuMemory>> {
        match self.inner.telemetry.snapshot().await {
            Ok(readings) => Some(readings),
            Err(e) => {
                debug!(error = %e, "GPU telemetry unavailable");
                None
            }
        }
    }

    /// Mark an instance Stopping and take its worker. Must hold the lock.
    fn claim_teardown(
        registry: &mut Registry,
        instance_id: &str,
        reason: StopReason,
    ) -> Option<Teardown> {
        let instance = registry.instances.get_mut(instance_id)?;
        if instance.state == InstanceState::Stopping {
            return None;
        }
        instance.state = InstanceState::Stopping;
        let teardown = Teardown {
            instance_id: instance.instance_id.clone(),
            logical_name: instance.logical_name.clone(),
            port: instance.port,
            worker: instance.worker.take(),
            reason,
        };
        registry.begin_transition(
            &teardown.logical_name,
            &teardown.instance_id,
            TransitionKind::Stopping,
        );
        Some(teardown)
    }

    /// Kill, wait for GPU memory to be reclaimed, then drop the instance.
    async fn finish_teardown(&self, mut teardown: Teardown) {
        info!(
            instance_id = %teardown.instance_id,
            port = teardown.port,
            reason = teardown.reason.as_str(),
            "Stopping instance"
        );
        if let Some(worker) = teardown.worker.as_mut() {
            self.inner.supervisor.kill(worker).await;
        }
        tokio::time::sleep(self.inner.gpu_release_grace).await;
        if let Some(worker) = &teardown.worker {
            self.inner.supervisor.remove_log(worker).await;
        }

        let mut registry = self.inner.registry.lock().await;
        registry.instances.remove(&teardown.instance_id);
        registry.unshare(&teardown.logical_name, &teardown.instance_id);
        // Holders follow a restarted worker; everything else ends their hold
        if !matches!(teardown.reason, StopReason::Restart) {
            registry.drop_holders(&teardown.instance_id);
        }
        self.inner.ports.release(&mut registry, teardown.port);
        registry.end_transition(&teardown.logical_name);

        counter!("avatarmux_instance_stops_total", "reason" => teardown.reason.as_str())
            .increment(1);
        gauge!("avatarmux_instances_running").set(registry.instances.len() as f64);
        info!(instance_id = %teardown.instance_id, "Instance stopped");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Last handle gone: kill all worker groups so nothing outlives us
        for instance in self.registry.get_mut().instances.values_mut() {
            if let Some(worker) = instance.worker.as_mut() {
                debug!(instance_id = %instance.instance_id, "Killing worker on drop");
                worker.start_kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use std::collections::HashMap;

    fn config(command: &str, args: &[&str], log_dir: &std::path::Path) -> Config {
        let mut config = Config::new(WorkerConfig {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            working_dir: None,
            env: HashMap::new(),
        });
        config.base_port = 29_400;
        config.max_instances = 2;
        config.gpus = vec![1, 0];
        config.startup_grace_ms = 100;
        config.bind_timeout_secs = 1;
        config.bind_poll_interval_ms = 20;
        config.gpu_release_grace_ms = 0;
        config.log_dir = log_dir.to_path_buf();
        config
    }

    fn orchestrator(config: &Config) -> Orchestrator {
        Orchestrator::with_collaborators(
            config,
            Arc::new(NoTelemetry),
            Arc::new(ports::tests::FixedListeners::default()),
        )
    }

    #[tokio::test]
    async fn failed_start_rolls_back_everything() {
        let dir = tempfile::tempdir().unwrap();
        let config = config("sh", &["-c", "exit 1"], dir.path());
        let orch = orchestrator(&config);

        let err = orch.start("tutorA#1", "tutorA").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ImmediateExit { .. }));
        assert!(err.is_retryable());

        let registry = orch.inner.registry.lock().await;
        assert!(registry.instances.is_empty());
        assert!(registry.sharing.is_empty());
        assert!(registry.reservations.is_empty());
        assert!(registry.transitions.is_empty());
    }

    #[tokio::test]
    async fn stop_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&config("true", &[], dir.path()));
        assert_eq!(orch.stop("ghost", true).await, ReleaseOutcome::NotFound);
        assert_eq!(orch.stop("ghost", false).await, ReleaseOutcome::NotFound);
        assert!(matches!(
            orch.restart("ghost").await,
            Err(OrchestratorError::ProcessNotFound(_))
        ));
        assert!(orch.info("ghost").await.is_err());
    }

    #[tokio::test]
    async fn idle_sweep_disabled_for_non_positive_timeouts() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&config("true", &[], dir.path()));
        assert!(orch.idle_sweep_tick(0).await.reaped.is_empty());
        assert!(orch.idle_sweep_tick(-5).await.reaped.is_empty());
    }

    #[tokio::test]
    async fn empty_status_reports_full_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&config("true", &[], dir.path()));
        let status = orch.status().await;
        assert_eq!(status.running, 0);
        assert_eq!(status.capacity, 2);
        assert_eq!(status.available, 2);
        assert!(status.gpus.is_empty());
    }
}
