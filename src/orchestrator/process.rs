//! Worker process lifecycle: spawn, readiness verification and tree kill.

use crate::config::WorkerConfig;
use crate::types::OrchestratorError;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, trace, warn};

/// Per-attempt connect timeout for the readiness probe.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Lines of worker output included in an immediate-exit error.
const LOG_TAIL_LINES: usize = 10;

/// Upper bound on the log excerpt carried in errors.
const LOG_TAIL_MAX_CHARS: usize = 500;

/// Strip ANSI escape sequences from a string.
pub(super) fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // Skip until we hit a letter (end of escape sequence)
            for c2 in chars.by_ref() {
                if c2.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn sanitize_for_filename(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// `<log_dir>/avatar_<instance>_<port>.log`
pub(super) fn build_log_path(log_dir: &Path, instance_id: &str, port: u16) -> PathBuf {
    let safe_name = sanitize_for_filename(instance_id);
    log_dir.join(format!("avatar_{safe_name}_{port}.log"))
}

/// Everything that varies between two launches of the worker command.
#[derive(Debug, Clone, Copy)]
pub struct LaunchSpec<'a> {
    pub instance_id: &'a str,
    pub logical_name: &'a str,
    pub port: u16,
    pub gpu_id: u32,
}

impl LaunchSpec<'_> {
    fn expand(&self, template: &str) -> String {
        template
            .replace("{port}", &self.port.to_string())
            .replace("{gpu}", &self.gpu_id.to_string())
            .replace("{name}", self.logical_name)
            .replace("{instance}", self.instance_id)
    }
}

/// A spawned worker process.
#[derive(Debug)]
pub struct WorkerHandle {
    child: Child,
    pid: u32,
    log_path: PathBuf,
    exit: Option<ExitStatus>,
    killed: bool,
}

impl WorkerHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Exit status if the root process has exited. Reaps it on first observation.
    pub fn exited(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(status) => self.exit = status,
                Err(e) => {
                    warn!(pid = self.pid, error = %e, "Failed to check process status");
                }
            }
        }
        self.exit
    }

    pub fn is_alive(&mut self) -> bool {
        !self.killed && self.exited().is_none()
    }

    /// Fire-and-forget SIGKILL to the whole process group, for use from `Drop`.
    pub(super) fn start_kill(&mut self) {
        if self.killed {
            return;
        }
        let _ = self.child.start_kill();
        kill_process_group(self.pid);
        self.killed = true;
    }
}

/// Timing and placement knobs for spawned workers.
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub log_dir: PathBuf,
    pub startup_grace: Duration,
    pub bind_timeout: Duration,
    pub poll_interval: Duration,
}

/// Spawns workers from a command template and kills them with all descendants.
pub struct ProcessSupervisor {
    worker: WorkerConfig,
    options: SupervisorOptions,
}

impl ProcessSupervisor {
    pub fn new(worker: WorkerConfig, options: SupervisorOptions) -> Self {
        Self { worker, options }
    }

    fn spawn_failed(launch: &LaunchSpec<'_>, reason: String) -> OrchestratorError {
        OrchestratorError::SpawnFailed {
            instance_id: launch.instance_id.to_string(),
            reason,
        }
    }

    /// Launch a worker without waiting for it.
    fn spawn(&self, launch: &LaunchSpec<'_>) -> Result<WorkerHandle, OrchestratorError> {
        let log_dir = &self.options.log_dir;
        std::fs::create_dir_all(log_dir).map_err(|e| {
            Self::spawn_failed(
                launch,
                format!("failed to create log dir {}: {e}", log_dir.display()),
            )
        })?;

        let log_path = build_log_path(log_dir, launch.instance_id, launch.port);
        let stdout_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| {
                Self::spawn_failed(
                    launch,
                    format!("failed to open {}: {e}", log_path.display()),
                )
            })?;
        let stderr_file = stdout_file.try_clone().map_err(|e| {
            Self::spawn_failed(
                launch,
                format!("failed to clone log handle {}: {e}", log_path.display()),
            )
        })?;

        let args: Vec<String> = self.worker.args.iter().map(|a| launch.expand(a)).collect();
        debug!(
            instance_id = %launch.instance_id,
            command = %self.worker.command,
            args = ?args,
            "Worker command"
        );

        // Own process group so the whole tree can be signalled at once
        let mut cmd = Command::new(&self.worker.command);
        cmd.args(&args)
            .envs(&self.worker.env)
            .env("AVATAR_PORT", launch.port.to_string())
            .env("AVATAR_NAME", launch.logical_name)
            .env("AVATAR_INSTANCE_ID", launch.instance_id)
            .env("CUDA_VISIBLE_DEVICES", launch.gpu_id.to_string())
            .env("NO_COLOR", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file))
            .process_group(0);
        if let Some(dir) = &self.worker.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| Self::spawn_failed(launch, e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| Self::spawn_failed(launch, "process exited before its pid was read".into()))?;

        Ok(WorkerHandle {
            child,
            pid,
            log_path,
            exit: None,
            killed: false,
        })
    }

    /// Spawn a worker and wait until it accepts TCP connections on its port.
    ///
    /// On any failure the process tree has been killed before this returns.
    pub async fn spawn_and_verify(
        &self,
        launch: &LaunchSpec<'_>,
    ) -> Result<WorkerHandle, OrchestratorError> {
        let mut handle = self.spawn(launch)?;
        info!(
            instance_id = %launch.instance_id,
            logical_name = %launch.logical_name,
            port = launch.port,
            gpu_id = launch.gpu_id,
            pid = handle.pid,
            log = %handle.log_path.display(),
            "Spawned worker process"
        );

        tokio::time::sleep(self.options.startup_grace).await;
        if let Some(status) = handle.exited() {
            return Err(self.immediate_exit(launch, &mut handle, status).await);
        }

        let started = Instant::now();
        let deadline = started + self.options.bind_timeout;
        loop {
            if port_accepts(launch.port).await {
                info!(
                    instance_id = %launch.instance_id,
                    port = launch.port,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Worker is accepting connections"
                );
                return Ok(handle);
            }

            if let Some(status) = handle.exited() {
                return Err(self.immediate_exit(launch, &mut handle, status).await);
            }

            if Instant::now() >= deadline {
                error!(
                    instance_id = %launch.instance_id,
                    port = launch.port,
                    timeout_secs = self.options.bind_timeout.as_secs_f64(),
                    "Worker did not bind its port in time"
                );
                self.kill(&mut handle).await;
                return Err(OrchestratorError::BindTimeout {
                    instance_id: launch.instance_id.to_string(),
                    port: launch.port,
                    timeout: self.options.bind_timeout,
                });
            }

            trace!(port = launch.port, "Port not accepting yet");
            tokio::time::sleep(self.options.poll_interval).await;
        }
    }

    async fn immediate_exit(
        &self,
        launch: &LaunchSpec<'_>,
        handle: &mut WorkerHandle,
        status: ExitStatus,
    ) -> OrchestratorError {
        let log_tail = read_log_tail(&handle.log_path).await;
        error!(
            instance_id = %launch.instance_id,
            status = %status,
            log = %handle.log_path.display(),
            tail = %log_tail,
            "Worker exited during startup"
        );
        // Helpers it forked may still hold the port or GPU
        self.kill(handle).await;
        OrchestratorError::ImmediateExit {
            instance_id: launch.instance_id.to_string(),
            log_path: handle.log_path.clone(),
            log_tail,
        }
    }

    /// Kill the worker and all of its descendants, then reap it.
    ///
    /// Descendants go first, deepest first, so nothing is re-parented to
    /// init before it is signalled. Calling this twice is a no-op.
    pub async fn kill(&self, handle: &mut WorkerHandle) {
        if handle.killed {
            return;
        }
        handle.killed = true;
        let pid = handle.pid;

        // Once reaped the pid may be reused; only the group is still ours
        if handle.exited().is_none() {
            let descendants = find_all_descendants(pid);
            debug!(pid, descendants = ?descendants, "Killing worker process tree");
            for &child in descendants.iter().rev() {
                signal_kill(child);
            }
            signal_kill(pid);
        }
        kill_process_group(pid);

        match handle.child.wait().await {
            Ok(status) => {
                handle.exit = Some(status);
                info!(pid, status = %status, "Worker process terminated");
            }
            Err(e) => warn!(pid, error = %e, "Failed to reap worker process"),
        }
    }

    /// Delete a worker's log file. Missing files are fine.
    pub async fn remove_log(&self, handle: &WorkerHandle) {
        match tokio::fs::remove_file(&handle.log_path).await {
            Ok(()) => debug!(log = %handle.log_path.display(), "Removed worker log"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(log = %handle.log_path.display(), error = %e, "Failed to remove worker log")
            }
        }
    }
}

/// Whether something accepts TCP connections on `127.0.0.1:port`.
pub(super) async fn port_accepts(port: u16) -> bool {
    matches!(
        tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Last lines of a worker log, ANSI-stripped and length-capped.
pub(super) async fn read_log_tail(path: &Path) -> String {
    let Ok(bytes) = tokio::fs::read(path).await else {
        return String::new();
    };
    let text = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(LOG_TAIL_LINES);
    let tail = strip_ansi(&lines[start..].join("\n"));

    let skip = tail.chars().count().saturating_sub(LOG_TAIL_MAX_CHARS);
    tail.chars().skip(skip).collect()
}

fn signal_kill(pid: u32) {
    // SAFETY: signalling a pid we spawned or found beneath it
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

fn kill_process_group(pgid: u32) {
    // SAFETY: the worker was spawned with process_group(0), so its pid is the pgid
    unsafe {
        libc::kill(-(pgid as libc::pid_t), libc::SIGKILL);
    }
}

/// Get direct child PIDs of a process.
fn find_child_pids(pid: u32) -> Vec<u32> {
    if let Ok(tasks) = std::fs::read_dir(format!("/proc/{pid}/task")) {
        let mut children = Vec::new();
        for task in tasks.flatten() {
            if let Ok(list) = std::fs::read_to_string(task.path().join("children")) {
                children.extend(list.split_whitespace().filter_map(|p| p.parse::<u32>().ok()));
            }
        }
        return children;
    }

    let output = std::process::Command::new("pgrep")
        .args(["-P", &pid.to_string()])
        .output()
        .ok();

    match output {
        Some(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter_map(|line| line.trim().parse::<u32>().ok())
            .collect(),
        _ => vec![],
    }
}

/// Recursively find all descendant PIDs of a process, parents before children.
fn find_all_descendants(pid: u32) -> Vec<u32> {
    let mut result = Vec::new();
    for child in find_child_pids(pid) {
        result.push(child);
        result.extend(find_all_descendants(child));
    }
    result
}
