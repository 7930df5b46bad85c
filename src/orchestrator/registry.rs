//! Registry state guarded by the orchestrator lock.
//!
//! Everything here is plain data; the orchestrator owns the single mutex and
//! is the only writer.

use super::process::WorkerHandle;
use crate::types::InstanceSummary;
use std::collections::{HashMap, HashSet};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InstanceState {
    Running,
    /// Kill in progress; port and GPU stay claimed until it is confirmed.
    Stopping,
}

pub(crate) struct Instance {
    pub instance_id: String,
    pub logical_name: String,
    pub port: u16,
    pub gpu_id: u32,
    /// Taken out while the worker is being killed.
    pub worker: Option<WorkerHandle>,
    pub started_at: SystemTime,
    pub started: Instant,
    pub last_active: Instant,
    pub ref_count: u32,
    pub state: InstanceState,
}

impl Instance {
    pub fn new(
        instance_id: String,
        logical_name: String,
        port: u16,
        gpu_id: u32,
        worker: WorkerHandle,
        ref_count: u32,
    ) -> Self {
        let now = Instant::now();
        Self {
            instance_id,
            logical_name,
            port,
            gpu_id,
            worker: Some(worker),
            started_at: SystemTime::now(),
            started: now,
            last_active: now,
            ref_count,
            state: InstanceState::Running,
        }
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Running and its process has not exited.
    pub fn is_healthy(&mut self) -> bool {
        self.state == InstanceState::Running
            && self.worker.as_mut().is_some_and(|w| w.is_alive())
    }

    pub fn summary(&mut self) -> InstanceSummary {
        let running = self.is_healthy();
        let (pid, log_path) = match &self.worker {
            Some(w) => (Some(w.pid()), w.log_path().to_path_buf()),
            None => (None, Default::default()),
        };
        InstanceSummary {
            instance_id: self.instance_id.clone(),
            logical_name: self.logical_name.clone(),
            port: self.port,
            gpu_id: self.gpu_id,
            pid,
            ref_count: self.ref_count,
            running,
            started_at: self
                .started_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            uptime_seconds: self.started.elapsed().as_secs_f64(),
            idle_seconds: self.last_active.elapsed().as_secs_f64(),
            endpoint: format!("http://127.0.0.1:{}", self.port),
            log_path,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransitionKind {
    Starting { gpu_id: u32 },
    Stopping,
}

/// A logical name that is mid-start or mid-stop.
///
/// Waiters subscribe to `done`; dropping the transition closes the channel
/// and wakes all of them.
pub(crate) struct Transition {
    pub instance_id: String,
    pub kind: TransitionKind,
    done: watch::Sender<()>,
}

#[derive(Default)]
pub(crate) struct Registry {
    /// instance_id -> instance
    pub instances: HashMap<String, Instance>,
    /// logical_name -> instance_id
    pub sharing: HashMap<String, String>,
    /// Ports claimed by an in-flight start, not yet confirmed bound
    pub reservations: HashSet<u16>,
    /// logical_name -> in-progress start or stop
    pub transitions: HashMap<String, Transition>,
    /// holder instance_id -> instance_id of the worker it joined
    pub holders: HashMap<String, String>,
}

impl Registry {
    /// Ports held by registered instances, including ones being stopped.
    pub fn live_ports(&self) -> HashSet<u16> {
        self.instances.values().map(|i| i.port).collect()
    }

    /// Instances per GPU, counting starts that already picked a GPU.
    pub fn gpu_load(&self) -> HashMap<u32, usize> {
        let mut load = HashMap::new();
        for instance in self.instances.values() {
            *load.entry(instance.gpu_id).or_default() += 1;
        }
        for transition in self.transitions.values() {
            if let TransitionKind::Starting { gpu_id, .. } = transition.kind {
                *load.entry(gpu_id).or_default() += 1;
            }
        }
        load
    }

    pub fn starting_count(&self) -> usize {
        self.transitions
            .values()
            .filter(|t| matches!(t.kind, TransitionKind::Starting { .. }))
            .count()
    }

    pub fn begin_transition(&mut self, logical_name: &str, instance_id: &str, kind: TransitionKind) {
        let (done, _) = watch::channel(());
        self.transitions.insert(
            logical_name.to_string(),
            Transition {
                instance_id: instance_id.to_string(),
                kind,
                done,
            },
        );
    }

    pub fn end_transition(&mut self, logical_name: &str) {
        self.transitions.remove(logical_name);
    }

    /// Receiver that resolves once the current transition for `logical_name`
    /// ends, or `None` if there is none.
    pub fn transition_waiter(&self, logical_name: &str) -> Option<watch::Receiver<()>> {
        self.transitions
            .get(logical_name)
            .map(|t| t.done.subscribe())
    }

    /// Map an instance id, a holder id or a logical name to a registered
    /// instance id.
    pub fn resolve(&self, key: &str) -> Option<String> {
        if self.instances.contains_key(key) {
            return Some(key.to_string());
        }
        self.holders
            .get(key)
            .or_else(|| self.sharing.get(key))
            .filter(|id| self.instances.contains_key(*id))
            .cloned()
    }

    /// Logical name already bound to `instance_id`, whether as a registered
    /// instance, a start in flight, or a holder of a shared worker.
    pub fn claimed_name(&self, instance_id: &str) -> Option<String> {
        if let Some(instance) = self.instances.get(instance_id) {
            return Some(instance.logical_name.clone());
        }
        if let Some((name, _)) = self
            .transitions
            .iter()
            .find(|(_, t)| t.instance_id == instance_id)
        {
            return Some(name.clone());
        }
        self.holders
            .get(instance_id)
            .and_then(|owner| self.instances.get(owner))
            .map(|i| i.logical_name.clone())
    }

    /// Forget every holder that joined `instance_id`.
    pub fn drop_holders(&mut self, instance_id: &str) {
        self.holders.retain(|_, owner| owner != instance_id);
    }

    /// Drop the sharing entry for `logical_name` if it still points at `instance_id`.
    pub fn unshare(&mut self, logical_name: &str, instance_id: &str) {
        if self.sharing.get(logical_name).map(String::as_str) == Some(instance_id) {
            self.sharing.remove(logical_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starting_transitions_count_toward_gpu_load() {
        let mut registry = Registry::default();
        registry.begin_transition(
            "tutorA",
            "tutorA#1",
            TransitionKind::Starting { gpu_id: 1 },
        );
        registry.begin_transition("tutorB", "tutorB#1", TransitionKind::Stopping);

        assert_eq!(registry.gpu_load().get(&1), Some(&1));
        assert_eq!(registry.starting_count(), 1);
    }

    #[tokio::test]
    async fn ending_a_transition_wakes_waiters() {
        let mut registry = Registry::default();
        registry.begin_transition("tutorA", "tutorA#1", TransitionKind::Stopping);
        let mut waiter = registry.transition_waiter("tutorA").unwrap();

        registry.end_transition("tutorA");
        // Sender dropped: changed() resolves with an error instead of hanging
        assert!(waiter.changed().await.is_err());
        assert!(registry.transition_waiter("tutorA").is_none());
    }

    #[test]
    fn unshare_only_removes_matching_entry() {
        let mut registry = Registry::default();
        registry
            .sharing
            .insert("tutorA".to_string(), "tutorA#2".to_string());

        registry.unshare("tutorA", "tutorA#1");
        assert_eq!(registry.sharing.get("tutorA").unwrap(), "tutorA#2");

        registry.unshare("tutorA", "tutorA#2");
        assert!(registry.sharing.is_empty());
    }

    #[test]
    fn claimed_name_sees_in_flight_starts() {
        let mut registry = Registry::default();
        registry.begin_transition("A", "x#1", TransitionKind::Starting { gpu_id: 0 });
        assert_eq!(registry.claimed_name("x#1").as_deref(), Some("A"));
        assert_eq!(registry.claimed_name("y#1"), None);

        registry.end_transition("A");
        assert_eq!(registry.claimed_name("x#1"), None);
    }

    #[test]
    fn drop_holders_only_removes_joiners_of_that_instance() {
        let mut registry = Registry::default();
        registry.holders.insert("tutorA#2".into(), "tutorA#1".into());
        registry.holders.insert("tutorB#2".into(), "tutorB#1".into());

        registry.drop_holders("tutorA#1");
        assert_eq!(registry.holders.len(), 1);
        assert!(registry.holders.contains_key("tutorB#2"));
    }

    #[test]
    fn resolve_ignores_dangling_sharing_entries() {
        let mut registry = Registry::default();
        registry
            .sharing
            .insert("tutorA".to_string(), "tutorA#1".to_string());
        registry
            .holders
            .insert("tutorA#2".to_string(), "tutorA#1".to_string());
        assert_eq!(registry.resolve("tutorA"), None);
        assert_eq!(registry.resolve("tutorA#1"), None);
        assert_eq!(registry.resolve("tutorA#2"), None);
    }
}
