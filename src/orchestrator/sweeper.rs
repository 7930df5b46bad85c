//! Periodic health check and idle reaping, independent of traffic.

use super::Orchestrator;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Dead workers brought back up
    pub restarted: Vec<String>,
    /// Dead workers that could not be restarted and are now gone
    pub failed: Vec<String>,
    /// Idle workers torn down
    pub reaped: Vec<String>,
}

impl SweepReport {
    fn merge(mut self, other: SweepReport) -> Self {
        self.restarted.extend(other.restarted);
        self.failed.extend(other.failed);
        self.reaped.extend(other.reaped);
        self
    }

    fn is_empty(&self) -> bool {
        self.restarted.is_empty() && self.failed.is_empty() && self.reaped.is_empty()
    }
}

pub struct LifecycleSweeper {
    orchestrator: Orchestrator,
    interval: Duration,
    idle_timeout_secs: i64,
}

impl LifecycleSweeper {
    pub fn new(orchestrator: Orchestrator, interval: Duration, idle_timeout_secs: i64) -> Self {
        Self {
            orchestrator,
            interval,
            idle_timeout_secs,
        }
    }

    /// Health check followed by the idle reaper.
    pub async fn tick(&self) -> SweepReport {
        let health = self.orchestrator.health_check_tick().await;
        let idle = self
            .orchestrator
            .idle_sweep_tick(self.idle_timeout_secs)
            .await;
        health.merge(idle)
    }

    /// Run [`tick`](Self::tick) on a fixed interval until the task is aborted.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        info!(
            interval_secs = self.interval.as_secs_f64(),
            idle_timeout_secs = self.idle_timeout_secs,
            "Spawning lifecycle sweeper"
        );

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick fires immediately; nothing to sweep yet
            tick.tick().await;

            loop {
                tick.tick().await;
                let report = self.tick().await;
                if !report.is_empty() {
                    info!(
                        restarted = report.restarted.len(),
                        failed = report.failed.len(),
                        reaped = report.reaped.len(),
                        "Sweep finished"
                    );
                } else {
                    debug!("Sweep found nothing to do");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_both_sides() {
        let a = SweepReport {
            restarted: vec!["a".into()],
            ..Default::default()
        };
        let b = SweepReport {
            reaped: vec!["b".into()],
            ..Default::default()
        };
        let merged = a.merge(b);
        assert_eq!(merged.restarted, vec!["a"]);
        assert_eq!(merged.reaped, vec!["b"]);
        assert!(!merged.is_empty());
        assert!(SweepReport::default().is_empty());
    }
}
