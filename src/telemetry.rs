//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded by the orchestrator using the `metrics` crate's
//! macros. This module installs the Prometheus exporter, registers
//! human-readable descriptions and builds the `/metrics` router.

use axum::{Router, extract::State, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests where
/// multiple `build_app` calls share a process). Recording still works; the
/// macros route to whichever recorder was installed first.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

/// Router serving the Prometheus text format at `/metrics`.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/metrics", get(render))
        .with_state(handle)
}

async fn render(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

fn describe() {
    // -- Lifecycle --
    describe_counter!(
        "avatarmux_instance_starts_total",
        "Worker start attempts by outcome (ok, failed, capacity, no_port)"
    );
    describe_counter!(
        "avatarmux_instance_shares_total",
        "Starts satisfied by an already running worker"
    );
    describe_counter!(
        "avatarmux_instance_stops_total",
        "Worker teardowns by reason (released, forced, restart, dead, idle)"
    );
    describe_counter!(
        "avatarmux_instance_restarts_total",
        "Worker restarts by outcome"
    );

    // -- Pool --
    describe_gauge!(
        "avatarmux_instances_running",
        "Workers currently registered"
    );
    describe_histogram!(
        "avatarmux_spawn_duration_seconds",
        "Time from spawn until the worker accepted connections or failed"
    );
}
