//! End-to-end tests for the avatarmux control API.
//!
//! Drives the axum router in-process with `oneshot` against an orchestrator
//! that launches real `mock-worker` processes.

use avatarmux::{Config, NoTelemetry, Orchestrator, ProcNetListeners, WorkerConfig};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use serial_test::serial;
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;

// ── Helpers ─────────────────────────────────────────────────────────────────

fn test_config(base_port: u16, log_dir: &std::path::Path) -> Config {
    let mut config = Config::new(WorkerConfig {
        command: env!("CARGO_BIN_EXE_mock-worker").to_string(),
        args: vec!["--port".to_string(), "{port}".to_string()],
        working_dir: None,
        env: HashMap::new(),
    });
    config.base_port = base_port;
    config.port_count = Some(5);
    config.max_instances = 2;
    config.startup_grace_ms = 200;
    config.bind_timeout_secs = 10;
    config.bind_poll_interval_ms = 50;
    config.gpu_release_grace_ms = 0;
    config.health_check_interval_secs = 0;
    config.gpu_telemetry = avatarmux::GpuTelemetryMode::Disabled;
    config.log_dir = log_dir.to_path_buf();
    config
}

async fn build(config: Config) -> (axum::Router, Orchestrator) {
    let orchestrator =
        Orchestrator::with_collaborators(&config, Arc::new(NoTelemetry), Arc::new(ProcNetListeners));
    let (control, metrics, orchestrator) = avatarmux::build_app_with(config, orchestrator)
        .await
        .unwrap();
    assert!(metrics.is_none());
    (control, orchestrator)
}

async fn call(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
#[serial]
async fn start_share_disconnect_flow() {
    let dir = tempfile::tempdir().unwrap();
    let (app, orchestrator) = build(test_config(23_000, dir.path())).await;

    let (status, body) = call(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");

    let (status, body) = call(
        &app,
        "POST",
        "/avatar/start",
        Some(json!({"instance_id": "tutorA#1", "logical_name": "tutorA"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "success");
    assert_eq!(body["instance"]["port"], 23_000);
    assert_eq!(body["instance"]["ref_count"], 1);
    assert_eq!(body["instance"]["endpoint"], "http://127.0.0.1:23000");

    let (_, body) = call(
        &app,
        "POST",
        "/avatar/start",
        Some(json!({"instance_id": "tutorA#2", "logical_name": "tutorA"})),
    )
    .await;
    assert_eq!(body["instance"]["instance_id"], "tutorA#1");
    assert_eq!(body["instance"]["ref_count"], 2);

    let (status, body) = call(&app, "GET", "/avatar/info/tutorA%231", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["instance"]["logical_name"], "tutorA");

    let (_, body) = call(&app, "GET", "/status", None).await;
    assert_eq!(body["running"], 1);
    assert_eq!(body["total_refs"], 2);
    assert_eq!(body["sharing"]["tutorA"], "tutorA#1");

    let (_, body) = call(
        &app,
        "POST",
        "/avatar/disconnect",
        Some(json!({"instance_id": "tutorA#1"})),
    )
    .await;
    assert_eq!(body["outcome"], "released");
    assert_eq!(body["ref_count"], 1);

    let (_, body) = call(
        &app,
        "POST",
        "/avatar/disconnect",
        Some(json!({"instance_id": "tutorA#1"})),
    )
    .await;
    assert_eq!(body["outcome"], "stopped");

    let (_, body) = call(&app, "GET", "/avatar/list", None).await;
    assert_eq!(body["count"], 0);

    orchestrator.shutdown().await;
}

#[tokio::test]
#[serial]
async fn errors_map_to_statuses() {
    let dir = tempfile::tempdir().unwrap();
    let (app, orchestrator) = build(test_config(23_010, dir.path())).await;

    // Unknown ids: stop is success, info and restart are 404
    let (status, body) = call(
        &app,
        "POST",
        "/avatar/stop",
        Some(json!({"instance_id": "ghost"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "not_found");

    let (status, body) = call(&app, "GET", "/avatar/info/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "error");

    let (status, _) = call(
        &app,
        "POST",
        "/avatar/restart",
        Some(json!({"instance_id": "ghost"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Fill both slots, then a third name is refused
    for name in ["a", "b"] {
        let (status, _) = call(
            &app,
            "POST",
            "/avatar/start",
            Some(json!({"instance_id": format!("{name}#1"), "logical_name": name})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, body) = call(
        &app,
        "POST",
        "/avatar/start",
        Some(json!({"instance_id": "c#1", "logical_name": "c"})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["kind"], "capacity_exceeded");

    let (status, body) = call(
        &app,
        "POST",
        "/avatar/start",
        Some(json!({"instance_id": "a#1", "logical_name": "other"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["kind"], "conflict");

    let (_, body) = call(&app, "POST", "/avatar/stop-all", None).await;
    assert_eq!(body["stopped"], 2);

    orchestrator.shutdown().await;
}

#[tokio::test]
#[serial]
async fn failed_start_is_bad_gateway() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(23_020, dir.path());
    config.worker.args.extend(["--exit-after-ms".to_string(), "10".to_string()]);
    let (app, orchestrator) = build(config).await;

    let (status, body) = call(
        &app,
        "POST",
        "/avatar/start",
        Some(json!({"instance_id": "x#1", "logical_name": "x"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["kind"], "immediate_exit");

    let (_, body) = call(&app, "GET", "/status", None).await;
    assert_eq!(body["running"], 0);
    assert_eq!(body["available"], 2);

    orchestrator.shutdown().await;
}

#[tokio::test]
#[serial]
async fn manual_sweeps_and_prestart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(23_030, dir.path());
    config.prestart = vec![avatarmux::PrestartEntry {
        instance_id: "warm#1".to_string(),
        logical_name: "warm".to_string(),
    }];
    let (app, orchestrator) = build(config).await;

    let (_, body) = call(&app, "GET", "/avatar/info/warm", None).await;
    assert_eq!(body["instance"]["ref_count"], 0);

    let (status, body) = call(&app, "POST", "/sweep/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["restarted"], json!([]));

    tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
    let (_, body) = call(
        &app,
        "POST",
        "/sweep/idle",
        Some(json!({"idle_timeout_secs": 1})),
    )
    .await;
    assert_eq!(body["reaped"], json!(["warm#1"]));

    let (_, body) = call(&app, "GET", "/avatar/list", None).await;
    assert_eq!(body["count"], 0);

    orchestrator.shutdown().await;
}

#[tokio::test]
#[serial]
async fn background_sweeper_restarts_killed_worker() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(23_040, dir.path());
    config.health_check_interval_secs = 1;
    let (app, orchestrator) = build(config).await;

    let (status, body) = call(
        &app,
        "POST",
        "/avatar/start",
        Some(json!({"instance_id": "tutorA#1", "logical_name": "tutorA"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let old_pid = body["instance"]["pid"].as_u64().unwrap();

    std::process::Command::new("kill")
        .args(["-9", &old_pid.to_string()])
        .status()
        .unwrap();

    let mut new_pid = None;
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let (status, body) = call(&app, "GET", "/avatar/info/tutorA%231", None).await;
        if status == StatusCode::OK
            && body["instance"]["running"] == true
            && body["instance"]["pid"].as_u64() != Some(old_pid)
        {
            new_pid = body["instance"]["pid"].as_u64();
            break;
        }
    }
    assert!(new_pid.is_some(), "sweeper never restarted the worker");

    orchestrator.shutdown().await;
}
