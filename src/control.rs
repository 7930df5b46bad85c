//! Control API for the avatar pool.
//!
//! Every response body carries `"status": "success"` or `"status": "error"`.
//!
//! ## Endpoints
//!
//! | Method | Path                         | Description                                |
//! |--------|------------------------------|--------------------------------------------|
//! | GET    | `/health`                    | Liveness of the manager itself             |
//! | POST   | `/avatar/start`              | Acquire (start or share) a worker          |
//! | POST   | `/avatar/warm`               | Start a worker without holding it          |
//! | POST   | `/avatar/stop`               | Stop a worker (forced unless told otherwise)|
//! | POST   | `/avatar/disconnect`         | Release one holder                         |
//! | POST   | `/avatar/restart`            | Kill and respawn a worker                  |
//! | POST   | `/avatar/stop-all`           | Stop every worker                          |
//! | GET    | `/avatar/list`               | All instances                              |
//! | GET    | `/avatar/info/{instance_id}` | One instance                               |
//! | GET    | `/status`                    | Pool-wide counts and GPU distribution      |
//! | POST   | `/sweep/health`              | Run one health-check pass now              |
//! | POST   | `/sweep/idle`                | Run one idle-reaper pass now               |

use crate::orchestrator::{Orchestrator, SweepReport};
use crate::types::{InstanceSummary, OrchestratorError, ReleaseOutcome, StatusSummary};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

#[derive(Clone)]
struct ControlState {
    orchestrator: Orchestrator,
    idle_timeout_secs: i64,
}

/// Build the control API router.
///
/// `idle_timeout_secs` is used by `/sweep/idle` when the request names none.
pub fn control_router(orchestrator: Orchestrator, idle_timeout_secs: i64) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/avatar/start", post(start_instance))
        .route("/avatar/warm", post(warm_instance))
        .route("/avatar/stop", post(stop_instance))
        .route("/avatar/disconnect", post(disconnect_instance))
        .route("/avatar/restart", post(restart_instance))
        .route("/avatar/stop-all", post(stop_all))
        .route("/avatar/list", get(list_instances))
        .route("/avatar/info/{instance_id}", get(instance_info))
        .route("/status", get(status))
        .route("/sweep/health", post(sweep_health))
        .route("/sweep/idle", post(sweep_idle))
        .with_state(ControlState {
            orchestrator,
            idle_timeout_secs,
        })
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct StartRequest {
    instance_id: String,
    logical_name: String,
}

#[derive(Deserialize)]
struct StopRequest {
    instance_id: String,
    #[serde(default = "default_force")]
    force: bool,
}

fn default_force() -> bool {
    true
}

#[derive(Deserialize)]
struct InstanceRequest {
    instance_id: String,
}

#[derive(Deserialize, Default)]
struct IdleSweepRequest {
    idle_timeout_secs: Option<i64>,
}

#[derive(Serialize)]
struct Success<T: Serialize> {
    status: &'static str,
    #[serde(flatten)]
    body: T,
}

fn success<T: Serialize>(body: T) -> Json<Success<T>> {
    Json(Success {
        status: "success",
        body,
    })
}

#[derive(Serialize)]
struct InstanceBody {
    instance: InstanceSummary,
}

#[derive(Serialize)]
struct InstancesBody {
    count: usize,
    instances: Vec<InstanceSummary>,
}

#[derive(Serialize)]
struct ReleaseBody {
    instance_id: String,
    #[serde(flatten)]
    outcome: ReleaseOutcome,
}

#[derive(Serialize)]
struct StopAllBody {
    stopped: usize,
}

#[derive(Serialize)]
struct StatusBody {
    #[serde(flatten)]
    summary: StatusSummary,
}

#[derive(Serialize)]
struct SweepBody {
    #[serde(flatten)]
    report: SweepReport,
}

#[derive(Serialize)]
struct ErrorResponse {
    status: &'static str,
    kind: &'static str,
    error: String,
}

/// Orchestrator errors mapped onto HTTP statuses.
struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, kind) = match &self.0 {
            OrchestratorError::CapacityExceeded { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "capacity_exceeded")
            }
            OrchestratorError::NoPortAvailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "no_port_available")
            }
            OrchestratorError::ImmediateExit { .. } => (StatusCode::BAD_GATEWAY, "immediate_exit"),
            OrchestratorError::BindTimeout { .. } => (StatusCode::BAD_GATEWAY, "bind_timeout"),
            OrchestratorError::SpawnFailed { .. } => (StatusCode::BAD_GATEWAY, "spawn_failed"),
            OrchestratorError::ProcessNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            OrchestratorError::InstanceConflict { .. } => (StatusCode::CONFLICT, "conflict"),
        };
        (
            code,
            Json(ErrorResponse {
                status: "error",
                kind,
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    success(serde_json::json!({ "service": "avatarmux" }))
}

async fn start_instance(
    State(state): State<ControlState>,
    Json(req): Json<StartRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let instance = state
        .orchestrator
        .start(&req.instance_id, &req.logical_name)
        .await?;
    Ok(success(InstanceBody { instance }))
}

async fn warm_instance(
    State(state): State<ControlState>,
    Json(req): Json<StartRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let instance = state
        .orchestrator
        .warm(&req.instance_id, &req.logical_name)
        .await?;
    Ok(success(InstanceBody { instance }))
}

async fn stop_instance(
    State(state): State<ControlState>,
    Json(req): Json<StopRequest>,
) -> impl IntoResponse {
    let outcome = state.orchestrator.stop(&req.instance_id, req.force).await;
    success(ReleaseBody {
        instance_id: req.instance_id,
        outcome,
    })
}

async fn disconnect_instance(
    State(state): State<ControlState>,
    Json(req): Json<InstanceRequest>,
) -> impl IntoResponse {
    let outcome = state.orchestrator.stop(&req.instance_id, false).await;
    success(ReleaseBody {
        instance_id: req.instance_id,
        outcome,
    })
}

async fn restart_instance(
    State(state): State<ControlState>,
    Json(req): Json<InstanceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let instance = state.orchestrator.restart(&req.instance_id).await?;
    Ok(success(InstanceBody { instance }))
}

async fn stop_all(State(state): State<ControlState>) -> impl IntoResponse {
    let stopped = state.orchestrator.stop_all().await;
    success(StopAllBody { stopped })
}

async fn list_instances(State(state): State<ControlState>) -> impl IntoResponse {
    let instances = state.orchestrator.list().await;
    success(InstancesBody {
        count: instances.len(),
        instances,
    })
}

async fn instance_info(
    State(state): State<ControlState>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let instance = state.orchestrator.info(&instance_id).await?;
    Ok(success(InstanceBody { instance }))
}

async fn status(State(state): State<ControlState>) -> impl IntoResponse {
    let summary = state.orchestrator.status().await;
    success(StatusBody { summary })
}

async fn sweep_health(State(state): State<ControlState>) -> impl IntoResponse {
    let report = state.orchestrator.health_check_tick().await;
    success(SweepBody { report })
}

async fn sweep_idle(
    State(state): State<ControlState>,
    body: Option<Json<IdleSweepRequest>>,
) -> impl IntoResponse {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let timeout = req.idle_timeout_secs.unwrap_or(state.idle_timeout_secs);
    let report = state.orchestrator.idle_sweep_tick(timeout).await;
    success(SweepBody { report })
}
