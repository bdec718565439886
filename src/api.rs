use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::orchestrator::{Orchestrator, SubmitRequest, WorkerReport};
use crate::partition::DataShape;
use crate::registry::{Availability, NodeHeartbeat};
use crate::tracker::{JobOutcome, WaitOutcome};

/// Longest long-poll the wait endpoint will hold a connection open.
const MAX_WAIT_SECS: u64 = 300;

#[derive(Deserialize)]
pub struct RegisterDataRequest {
    pub file_path: PathBuf,
    pub data_type: String,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    #[serde(default)]
    pub steps: u32,
    #[serde(default)]
    pub copy_to_shared_storage: bool,
}

#[derive(Serialize)]
struct RegisterDataResponse {
    reference_id: Uuid,
    shared_path: Option<PathBuf>,
}

#[derive(Serialize)]
struct SubmitResponse {
    job_id: Uuid,
}

#[derive(Serialize)]
struct StatusResponse {
    job_id: Uuid,
    status: String,
    completed_partitions: u32,
    total_partitions: u32,
    progress: f64,
    error: Option<String>,
}

#[derive(Serialize)]
struct ResultResponse {
    job_id: Uuid,
    status: String,
    result: Option<Value>,
    error: Option<String>,
}

#[derive(Deserialize)]
pub struct WaitParams {
    #[serde(default = "default_wait_secs")]
    timeout_secs: u64,
}

fn default_wait_secs() -> u64 {
    30
}

#[derive(Serialize)]
struct NodeResponse {
    node_id: Uuid,
    name: String,
    available: bool,
    has_gpu: bool,
    supported_job_types: Vec<String>,
    cpu_util: f64,
    mem_util: f64,
    queue_depth: u32,
    slots: u32,
    assigned_jobs: usize,
    load_score: f64,
    missed_heartbeats: u32,
}

#[derive(Serialize)]
struct AssignmentResponse {
    job_id: Uuid,
    job_type: String,
    params: Value,
    data_path: Option<PathBuf>,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(e: &OrchestratorError) -> (StatusCode, Json<ErrorBody>) {
    let status = match e {
        OrchestratorError::Validation(_) | OrchestratorError::Aggregation(_) => {
            StatusCode::BAD_REQUEST
        }
        OrchestratorError::JobNotFound(_)
        | OrchestratorError::NodeNotFound(_)
        | OrchestratorError::DataRefNotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::NoEligibleNode(_) => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::Io(_) | OrchestratorError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(ErrorBody {
            error: e.to_string(),
        }),
    )
}

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/data", post(register_data))
        .route("/api/jobs", post(submit_job))
        .route("/api/jobs/{id}/status", get(job_status))
        .route("/api/jobs/{id}/result", get(job_result))
        .route("/api/jobs/{id}/wait", get(job_wait))
        .route("/api/jobs/{id}/cancel", post(job_cancel))
        .route("/api/nodes", get(list_nodes))
        .route("/api/nodes/heartbeat", post(node_heartbeat))
        .route("/api/nodes/{id}/assignments", get(node_assignments))
        .route("/api/nodes/{id}/report", post(node_report))
        .layer(cors)
        .with_state(orchestrator)
}

/// Bind and serve the HTTP API until the token is cancelled.
pub async fn serve(
    addr: SocketAddr,
    orchestrator: Arc<Orchestrator>,
    token: CancellationToken,
) -> crate::error::Result<()> {
    let app = router(orchestrator);
    tracing::info!(addr = %addr, "Starting orchestrator API");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(token.cancelled_owned())
        .await?;
    Ok(())
}

async fn register_data(
    State(orch): State<Arc<Orchestrator>>,
    Json(req): Json<RegisterDataRequest>,
) -> impl IntoResponse {
    let dims = DataShape {
        width: req.width,
        height: req.height,
        depth: req.depth,
        steps: req.steps,
    };
    match orch
        .data_store
        .register(
            &req.file_path,
            &req.data_type,
            dims,
            req.copy_to_shared_storage,
        )
        .await
    {
        Ok(reference) => (
            StatusCode::OK,
            Json(RegisterDataResponse {
                reference_id: reference.id,
                shared_path: reference.shared_path,
            }),
        )
            .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

async fn submit_job(
    State(orch): State<Arc<Orchestrator>>,
    Json(req): Json<SubmitRequest>,
) -> impl IntoResponse {
    match orch.submit(req).await {
        Ok(job_id) => (StatusCode::OK, Json(SubmitResponse { job_id })).into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

async fn job_status(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    let Some(job) = orch.tracker.get(id).await else {
        return error_response(&OrchestratorError::JobNotFound(id)).into_response();
    };
    let (completed, total) = orch.tracker.progress(id).await.unwrap_or((0, 1));
    let progress = if total == 0 {
        0.0
    } else {
        completed as f64 / total as f64 * 100.0
    };
    (
        StatusCode::OK,
        Json(StatusResponse {
            job_id: id,
            status: job.status.to_string(),
            completed_partitions: completed,
            total_partitions: total,
            progress,
            error: job.error,
        }),
    )
        .into_response()
}

async fn job_result(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match orch.tracker.get_result(id).await {
        JobOutcome::Finished(job) => (
            StatusCode::OK,
            Json(ResultResponse {
                job_id: id,
                status: job.status.to_string(),
                result: job.result,
                error: job.error,
            }),
        )
            .into_response(),
        JobOutcome::Pending => StatusCode::ACCEPTED.into_response(),
        JobOutcome::NotFound => error_response(&OrchestratorError::JobNotFound(id)).into_response(),
    }
}

async fn job_wait(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
    Query(params): Query<WaitParams>,
) -> impl IntoResponse {
    let timeout = Duration::from_secs(params.timeout_secs.min(MAX_WAIT_SECS));
    match orch.tracker.wait(id, timeout).await {
        WaitOutcome::Finished(job) => (
            StatusCode::OK,
            Json(ResultResponse {
                job_id: id,
                status: job.status.to_string(),
                result: job.result,
                error: job.error,
            }),
        )
            .into_response(),
        WaitOutcome::TimedOut => StatusCode::ACCEPTED.into_response(),
        WaitOutcome::NotFound => {
            error_response(&OrchestratorError::JobNotFound(id)).into_response()
        }
    }
}

async fn job_cancel(
    State(orch): State<Arc<Orchestrator>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match orch.cancel(id).await {
        Ok(cancelled) => (
            StatusCode::OK,
            Json(serde_json::json!({ "cancelled": cancelled })),
        )
            .into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}

async fn list_nodes(State(orch): State<Arc<Orchestrator>>) -> impl IntoResponse {
    let nodes: Vec<NodeResponse> = orch
        .registry
        .read()
        .await
        .snapshot()
        .into_iter()
        .map(|n| NodeResponse {
            node_id: n.id,
            name: n.name,
            available: n.availability == Availability::Available,
            has_gpu: n.has_gpu,
            supported_job_types: n
                .supported_job_types
                .iter()
                .map(|t| t.to_string())
                .collect(),
            cpu_util: n.cpu_util,
            mem_util: n.mem_util,
            queue_depth: n.queue_depth,
            slots: n.slots,
            assigned_jobs: n.assigned.len(),
            load_score: n.load_score,
            missed_heartbeats: n.missed_heartbeats,
        })
        .collect();
    Json(nodes)
}

async fn node_heartbeat(
    State(orch): State<Arc<Orchestrator>>,
    Json(hb): Json<NodeHeartbeat>,
) -> impl IntoResponse {
    orch.heartbeat(&hb).await;
    StatusCode::OK
}

async fn node_assignments(
    State(orch): State<Arc<Orchestrator>>,
    Path(node_id): Path<Uuid>,
) -> impl IntoResponse {
    let mut assignments = Vec::new();
    for job in orch.assignments_for(node_id).await {
        let data_path = match job.data_ref {
            Some(data_ref) => orch.data_store.resolve(data_ref).await.ok(),
            None => None,
        };
        assignments.push(AssignmentResponse {
            job_id: job.id,
            job_type: job.job_type.to_string(),
            params: job.params,
            data_path,
        });
    }
    Json(assignments)
}

async fn node_report(
    State(orch): State<Arc<Orchestrator>>,
    Path(node_id): Path<Uuid>,
    Json(report): Json<WorkerReport>,
) -> impl IntoResponse {
    match orch.report(node_id, report).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => error_response(&e).into_response(),
    }
}
