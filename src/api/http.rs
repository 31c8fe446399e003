//! HTTP/JSON transport for the scheduler.

use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::{AckResponse, ProgressReport, ResultReport, StartReport};
use crate::error::RenderqError;
use crate::scheduler::job::{JobFilter, JobStatus, JobSubmission};
use crate::scheduler::service::Scheduler;
use crate::scheduler::worker::WorkerRegistration;

/// JSON error body: `{"error": "...", "kind": "worker_not_found"}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}

pub struct ApiError(RenderqError);

impl From<RenderqError> for ApiError {
    fn from(err: RenderqError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RenderqError::Validation(_) => StatusCode::BAD_REQUEST,
            RenderqError::JobNotFound(_)
            | RenderqError::TaskNotFound(_)
            | RenderqError::WorkerNotFound(_) => StatusCode::NOT_FOUND,
            RenderqError::InvalidTransition { .. } => StatusCode::CONFLICT,
            RenderqError::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            kind: self.0.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PriorityRequest {
    pub priority: i32,
}

#[derive(Debug, Default, Deserialize)]
struct ListJobsQuery {
    status: Option<String>,
    pool: Option<String>,
    plugin: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl ListJobsQuery {
    fn into_filter(self) -> Result<JobFilter, RenderqError> {
        let status = self
            .status
            .as_deref()
            .map(str::parse::<JobStatus>)
            .transpose()?;
        Ok(JobFilter {
            status,
            pool: self.pool,
            plugin_type: self.plugin,
            limit: self.limit,
            offset: self.offset,
        })
    }
}

/// Build the API router around a scheduler.
pub fn router(scheduler: Scheduler) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/jobs", post(submit_job).get(list_jobs))
        .route("/api/jobs/{id}", get(get_job).delete(delete_job))
        .route("/api/jobs/{id}/tasks", get(get_job_tasks))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}/suspend", post(suspend_job))
        .route("/api/jobs/{id}/resume", post(resume_job))
        .route("/api/jobs/{id}/priority", put(update_priority))
        .route("/api/workers", get(list_workers))
        .route("/api/workers/register", post(register_worker))
        .route("/api/workers/{id}", get(get_worker))
        .route("/api/workers/{id}/heartbeat", post(heartbeat))
        .route("/api/workers/{id}/disable", post(disable_worker))
        .route("/api/workers/{id}/enable", post(enable_worker))
        .route("/api/workers/{id}/request-task", post(request_task))
        .route("/api/tasks/{id}/start", post(report_started))
        .route("/api/tasks/{id}/progress", post(report_progress))
        .route("/api/tasks/{id}/result", post(report_result))
        .route("/api/plugins", get(list_plugins))
        .route("/api/stats", get(stats))
        .route("/api/events", get(events))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(scheduler)
}

/// Serve the API on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    scheduler: Scheduler,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "Starting HTTP API");
    axum::serve(listener, router(scheduler))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

async fn submit_job(
    State(scheduler): State<Scheduler>,
    Json(submission): Json<JobSubmission>,
) -> ApiResult<impl IntoResponse> {
    let job_id = scheduler.submit_job(submission).await?;
    Ok((StatusCode::CREATED, Json(SubmitJobResponse { job_id })))
}

async fn list_jobs(
    State(scheduler): State<Scheduler>,
    Query(query): Query<ListJobsQuery>,
) -> ApiResult<impl IntoResponse> {
    let filter = query.into_filter()?;
    Ok(Json(scheduler.list_jobs(&filter).await))
}

async fn get_job(
    State(scheduler): State<Scheduler>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(scheduler.get_job(id).await?))
}

async fn get_job_tasks(
    State(scheduler): State<Scheduler>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(scheduler.get_job_tasks(id).await?))
}

async fn cancel_job(
    State(scheduler): State<Scheduler>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(scheduler.cancel_job(id).await?))
}

async fn suspend_job(
    State(scheduler): State<Scheduler>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(scheduler.suspend_job(id).await?))
}

async fn resume_job(
    State(scheduler): State<Scheduler>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(scheduler.resume_job(id).await?))
}

async fn update_priority(
    State(scheduler): State<Scheduler>,
    Path(id): Path<Uuid>,
    Json(body): Json<PriorityRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(scheduler.update_job_priority(id, body.priority).await?))
}

async fn delete_job(
    State(scheduler): State<Scheduler>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    scheduler.delete_job(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

async fn register_worker(
    State(scheduler): State<Scheduler>,
    Json(registration): Json<WorkerRegistration>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(scheduler.register_worker(registration).await?))
}

async fn list_workers(State(scheduler): State<Scheduler>) -> impl IntoResponse {
    Json(scheduler.list_workers().await)
}

async fn get_worker(
    State(scheduler): State<Scheduler>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(scheduler.get_worker(&id).await?))
}

async fn disable_worker(
    State(scheduler): State<Scheduler>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(scheduler.disable_worker(&id).await?))
}

async fn enable_worker(
    State(scheduler): State<Scheduler>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(scheduler.enable_worker(&id).await?))
}

async fn heartbeat(
    State(scheduler): State<Scheduler>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    scheduler.heartbeat(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 200 with the assignment, or 204 when there is nothing to do.
async fn request_task(
    State(scheduler): State<Scheduler>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    Ok(match scheduler.request_task(&id).await? {
        Some(assignment) => Json(assignment).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

// ---------------------------------------------------------------------------
// Task reports
// ---------------------------------------------------------------------------

async fn report_started(
    State(scheduler): State<Scheduler>,
    Path(id): Path<Uuid>,
    Json(report): Json<StartReport>,
) -> ApiResult<Json<AckResponse>> {
    let ack = scheduler.report_started(id, &report.worker_id).await?;
    Ok(Json(AckResponse { ack }))
}

async fn report_progress(
    State(scheduler): State<Scheduler>,
    Path(id): Path<Uuid>,
    Json(report): Json<ProgressReport>,
) -> ApiResult<Json<AckResponse>> {
    let ack = scheduler.report_progress(id, report).await?;
    Ok(Json(AckResponse { ack }))
}

async fn report_result(
    State(scheduler): State<Scheduler>,
    Path(id): Path<Uuid>,
    Json(report): Json<ResultReport>,
) -> ApiResult<Json<AckResponse>> {
    let ack = scheduler.report_result(id, report).await?;
    Ok(Json(AckResponse { ack }))
}

// ---------------------------------------------------------------------------
// Catalogue, stats and notifications
// ---------------------------------------------------------------------------

async fn list_plugins(State(scheduler): State<Scheduler>) -> impl IntoResponse {
    Json(scheduler.list_plugins())
}

async fn stats(State(scheduler): State<Scheduler>) -> impl IntoResponse {
    Json(scheduler.stats().await)
}

/// Server-Sent Events stream of every state change. A client that falls
/// behind silently misses events.
async fn events(
    State(scheduler): State<Scheduler>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let stream = BroadcastStream::new(scheduler.events().subscribe()).filter_map(|msg| match msg {
        Ok(event) => SseEvent::default()
            .event(event.entity_type.to_string())
            .json_data(&event)
            .ok()
            .map(Ok),
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::debug!(skipped, "Event subscriber lagging, events dropped");
            None
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
