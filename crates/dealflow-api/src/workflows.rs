// Workflow instance HTTP routes

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use dealflow_durable::EventEnvelope;

use crate::common::{
    map_engine_error, ApiError, AppState, CreateResponse, ListResponse, LogEntryDto,
    StatusResponse,
};
use crate::snapshots::SnapshotDto;

/// Request body for delivering an external event to one instance
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventRequest {
    pub name: String,
    pub correlation_key: Option<String>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    pub publisher_key: Option<String>,
}

/// Request body for cancellation
#[derive(Debug, Deserialize, ToSchema)]
pub struct CancelRequest {
    #[serde(default = "default_cancel_reason")]
    pub reason: String,
}

fn default_cancel_reason() -> String {
    "cancelled via API".to_string()
}

/// Request body for parking a failed instance in the DLQ
#[derive(Debug, Deserialize, ToSchema)]
pub struct DeadLetterRequest {
    pub reason: String,
}

/// Request body for taking a snapshot
#[derive(Debug, Deserialize, ToSchema)]
pub struct SnapshotRequest {
    pub label: String,
}

/// Query parameters for the log endpoint
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogParams {
    #[serde(default)]
    pub from_ordinal: u64,
    #[serde(default = "default_log_limit")]
    pub limit: usize,
}

fn default_log_limit() -> usize {
    100
}

/// Create workflow routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/workflows/:kind/create", post(create_workflow))
        .route("/v1/workflows/:instance_id/event", post(deliver_event))
        .route("/v1/workflows/:instance_id/cancel", post(cancel_workflow))
        .route(
            "/v1/workflows/:instance_id/dead-letter",
            post(dead_letter_workflow),
        )
        .route("/v1/workflows/:instance_id/status", get(workflow_status))
        .route("/v1/workflows/:instance_id/log", get(workflow_log))
        .route(
            "/v1/workflows/:instance_id/snapshots",
            get(list_snapshots),
        )
        .route("/v1/workflows/:instance_id/snapshot", post(take_snapshot))
        .with_state(state)
}

/// POST /v1/workflows/{kind}/create - Start a workflow instance
#[utoipa::path(
    post,
    path = "/v1/workflows/{kind}/create",
    params(("kind" = String, Path, description = "Workflow kind id")),
    responses(
        (status = 201, description = "Instance created", body = CreateResponse),
        (status = 400, description = "Invalid input payload"),
        (status = 404, description = "Unknown workflow kind"),
        (status = 409, description = "Duplicate idempotency key")
    ),
    tag = "workflows"
)]
pub async fn create_workflow(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    Json(input): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<CreateResponse>), ApiError> {
    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let instance_id = state
        .engine
        .create(&kind, input, idempotency_key)
        .await
        .map_err(map_engine_error)?;

    Ok((StatusCode::CREATED, Json(CreateResponse { instance_id })))
}

/// POST /v1/workflows/{instance_id}/event - Deliver an external event
#[utoipa::path(
    post,
    path = "/v1/workflows/{instance_id}/event",
    params(("instance_id" = Uuid, Path, description = "Instance id")),
    request_body = EventRequest,
    responses(
        (status = 200, description = "Event delivered"),
        (status = 400, description = "Undeclared event or invalid payload"),
        (status = 404, description = "Instance unknown"),
        (status = 409, description = "No matching wait")
    ),
    tag = "workflows"
)]
pub async fn deliver_event(
    State(state): State<AppState>,
    Path(instance_id): Path<Uuid>,
    Json(request): Json<EventRequest>,
) -> Result<StatusCode, ApiError> {
    let mut envelope = EventEnvelope::new(request.name, request.payload);
    if let Some(key) = request.correlation_key {
        envelope = envelope.with_correlation(key);
    }
    if let Some(key) = request.publisher_key {
        envelope = envelope.with_publisher_key(key);
    }

    state
        .engine
        .publish_to(instance_id, envelope)
        .await
        .map_err(map_engine_error)?;
    Ok(StatusCode::OK)
}

/// POST /v1/workflows/{instance_id}/cancel - Request cancellation
#[utoipa::path(
    post,
    path = "/v1/workflows/{instance_id}/cancel",
    params(("instance_id" = Uuid, Path, description = "Instance id")),
    request_body = CancelRequest,
    responses(
        (status = 200, description = "Cancellation requested"),
        (status = 404, description = "Instance unknown"),
        (status = 409, description = "Instance already terminal")
    ),
    tag = "workflows"
)]
pub async fn cancel_workflow(
    State(state): State<AppState>,
    Path(instance_id): Path<Uuid>,
    Json(request): Json<CancelRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .cancel(instance_id, &request.reason)
        .await
        .map_err(map_engine_error)?;
    Ok(StatusCode::OK)
}

/// POST /v1/workflows/{instance_id}/dead-letter - Park a failed instance
#[utoipa::path(
    post,
    path = "/v1/workflows/{instance_id}/dead-letter",
    params(("instance_id" = Uuid, Path, description = "Instance id")),
    request_body = DeadLetterRequest,
    responses(
        (status = 200, description = "Instance moved to the dead-letter queue"),
        (status = 404, description = "Instance unknown"),
        (status = 409, description = "Instance is not failed")
    ),
    tag = "workflows"
)]
pub async fn dead_letter_workflow(
    State(state): State<AppState>,
    Path(instance_id): Path<Uuid>,
    Json(request): Json<DeadLetterRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .engine
        .dead_letter(instance_id, &request.reason)
        .await
        .map_err(map_engine_error)?;
    Ok(StatusCode::OK)
}

/// GET /v1/workflows/{instance_id}/status - Materialised status
#[utoipa::path(
    get,
    path = "/v1/workflows/{instance_id}/status",
    params(("instance_id" = Uuid, Path, description = "Instance id")),
    responses(
        (status = 200, description = "Current status", body = StatusResponse),
        (status = 404, description = "Instance unknown")
    ),
    tag = "workflows"
)]
pub async fn workflow_status(
    State(state): State<AppState>,
    Path(instance_id): Path<Uuid>,
) -> Result<Json<StatusResponse>, ApiError> {
    let view = state
        .engine
        .status(instance_id)
        .await
        .map_err(map_engine_error)?;
    Ok(Json(view.into()))
}

/// GET /v1/workflows/{instance_id}/log - Paginated event log
#[utoipa::path(
    get,
    path = "/v1/workflows/{instance_id}/log",
    params(
        ("instance_id" = Uuid, Path, description = "Instance id"),
        ("fromOrdinal" = Option<u64>, Query, description = "First ordinal to return"),
        ("limit" = Option<usize>, Query, description = "Page size (default 100)")
    ),
    responses(
        (status = 200, description = "Log entries", body = [LogEntryDto]),
        (status = 404, description = "Instance unknown")
    ),
    tag = "workflows"
)]
pub async fn workflow_log(
    State(state): State<AppState>,
    Path(instance_id): Path<Uuid>,
    Query(params): Query<LogParams>,
) -> Result<Json<ListResponse<LogEntryDto>>, ApiError> {
    let entries = state
        .engine
        .log(instance_id, params.from_ordinal, params.limit)
        .await
        .map_err(map_engine_error)?;
    Ok(Json(
        entries
            .into_iter()
            .map(LogEntryDto::from)
            .collect::<Vec<_>>()
            .into(),
    ))
}

/// GET /v1/workflows/{instance_id}/snapshots - List snapshots
#[utoipa::path(
    get,
    path = "/v1/workflows/{instance_id}/snapshots",
    params(("instance_id" = Uuid, Path, description = "Instance id")),
    responses(
        (status = 200, description = "Snapshots", body = [SnapshotDto])
    ),
    tag = "snapshots"
)]
pub async fn list_snapshots(
    State(state): State<AppState>,
    Path(instance_id): Path<Uuid>,
) -> Result<Json<ListResponse<SnapshotDto>>, ApiError> {
    let snapshots = state
        .engine
        .debug()
        .list_snapshots(instance_id)
        .await
        .map_err(|e| map_engine_error(e.into()))?;
    Ok(Json(
        snapshots
            .into_iter()
            .map(SnapshotDto::from)
            .collect::<Vec<_>>()
            .into(),
    ))
}

/// POST /v1/workflows/{instance_id}/snapshot - Take a snapshot
#[utoipa::path(
    post,
    path = "/v1/workflows/{instance_id}/snapshot",
    params(("instance_id" = Uuid, Path, description = "Instance id")),
    request_body = SnapshotRequest,
    responses(
        (status = 201, description = "Snapshot taken", body = SnapshotDto),
        (status = 404, description = "Instance unknown")
    ),
    tag = "snapshots"
)]
pub async fn take_snapshot(
    State(state): State<AppState>,
    Path(instance_id): Path<Uuid>,
    Json(request): Json<SnapshotRequest>,
) -> Result<(StatusCode, Json<SnapshotDto>), ApiError> {
    let info = state
        .engine
        .take_snapshot(instance_id, &request.label)
        .await
        .map_err(map_engine_error)?;
    Ok((StatusCode::CREATED, Json(info.into())))
}
