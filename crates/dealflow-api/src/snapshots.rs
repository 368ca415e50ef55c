// Snapshot restore route

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use dealflow_durable::SnapshotInfo;

use crate::common::{map_engine_error, ApiError, AppState, CreateResponse};

/// A snapshot on the wire
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDto {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    #[schema(value_type = String, format = Uuid)]
    pub instance_id: Uuid,
    pub label: String,
    pub taken_at: DateTime<Utc>,
    pub log_head: u64,
}

impl From<SnapshotInfo> for SnapshotDto {
    fn from(info: SnapshotInfo) -> Self {
        Self {
            id: info.id,
            instance_id: info.instance_id,
            label: info.label,
            taken_at: info.taken_at,
            log_head: info.log_head,
        }
    }
}

/// Create snapshot routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/snapshots/:snapshot_id/restore", post(restore_snapshot))
        .with_state(state)
}

/// POST /v1/snapshots/{snapshot_id}/restore - Fork a new instance
#[utoipa::path(
    post,
    path = "/v1/snapshots/{snapshot_id}/restore",
    params(("snapshot_id" = Uuid, Path, description = "Snapshot id")),
    responses(
        (status = 201, description = "Instance forked from snapshot", body = CreateResponse),
        (status = 404, description = "Snapshot unknown")
    ),
    tag = "snapshots"
)]
pub async fn restore_snapshot(
    State(state): State<AppState>,
    Path(snapshot_id): Path<Uuid>,
) -> Result<(StatusCode, Json<CreateResponse>), ApiError> {
    let instance_id = state
        .engine
        .restore_snapshot(snapshot_id)
        .await
        .map_err(map_engine_error)?;
    Ok((StatusCode::CREATED, Json(CreateResponse { instance_id })))
}
