// Dead-letter queue HTTP routes

use std::collections::HashMap;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use dealflow_durable::{DeadLetterEntry, DlqFilter, Pagination};

use crate::common::{map_engine_error, ApiError, AppState, CreateResponse, ListResponse};

/// A dead-letter entry on the wire
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DlqEntryDto {
    #[schema(value_type = String, format = Uuid)]
    pub id: Uuid,
    #[schema(value_type = String, format = Uuid)]
    pub instance_id: Uuid,
    pub failed_at: DateTime<Utc>,
    pub reason: String,
    pub last_state: String,
    pub retry_count: u32,
}

impl From<DeadLetterEntry> for DlqEntryDto {
    fn from(entry: DeadLetterEntry) -> Self {
        Self {
            id: entry.id,
            instance_id: entry.instance_id,
            failed_at: entry.failed_at,
            reason: entry.reason,
            last_state: entry.last_state,
            retry_count: entry.retry_count,
        }
    }
}

/// Aggregate queue statistics
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DlqStatsDto {
    pub total: u64,
    pub by_reason: HashMap<String, u64>,
    pub by_last_state: HashMap<String, u64>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Query parameters for listing
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListDlqParams {
    pub instance_id: Option<Uuid>,
    pub reason: Option<String>,
    #[serde(default)]
    pub offset: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    100
}

/// Query parameters for purging
#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PurgeParams {
    pub older_than_days: u64,
}

/// Purge outcome
#[derive(Debug, Serialize, ToSchema)]
pub struct PurgeResponse {
    pub purged: u64,
}

/// Create DLQ routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/dlq", get(list_dlq).delete(purge_dlq))
        .route("/v1/dlq/stats", get(dlq_stats))
        .route("/v1/dlq/:entry_id/retry", post(retry_entry))
        .with_state(state)
}

/// GET /v1/dlq - List dead-letter entries
#[utoipa::path(
    get,
    path = "/v1/dlq",
    params(
        ("instanceId" = Option<Uuid>, Query, description = "Filter by instance"),
        ("reason" = Option<String>, Query, description = "Filter by reason"),
        ("offset" = Option<u32>, Query, description = "Pagination offset"),
        ("limit" = Option<u32>, Query, description = "Page size (default 100)")
    ),
    responses((status = 200, description = "Entries", body = [DlqEntryDto])),
    tag = "dlq"
)]
pub async fn list_dlq(
    State(state): State<AppState>,
    Query(params): Query<ListDlqParams>,
) -> Result<Json<ListResponse<DlqEntryDto>>, ApiError> {
    let filter = DlqFilter {
        instance_id: params.instance_id,
        reason: params.reason,
    };
    let page = Pagination {
        offset: params.offset,
        limit: params.limit,
    };

    let entries = state
        .engine
        .list_dead_letter(&filter, &page)
        .await
        .map_err(map_engine_error)?;
    Ok(Json(
        entries
            .into_iter()
            .map(DlqEntryDto::from)
            .collect::<Vec<_>>()
            .into(),
    ))
}

/// GET /v1/dlq/stats - Queue statistics
#[utoipa::path(
    get,
    path = "/v1/dlq/stats",
    responses((status = 200, description = "Statistics", body = DlqStatsDto)),
    tag = "dlq"
)]
pub async fn dlq_stats(
    State(state): State<AppState>,
) -> Result<Json<DlqStatsDto>, ApiError> {
    let stats = state
        .engine
        .debug()
        .dlq_stats()
        .await
        .map_err(|e| map_engine_error(e.into()))?;
    Ok(Json(DlqStatsDto {
        total: stats.total,
        by_reason: stats.by_reason,
        by_last_state: stats.by_last_state,
        oldest: stats.oldest,
        newest: stats.newest,
    }))
}

/// POST /v1/dlq/{entry_id}/retry - Re-queue a dead-lettered instance
#[utoipa::path(
    post,
    path = "/v1/dlq/{entry_id}/retry",
    params(("entry_id" = Uuid, Path, description = "Dead-letter entry id")),
    responses(
        (status = 200, description = "Instance re-queued", body = CreateResponse),
        (status = 404, description = "Entry unknown")
    ),
    tag = "dlq"
)]
pub async fn retry_entry(
    State(state): State<AppState>,
    Path(entry_id): Path<Uuid>,
) -> Result<Json<CreateResponse>, ApiError> {
    let instance_id = state
        .engine
        .retry_dead_letter(entry_id, None)
        .await
        .map_err(map_engine_error)?;
    Ok(Json(CreateResponse { instance_id }))
}

/// DELETE /v1/dlq?olderThanDays= - Purge old entries
#[utoipa::path(
    delete,
    path = "/v1/dlq",
    params(("olderThanDays" = u64, Query, description = "Minimum age in days")),
    responses((status = 200, description = "Purge outcome", body = PurgeResponse)),
    tag = "dlq"
)]
pub async fn purge_dlq(
    State(state): State<AppState>,
    Query(params): Query<PurgeParams>,
) -> Result<Json<PurgeResponse>, ApiError> {
    let purged = state
        .engine
        .debug()
        .purge_dead_letter(Duration::from_secs(params.older_than_days * 24 * 3600))
        .await
        .map_err(|e| map_engine_error(e.into()))?;
    Ok(Json(PurgeResponse { purged }))
}
