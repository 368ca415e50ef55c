// Shared API plumbing: app state, error mapping, wire DTOs

use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;

use dealflow_durable::{
    BusError, DebugError, DispatchError, Engine, EngineError, LogEntry, PendingTimer,
    PendingWait, StatusView, StoreError,
};

/// App state shared across routes
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

/// Error payload returned on every non-2xx response
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

pub type ApiError = (StatusCode, Json<ErrorBody>);

fn error_body(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
}

/// Map engine failures onto the HTTP codes of the control-plane contract
pub fn map_engine_error(error: EngineError) -> ApiError {
    let status = match &error {
        EngineError::Dispatch(e) => match e {
            DispatchError::UnknownKind(_) | DispatchError::InstanceNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            DispatchError::AlreadyTerminal(_) | DispatchError::DuplicateIdempotencyKey { .. } => {
                StatusCode::CONFLICT
            }
            DispatchError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            DispatchError::Store(e) => store_status(e),
        },
        EngineError::Bus(e) => match e {
            BusError::NoMatchingWait(_) | BusError::Terminal(_) => StatusCode::CONFLICT,
            BusError::InstanceNotFound(_) => StatusCode::NOT_FOUND,
            BusError::UndeclaredEvent { .. } | BusError::Validation(_) => StatusCode::BAD_REQUEST,
            BusError::Store(e) => store_status(e),
        },
        EngineError::Debug(e) => match e {
            DebugError::InstanceNotFound(_)
            | DebugError::SnapshotNotFound(_)
            | DebugError::EntryNotFound(_) => StatusCode::NOT_FOUND,
            DebugError::NotFailed(_) => StatusCode::CONFLICT,
            DebugError::NotPermitted(_) => StatusCode::FORBIDDEN,
            DebugError::Store(e) => store_status(e),
        },
        EngineError::Store(e) => store_status(e),
        EngineError::FastForwardDisabled => StatusCode::FORBIDDEN,
    };

    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("request failed: {error}");
    }
    error_body(status, error.to_string())
}

fn store_status(error: &StoreError) -> StatusCode {
    match error {
        StoreError::InstanceNotFound(_) | StoreError::SnapshotNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        StoreError::DuplicateInstance(_) | StoreError::IdempotencyConflict { .. } => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// =============================================================================
// Wire DTOs
// =============================================================================

/// A pending wait, as reported by status queries
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WaitDto {
    pub event: String,
    pub correlation_key: Option<String>,
    pub deadline: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl From<PendingWait> for WaitDto {
    fn from(wait: PendingWait) -> Self {
        Self {
            event: wait.event_name,
            correlation_key: wait.correlation_key,
            deadline: wait.deadline,
            registered_at: wait.registered_at,
        }
    }
}

/// A pending timer, as reported by status queries
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimerDto {
    pub fire_at: DateTime<Utc>,
    pub purpose: String,
}

impl From<PendingTimer> for TimerDto {
    fn from(timer: PendingTimer) -> Self {
        Self {
            fire_at: timer.fire_at,
            purpose: timer.purpose.tag().to_string(),
        }
    }
}

/// Answer to `GET /workflows/{id}/status`
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[schema(value_type = String, format = Uuid)]
    pub instance_id: Uuid,
    pub kind: String,
    pub version: String,
    pub state: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    #[schema(value_type = Object)]
    pub output: Option<serde_json::Value>,
    #[schema(value_type = Object)]
    pub failure: Option<serde_json::Value>,
    pub pending_waits: Vec<WaitDto>,
    pub pending_timers: Vec<TimerDto>,
}

impl From<StatusView> for StatusResponse {
    fn from(view: StatusView) -> Self {
        Self {
            instance_id: view.instance_id,
            kind: view.kind,
            version: view.version,
            state: view.state,
            status: view.status.to_string(),
            started_at: view.started_at,
            last_activity_at: view.last_activity_at,
            output: view.output,
            failure: view
                .failure
                .map(|f| json!({"kind": f.kind, "message": f.message})),
            pending_waits: view.pending_waits.into_iter().map(WaitDto::from).collect(),
            pending_timers: view
                .pending_timers
                .into_iter()
                .map(TimerDto::from)
                .collect(),
        }
    }
}

/// One log entry on the wire
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogEntryDto {
    pub ordinal: u64,
    pub at: DateTime<Utc>,
    pub kind: String,
    #[schema(value_type = Object)]
    pub entry: serde_json::Value,
}

impl From<LogEntry> for LogEntryDto {
    fn from(entry: LogEntry) -> Self {
        let kind = entry.kind.name().to_string();
        Self {
            ordinal: entry.ordinal,
            at: entry.at,
            entry: serde_json::to_value(&entry.kind).unwrap_or(serde_json::Value::Null),
            kind,
        }
    }
}

/// Response wrapper for list endpoints
#[derive(Debug, Serialize, ToSchema)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(data: Vec<T>) -> Self {
        Self { data }
    }
}

/// Answer to `POST /workflows/{kind}/create`
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateResponse {
    #[schema(value_type = String, format = Uuid)]
    pub instance_id: Uuid,
}
