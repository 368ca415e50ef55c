//! HTTP control plane for the workflow engine
//!
//! Route modules return plain `Router`s over a shared [`AppState`];
//! [`router`] assembles the full application the binary serves and the
//! tests drive in-process.

pub mod common;
pub mod dlq;
pub mod snapshots;
pub mod workflows;

use axum::{routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use common::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        workflows::create_workflow,
        workflows::deliver_event,
        workflows::cancel_workflow,
        workflows::dead_letter_workflow,
        workflows::workflow_status,
        workflows::workflow_log,
        workflows::list_snapshots,
        workflows::take_snapshot,
        snapshots::restore_snapshot,
        dlq::list_dlq,
        dlq::dlq_stats,
        dlq::retry_entry,
        dlq::purge_dlq,
    ),
    components(schemas(
        common::ErrorBody,
        common::CreateResponse,
        common::StatusResponse,
        common::WaitDto,
        common::TimerDto,
        common::LogEntryDto,
        workflows::EventRequest,
        workflows::CancelRequest,
        workflows::DeadLetterRequest,
        workflows::SnapshotRequest,
        snapshots::SnapshotDto,
        dlq::DlqEntryDto,
        dlq::DlqStatsDto,
        dlq::PurgeResponse,
    )),
    tags(
        (name = "workflows", description = "Instance lifecycle and inspection"),
        (name = "snapshots", description = "Time-travel snapshots and forks"),
        (name = "dlq", description = "Dead-letter queue operations"),
    )
)]
pub struct ApiDoc;

/// Assemble the full application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/docs").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route(
            "/health",
            get(|| async {
                Json(HealthResponse {
                    status: "ok",
                    version: env!("CARGO_PKG_VERSION"),
                })
            }),
        )
        .merge(workflows::routes(state.clone()))
        .merge(snapshots::routes(state.clone()))
        .merge(dlq::routes(state))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}
