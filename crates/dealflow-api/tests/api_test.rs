//! Control-plane integration tests
//!
//! Drives the router in-process with `tower::ServiceExt::oneshot`; the
//! engine is drained manually between requests so every assertion is
//! deterministic.

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use dealflow_api::{router, AppState};
use dealflow_durable::Engine;
use dealflow_workflows::{register_all, Collaborators};

fn test_app() -> (Engine, axum::Router) {
    let collaborators = Collaborators::simulated();
    let engine = register_all(Engine::builder(), &collaborators)
        .build()
        .expect("engine builds");
    let app = router(AppState {
        engine: engine.clone(),
    });
    (engine, app)
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("request handled");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body reads");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn create_event_status_round_trip() {
    let (engine, app) = test_app();

    let (status, body) = send(
        &app,
        post_json(
            "/v1/workflows/investment_deal/create",
            json!({"amount": 10_000, "accredited": true}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let instance_id = body["instanceId"].as_str().unwrap().to_string();

    engine.drain().await.unwrap();

    let (status, body) = send(&app, get(&format!("/v1/workflows/{instance_id}/status"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "Interest");
    assert_eq!(body["status"], "suspended");
    assert!(!body["pendingWaits"].as_array().unwrap().is_empty());

    let (status, _) = send(
        &app,
        post_json(
            &format!("/v1/workflows/{instance_id}/event"),
            json!({"name": "qualify", "payload": {"qualified": true}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    engine.drain().await.unwrap();

    let (status, body) = send(&app, get(&format!("/v1/workflows/{instance_id}/status"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "PendingCreator");

    let (status, body) = send(
        &app,
        get(&format!("/v1/workflows/{instance_id}/log?fromOrdinal=0&limit=100")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].as_array().unwrap().len() > 3);
}

#[tokio::test]
async fn create_validates_input_and_kind() {
    let (_engine, app) = test_app();

    // Unknown kind
    let (status, _) = send(&app, post_json("/v1/workflows/nonsense/create", json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Invalid input (missing amount)
    let (status, body) = send(
        &app,
        post_json("/v1/workflows/investment_deal/create", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("amount"));
}

#[tokio::test]
async fn idempotency_key_conflicts_with_409() {
    let (_engine, app) = test_app();

    let request = |key: &str| {
        Request::builder()
            .method("POST")
            .uri("/v1/workflows/nda/create")
            .header("content-type", "application/json")
            .header("idempotency-key", key)
            .body(Body::from(json!({}).to_string()))
            .unwrap()
    };

    let (status, _) = send(&app, request("nda-1")).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = send(&app, request("nda-1")).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn event_without_wait_conflicts() {
    let (engine, app) = test_app();

    let (_, body) = send(
        &app,
        post_json("/v1/workflows/nda/create", json!({})),
    )
    .await;
    let instance_id = body["instanceId"].as_str().unwrap().to_string();
    engine.drain().await.unwrap();

    // The NDA is waiting on risk_assessed, not document_signed
    let (status, _) = send(
        &app,
        post_json(
            &format!("/v1/workflows/{instance_id}/event"),
            json!({"name": "document_signed", "payload": {}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Undeclared events are a client error
    let (status, _) = send(
        &app,
        post_json(
            &format!("/v1/workflows/{instance_id}/event"),
            json!({"name": "mystery", "payload": {}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Unknown instances are 404
    let (status, _) = send(
        &app,
        post_json(
            &format!("/v1/workflows/{}/event", uuid::Uuid::now_v7()),
            json!({"name": "risk_assessed", "payload": {"riskLevel": "low"}}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_is_terminal_once() {
    let (engine, app) = test_app();

    let (_, body) = send(
        &app,
        post_json("/v1/workflows/nda/create", json!({})),
    )
    .await;
    let instance_id = body["instanceId"].as_str().unwrap().to_string();
    engine.drain().await.unwrap();

    let (status, _) = send(
        &app,
        post_json(
            &format!("/v1/workflows/{instance_id}/cancel"),
            json!({"reason": "test"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    engine.drain().await.unwrap();

    let (status, _) = send(
        &app,
        post_json(
            &format!("/v1/workflows/{instance_id}/cancel"),
            json!({"reason": "again"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn snapshot_and_restore_through_the_api() {
    let (engine, app) = test_app();

    let (_, body) = send(
        &app,
        post_json("/v1/workflows/nda/create", json!({})),
    )
    .await;
    let instance_id = body["instanceId"].as_str().unwrap().to_string();
    engine.drain().await.unwrap();

    let (status, body) = send(
        &app,
        post_json(
            &format!("/v1/workflows/{instance_id}/snapshot"),
            json!({"label": "fresh"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let snapshot_id = body["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &app,
        get(&format!("/v1/workflows/{instance_id}/snapshots")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, body) = send(
        &app,
        post_json(&format!("/v1/snapshots/{snapshot_id}/restore"), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let fork_id = body["instanceId"].as_str().unwrap().to_string();
    assert_ne!(fork_id, instance_id);
}

#[tokio::test]
async fn dlq_listing_and_stats() {
    let (_engine, app) = test_app();

    let (status, body) = send(&app, get("/v1/dlq")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].as_array().unwrap().is_empty());

    let (status, body) = send(&app, get("/v1/dlq/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 0);

    // Retry of a nonexistent entry is 404
    let (status, _) = send(
        &app,
        post_json(&format!("/v1/dlq/{}/retry", uuid::Uuid::now_v7()), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_endpoint_responds() {
    let (_engine, app) = test_app();
    let (status, body) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}
