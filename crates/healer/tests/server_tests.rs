//! HTTP surface tests, driven through the router without a listener.

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{failure_event, test_config, CodegenMode, Harness, PROJECT};
use deploy_healer::server::build_router;
use deploy_healer::store::RemediationStore;
use deploy_healer::{DeploymentState, FailureStatus, HealerConfig};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn router(h: &Harness) -> Router {
    build_router(Arc::new(h.server_state(5)))
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post(uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.into())
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let mut h = Harness::new();
    let (status, body) = send(&router(&h), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    h.shutdown().await;
}

#[tokio::test]
async fn test_webhook_accepted_and_failure_detail() {
    let mut h = Harness::new();
    h.platform.script_redeploy(DeploymentState::Ready);
    let app = router(&h);

    let (status, body) = send(
        &app,
        post(
            "/api/webhooks/deployment",
            failure_event(PROJECT, "dpl_1").to_string(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "accepted");
    assert_eq!(body["trigger"], "webhook");

    let failure_id: uuid::Uuid = serde_json::from_value(body["failure_id"].clone()).unwrap();
    h.settle(failure_id).await;

    let (status, body) = send(&app, get(&format!("/api/failures/{failure_id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "fixed_successfully");
    assert_eq!(body["project_id"], PROJECT);
    assert_eq!(body["attempts"].as_array().unwrap().len(), 1);
    assert_eq!(body["attempts"][0]["outcome"], "deployed");

    // duplicate delivery is acknowledged but not acted on
    let (status, body) = send(
        &app,
        post(
            "/api/webhooks/deployment",
            failure_event(PROJECT, "dpl_1").to_string(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "skipped");
    h.shutdown().await;
}

#[tokio::test]
async fn test_webhook_status_codes() {
    let mut h = Harness::new();
    let app = router(&h);

    let ready = json!({
        "eventType": "deployment.succeeded",
        "project": { "id": PROJECT },
        "deployment": { "id": "dpl_1", "state": "READY" }
    });
    let (status, body) = send(&app, post("/api/webhooks/deployment", ready.to_string())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "skipped");

    let (status, body) = send(&app, post("/api/webhooks/deployment", "not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_event");

    let (status, body) = send(
        &app,
        post(
            "/api/webhooks/deployment",
            failure_event("prj_unknown", "dpl_1").to_string(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    assert!(h.store.try_acquire_guard(PROJECT).await.unwrap());
    let (status, body) = send(
        &app,
        post(
            "/api/webhooks/deployment",
            failure_event(PROJECT, "dpl_2").to_string(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["status"], "rejected");
    assert_eq!(body["error"], "concurrency_conflict");
    h.store.release_guard(PROJECT).await.unwrap();
    h.shutdown().await;
}

#[tokio::test]
async fn test_disabled_returns_service_unavailable() {
    let mut h = Harness::with_config(HealerConfig {
        enabled: false,
        ..test_config()
    });
    let app = router(&h);

    let (status, body) = send(
        &app,
        post(
            "/api/webhooks/deployment",
            failure_event(PROJECT, "dpl_1").to_string(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "disabled");

    let (status, _) = send(&app, post(&format!("/api/projects/{PROJECT}/retry"), "")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (_, body) = send(&app, get("/api/status")).await;
    assert_eq!(body["enabled"], false);
    h.shutdown().await;
}

#[tokio::test]
async fn test_manual_retry_endpoint() {
    let mut h = Harness::new();
    let app = router(&h);

    // nothing to retry yet
    let (status, body) = send(&app, post(&format!("/api/projects/{PROJECT}/retry"), "")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, _) = send(&app, post("/api/projects/prj_unknown/retry", "")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = send(
        &app,
        post(
            "/api/webhooks/deployment",
            failure_event(PROJECT, "dpl_1").to_string(),
        ),
    )
    .await;
    let failure_id: uuid::Uuid = serde_json::from_value(body["failure_id"].clone()).unwrap();
    h.settle(failure_id).await;

    let (status, body) = send(
        &app,
        post(
            &format!("/api/projects/{PROJECT}/retry"),
            json!({ "failure_id": failure_id }).to_string(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["trigger"], "manual_retry");
    assert_eq!(body["log_refresh"]["kind"], "unchanged");

    h.settle(failure_id).await;
    let (status, _) = send(
        &app,
        post(&format!("/api/projects/{PROJECT}/retry"), "{not json"),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    h.shutdown().await;
}

#[tokio::test]
async fn test_failure_lookup_errors_and_status() {
    let mut h = Harness::new();
    let app = router(&h);

    let (status, _) = send(&app, get("/api/failures/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, get(&format!("/api/failures/{}", uuid::Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (status, body) = send(&app, get("/api/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");
    assert_eq!(body["enabled"], true);
    assert_eq!(body["storage"], "memory");
    assert_eq!(body["max_attempts"], 5);
    assert!(body["active_cycles"].as_array().unwrap().is_empty());
    assert_eq!(body["projects"][0]["id"], PROJECT);
    assert_eq!(body["projects"][0]["is_fixing"], false);
    h.shutdown().await;
}

#[tokio::test]
async fn test_cancel_live_cycle() {
    let mut h = Harness::new();
    h.codegen.set_mode(CodegenMode::Hang);
    let app = router(&h);

    let (status, _) = send(&app, post("/api/failures/not-a-uuid/cancel", "")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        post(&format!("/api/failures/{}/cancel", uuid::Uuid::new_v4()), ""),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    let (_, body) = send(
        &app,
        post(
            "/api/webhooks/deployment",
            failure_event(PROJECT, "dpl_1").to_string(),
        ),
    )
    .await;
    let failure_id: uuid::Uuid = serde_json::from_value(body["failure_id"].clone()).unwrap();
    h.wait_for_live_cycles(1).await;

    let (_, body) = send(&app, get("/api/status")).await;
    assert_eq!(body["active_cycles"][0]["project_id"], PROJECT);
    assert_eq!(body["projects"][0]["is_fixing"], true);

    let (status, body) = send(&app, post(&format!("/api/failures/{failure_id}/cancel"), "")).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "cancelling");

    let record = h.settle(failure_id).await;
    assert_eq!(record.status, FailureStatus::Interrupted);
    assert_eq!(record.attempt_count, 0);

    // the record is known but nothing runs for it anymore
    let (status, body) = send(&app, post(&format!("/api/failures/{failure_id}/cancel"), "")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "not_running");
    h.shutdown().await;
}
