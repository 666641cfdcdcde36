
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use conductor_lite::api::{router, ApiState};
use test_harness::test_orchestrator;

/// Create a test app over a fresh orchestrator
fn create_test_app() -> Router {
    router(ApiState {
        orchestrator: test_orchestrator(),
    })
}

/// Send one request, returning the status and the JSON body (Null if empty)
async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn register(app: &Router, worker_id: &str) {
    let (status, body) = send(
        app,
        Method::POST,
        "/workers/register",
        Some(json!({
            "worker_id": worker_id,
            "hostname": "test-host",
            "capabilities": ["linux"],
            "max_concurrency": 2,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["worker_id"], worker_id);
}

async fn submit(app: &Router, nodes: Value) -> String {
    let (status, body) = send(
        app,
        Method::POST,
        "/executions",
        Some(json!({"workflow_id": "etl", "nodes": nodes})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "body: {body}");
    body["execution_id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_submit_and_get_execution() {
    let app = create_test_app();
    let id = submit(
        &app,
        json!([
            {"id": "extract", "handler_name": "echo"},
            {"id": "load", "handler_name": "echo", "depends_on": ["extract"]},
        ]),
    )
    .await;

    let (status, body) = send(&app, Method::GET, &format!("/executions/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["workflow_id"], "etl");
    assert_eq!(body["status"], "running");
    assert_eq!(body["nodes"]["extract"]["status"], "queued");
    assert_eq!(body["nodes"]["load"]["status"], "waiting");
    // Internal dispatch details are not exposed
    assert!(body["nodes"]["extract"].get("dispatch_token").is_none());
    assert!(body["nodes"]["extract"].get("receipt").is_none());

    let (status, body) = send(&app, Method::GET, "/executions", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_submit_cyclic_graph_is_bad_request() {
    let app = create_test_app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/executions",
        Some(json!({
            "workflow_id": "loop",
            "nodes": [
                {"id": "a", "handler_name": "echo", "depends_on": ["b"]},
                {"id": "b", "handler_name": "echo", "depends_on": ["a"]},
            ],
        })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "cyclic_graph");

    let (_, list) = send(&app, Method::GET, "/executions", None).await;
    assert!(list.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_execution_is_not_found() {
    let app = create_test_app();
    let uri = format!("/executions/{}", uuid::Uuid::new_v4());
    let (status, body) = send(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "execution_not_found");
}

#[tokio::test]
async fn test_worker_dispatch_lifecycle() {
    let app = create_test_app();
    register(&app, "w1").await;

    // Nothing to do yet
    let (status, _) = send(&app, Method::POST, "/workers/w1/poll", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let id = submit(&app, json!([{"id": "only", "handler_name": "echo"}])).await;

    let (status, dispatch) = send(&app, Method::POST, "/workers/w1/poll", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dispatch["node_id"], "only");
    assert_eq!(dispatch["attempt"], 0);
    let token = dispatch["token"].as_str().unwrap().to_string();

    let (status, _) = send(&app, Method::POST, &format!("/dispatches/{token}/start"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/dispatches/{token}/progress"),
        Some(json!({"checkpoint_ref": "ckpt-1"})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/dispatches/{token}/complete"),
        Some(json!({"output": {"rows": 10}})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = send(&app, Method::GET, &format!("/executions/{id}"), None).await;
    assert_eq!(body["status"], "completed");
    assert_eq!(body["nodes"]["only"]["output"], json!({"rows": 10}));
    assert_eq!(body["nodes"]["only"]["checkpoint_ref"], "ckpt-1");

    // The token is spent
    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/dispatches/{token}/complete"),
        Some(json!({"output": null})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "invalid_dispatch_token");
}

#[tokio::test]
async fn test_fail_endpoint_defaults_to_retryable() {
    let app = create_test_app();
    register(&app, "w1").await;
    let id = submit(
        &app,
        json!([{
            "id": "flaky",
            "handler_name": "shell",
            "retry_policy": {"max_attempts": 2, "backoff_base_ms": 10},
        }]),
    )
    .await;

    let (_, dispatch) = send(&app, Method::POST, "/workers/w1/poll", None).await;
    let token = dispatch["token"].as_str().unwrap().to_string();
    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/dispatches/{token}/fail"),
        Some(json!({"error": "exit 1"})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = send(&app, Method::GET, &format!("/executions/{id}"), None).await;
    assert_eq!(body["status"], "running");
    assert_eq!(body["nodes"]["flaky"]["status"], "queued");
    assert_eq!(body["nodes"]["flaky"]["attempt"], 1);
    assert_eq!(body["nodes"]["flaky"]["error"], "exit 1");
}

#[tokio::test]
async fn test_unregistered_worker_cannot_poll() {
    let app = create_test_app();
    let (status, body) = send(&app, Method::POST, "/workers/ghost/poll", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "worker_not_found");

    let (status, _) = send(
        &app,
        Method::POST,
        "/workers/ghost/heartbeat",
        Some(json!({"current_load": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, Method::DELETE, "/workers/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_heartbeat_and_deregister() {
    let app = create_test_app();
    register(&app, "w1").await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/workers/w1/heartbeat",
        Some(json!({"current_load": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], json!([]));

    let (_, workers) = send(&app, Method::GET, "/workers", None).await;
    assert_eq!(workers[0]["current_load"], 1);

    let (status, _) = send(&app, Method::DELETE, "/workers/w1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (_, workers) = send(&app, Method::GET, "/workers", None).await;
    assert!(workers.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancel_pause_resume() {
    let app = create_test_app();
    let id = submit(
        &app,
        json!([
            {"id": "a", "handler_name": "echo"},
            {"id": "b", "handler_name": "echo"},
        ]),
    )
    .await;

    let (status, body) = send(&app, Method::POST, &format!("/executions/{id}/pause"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "paused");
    let (_, stats) = send(&app, Method::GET, "/queue/stats", None).await;
    assert_eq!(stats["depth"], 0);

    let (status, body) = send(&app, Method::POST, &format!("/executions/{id}/resume"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");
    let (_, stats) = send(&app, Method::GET, "/queue/stats", None).await;
    assert_eq!(stats["depth"], 2);

    let (status, body) = send(&app, Method::POST, &format!("/executions/{id}/cancel"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "cancelled");

    // A cancelled execution cannot be resumed
    let (status, body) = send(&app, Method::POST, &format!("/executions/{id}/resume"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "invalid_transition");
}

#[tokio::test]
async fn test_queue_stats_and_dead_letters() {
    let app = create_test_app();
    register(&app, "w1").await;
    submit(
        &app,
        json!([
            {"id": "gpu-job", "handler_name": "shell", "required_capabilities": ["gpu"]},
            {"id": "doomed", "handler_name": "shell", "retry_policy": {"max_attempts": 1, "backoff_base_ms": 10}},
        ]),
    )
    .await;

    let (_, dispatch) = send(&app, Method::POST, "/workers/w1/poll", None).await;
    assert_eq!(dispatch["node_id"], "doomed");
    let token = dispatch["token"].as_str().unwrap().to_string();
    send(
        &app,
        Method::POST,
        &format!("/dispatches/{token}/fail"),
        Some(json!({"error": "segfault"})),
    )
    .await;

    let (status, stats) = send(&app, Method::GET, "/queue/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["depth"], 1);
    assert_eq!(stats["unschedulable"], 1);
    assert_eq!(stats["dead_letter_count"], 1);

    let (status, dead) = send(&app, Method::GET, "/queue/dead-letters", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(dead[0]["entry"]["job_id"], "doomed");
    assert_eq!(dead[0]["reason"], "segfault");
}

#[tokio::test]
async fn test_health_endpoint() {
    let app = create_test_app();
    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["healthy"], true);
    assert_eq!(body["store"]["healthy"], true);
    assert_eq!(body["active_workers"], 0);
}

#[tokio::test]
async fn test_invalid_priority_is_bad_request() {
    let app = create_test_app();
    let (status, body) = send(
        &app,
        Method::POST,
        "/executions",
        Some(json!({
            "workflow_id": "wf",
            "nodes": [{"id": "a", "handler_name": "echo", "priority": 42}],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "body: {body}");
}
