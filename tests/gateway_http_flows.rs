//! HTTP-level coverage of flows `control_plane`'s own colocated tests don't reach:
//! a full approve-then-invoke round trip that actually executes the tool, the
//! `deny` path permanently blocking a gated invocation, path-escape refusal
//! surfaced as a normal tool error (not a panic or 500), and the recent-audit feed
//! recording everything the other handlers do.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use methings_core::brain::BrainRuntime;
use methings_core::gateway::{build_router, GatewayState};
use methings_core::journal::Journal;
use methings_core::permissions::PermissionBroker;
use methings_core::storage::Storage;
use methings_core::tools::cloud_request::CloudRequestTool;
use methings_core::tools::device_api::DeviceApiProxy;
use methings_core::tools::Dispatcher;
use serde_json::Value;
use tower::ServiceExt;

fn state_with_root(root: std::path::PathBuf) -> GatewayState {
    let storage = Storage::open_in_memory().unwrap();
    let broker = PermissionBroker::new(storage.clone());
    let device_api = Arc::new(DeviceApiProxy::new("http://127.0.0.1:1", broker.clone()));
    let cloud_request = Arc::new(CloudRequestTool::new("http://127.0.0.1:1"));
    let dispatcher = Arc::new(Dispatcher::new(storage.clone(), broker.clone(), device_api, cloud_request, root));
    let journal = Journal::new(storage.clone());
    let brain = Arc::new(BrainRuntime::new(storage.clone(), journal.clone(), dispatcher.clone(), broker.clone(), dispatcher_root()));
    GatewayState::new(storage, broker, dispatcher, journal, brain)
}

fn dispatcher_root() -> std::path::PathBuf {
    std::env::temp_dir()
}

async fn post(app: &axum::Router, uri: &str, body: Value) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
    let json: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn approve_then_invoke_executes_the_tool_and_consumes_the_grant() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("hello.txt"), "hi there").unwrap();
    let app = build_router(state_with_root(dir.path().to_path_buf()));

    let (status, grant) = post(
        &app,
        "/permissions/request",
        serde_json::json!({"tool": "filesystem", "detail": "read hello.txt", "scope": "once"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = grant["id"].as_str().unwrap().to_string();

    let req = Request::builder()
        .method("POST")
        .uri(format!("/permissions/{id}/approve"))
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let (status, result) = post(
        &app,
        "/tools/filesystem/invoke",
        serde_json::json!({
            "request_id": id,
            "args": {"op": "read_file", "path": "hello.txt"},
            "detail": "read hello.txt",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["status"], "ok");
    assert_eq!(result["content"], "hi there");

    let req = Request::builder().uri(format!("/permissions/{id}")).body(Body::empty()).unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let bytes = axum::body::to_bytes(resp.into_body(), 1 << 16).await.unwrap();
    let grant: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(grant["status"], "used");
}

#[tokio::test]
async fn denied_grant_permanently_blocks_the_gated_invocation() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_router(state_with_root(dir.path().to_path_buf()));

    let (_, grant) = post(
        &app,
        "/permissions/request",
        serde_json::json!({"tool": "filesystem", "detail": "list", "scope": "once"}),
    )
    .await;
    let id = grant["id"].as_str().unwrap().to_string();

    let req = Request::builder()
        .method("POST")
        .uri(format!("/permissions/{id}/deny"))
        .body(Body::empty())
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let (status, result) = post(
        &app,
        "/tools/filesystem/invoke",
        serde_json::json!({"request_id": id, "args": {"op": "list_dir", "path": "."}, "detail": "list"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(result["status"], "error");
    assert_eq!(result["error"], "permission_not_approved");
}

#[tokio::test]
async fn path_escape_surfaces_as_an_ordinary_tool_error() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_router(state_with_root(dir.path().to_path_buf()));

    let (_, grant) = post(
        &app,
        "/permissions/request",
        serde_json::json!({"tool": "filesystem", "detail": "read outside root", "scope": "once"}),
    )
    .await;
    let id = grant["id"].as_str().unwrap().to_string();
    let req = Request::builder()
        .method("POST")
        .uri(format!("/permissions/{id}/approve"))
        .body(Body::empty())
        .unwrap();
    app.clone().oneshot(req).await.unwrap();

    let (status, result) = post(
        &app,
        "/tools/filesystem/invoke",
        serde_json::json!({
            "request_id": id,
            "args": {"op": "read_file", "path": "../../../../etc/passwd"},
            "detail": "read outside root",
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(result["status"], "error");
    assert_eq!(result["error"], "path_outside_user_dir");
}

#[tokio::test]
async fn recent_audit_records_permission_and_tool_events() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_router(state_with_root(dir.path().to_path_buf()));

    post(
        &app,
        "/permissions/request",
        serde_json::json!({"tool": "filesystem", "detail": "list", "scope": "once"}),
    )
    .await;

    let req = Request::builder().uri("/audit/recent?limit=10").body(Body::empty()).unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), 1 << 16).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    let events = body["events"].as_array().unwrap();
    assert!(events.iter().any(|e| e["event"] == "permission_requested"));
}
