//! The in-process curl emulator driven end-to-end through the gated shell tool
//! against a mocked HTTP endpoint: the permission round trip, `-i` include-headers
//! mode, and the `-w` write-out template all exercised together.

use std::sync::Arc;

use methings_core::permissions::{PermissionBroker, Scope};
use methings_core::storage::Storage;
use methings_core::tools::cloud_request::CloudRequestTool;
use methings_core::tools::device_api::DeviceApiProxy;
use methings_core::tools::{DispatchResult, Dispatcher};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn dispatcher(root: std::path::PathBuf) -> (Dispatcher, PermissionBroker) {
    let storage = Storage::open_in_memory().unwrap();
    let broker = PermissionBroker::new(storage.clone());
    let device_api = Arc::new(DeviceApiProxy::new("http://127.0.0.1:1", broker.clone()));
    let cloud_request = Arc::new(CloudRequestTool::new("http://127.0.0.1:1"));
    (
        Dispatcher::new(storage, broker.clone(), device_api, cloud_request, root),
        broker,
    )
}

#[tokio::test]
async fn approved_curl_include_mode_reports_status_line_and_write_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/widgets"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, broker) = dispatcher(dir.path().to_path_buf());

    let grant = broker.request("shell", "curl the widgets endpoint", Scope::Once, None).unwrap();
    broker.approve(&grant.id).unwrap();

    let url = format!("{}/widgets", server.uri());
    let result = dispatcher
        .invoke(
            "shell",
            serde_json::json!({"cmd": "curl", "args": format!("-i -w '\\ncode=%{{http_code}}' {url}"), "cwd": ""}),
            Some(grant.id.as_str()),
            "curl the widgets endpoint",
            "default",
        )
        .await;

    let value = match result {
        DispatchResult::Ok { value } => value,
        other => panic!("expected Ok, got {other:?}"),
    };
    let output = value["output"].as_str().unwrap();
    assert!(output.contains("HTTP/1.1 200"));
    assert!(output.contains("hello"));
    assert!(output.contains("code=200"));

    // A once-scoped grant is consumed after a successful run.
    let consumed = broker.get(&grant.id).unwrap().unwrap();
    assert_eq!(consumed.status, "used");
}

#[tokio::test]
async fn fail_flag_turns_http_error_into_exit_22() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, broker) = dispatcher(dir.path().to_path_buf());
    let grant = broker.request("shell", "curl", Scope::Once, None).unwrap();
    broker.approve(&grant.id).unwrap();

    let url = format!("{}/missing", server.uri());
    let result = dispatcher
        .invoke(
            "shell",
            serde_json::json!({"cmd": "curl", "args": format!("-f {url}"), "cwd": ""}),
            Some(grant.id.as_str()),
            "curl",
            "default",
        )
        .await;
    let value = match result {
        DispatchResult::Ok { value } => value,
        other => panic!("expected Ok, got {other:?}"),
    };
    assert_eq!(value["code"], 22);
    assert_eq!(value["status"], "error");
}

#[tokio::test]
async fn shell_tool_without_permission_id_is_gated() {
    let dir = tempfile::tempdir().unwrap();
    let (dispatcher, _broker) = dispatcher(dir.path().to_path_buf());
    let result = dispatcher
        .invoke(
            "shell",
            serde_json::json!({"cmd": "curl", "args": "http://example.com", "cwd": ""}),
            None,
            "curl something",
            "default",
        )
        .await;
    assert!(matches!(result, DispatchResult::PermissionRequired { .. }));
}
