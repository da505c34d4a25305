//! End-to-end coverage of the Tool-Loop Protocol against a mocked model endpoint:
//! a device-gated function call stops the loop with a permission-required message
//! instead of blocking, and a model that never stops calling tools is cut off at
//! `max_tool_rounds` with a summary instead of looping forever.

use std::sync::Arc;
use std::time::Duration;

use methings_core::brain::{BrainRuntime, RuntimeConfig};
use methings_core::journal::Journal;
use methings_core::permissions::PermissionBroker;
use methings_core::storage::Storage;
use methings_core::tools::cloud_request::CloudRequestTool;
use methings_core::tools::device_api::DeviceApiProxy;
use methings_core::tools::Dispatcher;
use serde_json::json;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn build_runtime(storage: Storage, root: std::path::PathBuf) -> Arc<BrainRuntime> {
    let broker = PermissionBroker::new(storage.clone());
    let device_api = Arc::new(DeviceApiProxy::new("http://127.0.0.1:1", broker.clone()));
    let cloud_request = Arc::new(CloudRequestTool::new("http://127.0.0.1:1"));
    let dispatcher = Arc::new(Dispatcher::new(storage.clone(), broker.clone(), device_api, cloud_request, root));
    let journal = Journal::new(storage.clone());
    Arc::new(BrainRuntime::new(storage, journal, dispatcher, broker, std::env::temp_dir()))
}

async fn wait_for_assistant_reply(runtime: &BrainRuntime, journal: &Journal, session_id: &str) -> String {
    for _ in 0..100 {
        let rows = journal.list_for_session(session_id, 50).unwrap();
        if let Some(last) = rows.iter().rev().find(|r| r.role == "assistant") {
            if !runtime.status().await.busy {
                return last.text.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("brain runtime never produced an assistant reply for session {session_id}");
}

#[tokio::test]
async fn device_gated_function_call_stops_with_permission_message() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "resp_1",
            "output": [{
                "type": "function_call",
                "call_id": "call_1",
                "name": "device_api",
                "arguments": "{\"action\":\"camera.capture\",\"payload\":{}}",
            }],
        })))
        .mount(&provider)
        .await;

    let storage = Storage::open_in_memory().unwrap();
    let mut config = RuntimeConfig::default();
    config.provider_url = format!("{}/responses", provider.uri());
    config.model = "test-model".to_string();
    config.max_tool_rounds = 3;
    config.idle_sleep_ms = 20;
    config.save(&storage).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let runtime = build_runtime(storage.clone(), dir.path().to_path_buf());
    let journal = Journal::new(storage);
    runtime.start();

    runtime
        .enqueue_chat("please check the camera".to_string(), json!({"session_id": "camera-session"}))
        .await;

    let reply = wait_for_assistant_reply(&runtime, &journal, "camera-session").await;
    assert!(reply.contains("Permission required"), "unexpected reply: {reply}");
    assert!(reply.contains("device.camera"), "unexpected reply: {reply}");

    runtime.stop().await;
}

#[tokio::test]
async fn endless_tool_calls_are_cut_off_at_max_rounds() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "resp_loop",
            "output": [{
                "type": "function_call",
                "call_id": "call_n",
                "name": "list_dir",
                "arguments": "{\"path\":\".\"}",
            }],
        })))
        .mount(&provider)
        .await;

    let storage = Storage::open_in_memory().unwrap();
    let mut config = RuntimeConfig::default();
    config.provider_url = format!("{}/responses", provider.uri());
    config.model = "test-model".to_string();
    config.max_tool_rounds = 2;
    config.idle_sleep_ms = 20;
    config.save(&storage).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let runtime = build_runtime(storage.clone(), dir.path().to_path_buf());
    let journal = Journal::new(storage);
    runtime.start();

    runtime
        .enqueue_chat("keep listing files until done".to_string(), json!({"session_id": "loop-session"}))
        .await;

    let reply = wait_for_assistant_reply(&runtime, &journal, "loop-session").await;
    assert!(
        reply.contains("did not finish within the allowed rounds"),
        "unexpected reply: {reply}"
    );
    assert!(reply.contains("list_dir=ok"), "unexpected reply: {reply}");

    runtime.stop().await;
}
