//! End-to-end coverage of the Device API Proxy against a mocked peer, driven through
//! the public `Dispatcher` surface: the ungated read verb passes straight through,
//! the gated verb round-trips through the Permission Broker before the peer ever
//! sees the call, and the approved grant is cached for the next invocation of the
//! same capability.

use std::sync::Arc;

use methings_core::permissions::PermissionBroker;
use methings_core::storage::Storage;
use methings_core::tools::cloud_request::CloudRequestTool;
use methings_core::tools::device_api::DeviceApiProxy;
use methings_core::tools::{DispatchResult, Dispatcher};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn dispatcher(peer_uri: &str, broker: PermissionBroker, root: std::path::PathBuf) -> Dispatcher {
    let device_api = Arc::new(DeviceApiProxy::new(peer_uri, broker.clone()));
    let cloud_request = Arc::new(CloudRequestTool::new(peer_uri));
    Dispatcher::new(Storage::open_in_memory().unwrap(), broker, device_api, cloud_request, root)
}

#[tokio::test]
async fn ungated_action_proxies_straight_through() {
    let peer = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/python/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"running": true})))
        .mount(&peer)
        .await;

    let broker = PermissionBroker::new(Storage::open_in_memory().unwrap());
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = dispatcher(&peer.uri(), broker, dir.path().to_path_buf());

    let result = dispatcher
        .invoke(
            "device_api",
            serde_json::json!({"action": "python.status", "payload": {}}),
            None,
            "check python status",
            "default",
        )
        .await;
    match result {
        DispatchResult::Ok { value } => {
            assert_eq!(value["http_status"], 200);
            assert_eq!(value["body"]["running"], true);
        }
        other => panic!("expected Ok, got {other:?}"),
    }
}

#[tokio::test]
async fn gated_action_requires_approval_before_reaching_peer() {
    let peer = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/camera/capture"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"frame": "b64"})))
        .mount(&peer)
        .await;

    let broker = PermissionBroker::new(Storage::open_in_memory().unwrap());
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = dispatcher(&peer.uri(), broker.clone(), dir.path().to_path_buf());

    // First call: no grant exists yet, the peer must not be contacted.
    let first = dispatcher
        .invoke(
            "device_api",
            serde_json::json!({"action": "camera.capture", "payload": {}}),
            None,
            "take a photo",
            "default",
        )
        .await;
    let grant = match first {
        DispatchResult::PermissionRequired { request } => request,
        other => panic!("expected permission_required, got {other:?}"),
    };
    assert_eq!(grant.tool, "device.camera");
    assert_eq!(grant.status, "pending");

    // Approve out of band (as the consent UI would) and retry.
    broker.approve(&grant.id).unwrap();
    let second = dispatcher
        .invoke(
            "device_api",
            serde_json::json!({"action": "camera.capture", "payload": {}}),
            None,
            "take a photo",
            "default",
        )
        .await;
    match second {
        DispatchResult::Ok { value } => {
            assert_eq!(value["http_status"], 200);
            assert_eq!(value["body"]["frame"], "b64");
        }
        other => panic!("expected Ok, got {other:?}"),
    }

    // A third call for the same capability should hit the cached grant without
    // creating a fresh pending request.
    let pending_before = broker.list_pending().unwrap().len();
    let third = dispatcher
        .invoke(
            "device_api",
            serde_json::json!({"action": "camera.capture", "payload": {}}),
            None,
            "take a photo",
            "default",
        )
        .await;
    assert!(matches!(third, DispatchResult::Ok { .. }));
    assert_eq!(broker.list_pending().unwrap().len(), pending_before);
}

#[tokio::test]
async fn unknown_action_is_rejected_without_contacting_peer() {
    let peer = MockServer::start().await;
    let broker = PermissionBroker::new(Storage::open_in_memory().unwrap());
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = dispatcher(&peer.uri(), broker, dir.path().to_path_buf());

    let result = dispatcher
        .invoke(
            "device_api",
            serde_json::json!({"action": "not.a.real.verb", "payload": {}}),
            None,
            "",
            "default",
        )
        .await;
    assert!(matches!(result, DispatchResult::Error { error, .. } if error == "unknown_action"));
}
