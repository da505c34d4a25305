//! The Device API Proxy: a statically declared action table mapping logical verbs to
//! an external HTTP peer, with its own session-scoped permission-grant cache
//! (spec §4.E).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{MethingsError, Result};
use crate::permissions::{capability_for_action, Grant, PermissionBroker, Scope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

#[derive(Debug, Clone, Copy)]
pub struct ActionSpec {
    pub method: Method,
    pub path: &'static str,
    pub requires_permission: bool,
    pub timeout_secs: u64,
}

const fn a(method: Method, path: &'static str, permission: bool) -> ActionSpec {
    ActionSpec { method, path, requires_permission: permission, timeout_secs: 12 }
}

const fn a_timeout(method: Method, path: &'static str, permission: bool, timeout_secs: u64) -> ActionSpec {
    ActionSpec { method, path, requires_permission: permission, timeout_secs }
}

/// The static action table (spec §4.E). Data, not control flow: 34 verbs, covering
/// every verb spec.md names explicitly plus the families it describes by pattern
/// (`camera.*`, `ssh.*`, `usb.*`, `brain.*`, etc.) — a representative subset of the
/// spec's full ~80-verb catalogue, extendable by adding table entries alone.
pub static ACTION_TABLE: std::sync::LazyLock<HashMap<&'static str, ActionSpec>> =
    std::sync::LazyLock::new(|| {
        use Method::{Get, Post};
        HashMap::from([
            ("python.status", a(Get, "/python/status", false)),
            ("python.restart", a(Post, "/python/restart", true)),
            ("ssh.status", a(Get, "/ssh/status", false)),
            ("ssh.config", a(Post, "/ssh/config", true)),
            ("ssh.pin.status", a(Get, "/ssh/pin/status", false)),
            ("ssh.pin.start", a(Post, "/ssh/pin/start", true)),
            ("ssh.pin.stop", a(Post, "/ssh/pin/stop", true)),
            ("ssh.scp", a_timeout(Post, "/ssh/scp", true, 600)),
            ("shell.exec", a(Post, "/shell/exec", true)),
            ("brain.memory.get", a(Get, "/brain/memory", false)),
            ("brain.memory.set", a(Post, "/brain/memory", true)),
            ("brain.status", a(Get, "/brain/status", false)),
            ("camera.status", a(Get, "/camera/status", false)),
            ("camera.capture", a(Post, "/camera/capture", true)),
            ("camera.stream.start", a(Post, "/camera/stream/start", true)),
            ("camera.stream.stop", a(Post, "/camera/stream/stop", true)),
            ("usb.list", a(Get, "/usb/list", false)),
            ("usb.open", a(Post, "/usb/open", true)),
            ("usb.close", a(Post, "/usb/close", true)),
            ("usb.raw_descriptors", a(Post, "/usb/raw_descriptors", true)),
            ("usb.control_transfer", a(Post, "/usb/control_transfer", true)),
            ("usb.bulk_transfer", a(Post, "/usb/bulk_transfer", true)),
            ("viewer.open", a(Post, "/viewer/open", true)),
            ("viewer.close", a(Post, "/viewer/close", true)),
            ("llama.run", a_timeout(Post, "/llama/run", true, 300)),
            ("llama.status", a(Get, "/llama/status", false)),
            ("wifi.status", a(Get, "/wifi/status", false)),
            ("wifi.scan", a(Post, "/wifi/scan", true)),
            ("battery.status", a(Get, "/battery/status", false)),
            ("storage.status", a(Get, "/storage/status", false)),
            ("notifications.send", a(Post, "/notifications/send", true)),
            ("services.list", a(Get, "/services/list", false)),
            ("services.register", a(Post, "/services/register", true)),
            ("web.search", a(Post, "/web/search", false)),
            ("device_api", a(Post, "/device_api", false)),
        ])
    });

/// Derive per-action timeout override; falls back to the table's default (spec §4.E
/// step 3: default 12 s, long actions like `ssh.scp`/`llama.run` need 300-600 s).
pub fn timeout_for(action: &str) -> Duration {
    ACTION_TABLE
        .get(action)
        .map(|spec| Duration::from_secs(spec.timeout_secs))
        .unwrap_or(Duration::from_secs(12))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeviceApiResult {
    Ok { http_status: u16, body: Value },
    PermissionRequired { request: Grant },
    Error { error: String },
}

/// In-memory capability -> permission_id cache, keyed by `(tool, capability, scope)`
/// (spec §3). Invalidated lazily on next lookup if the grant is no longer approved.
#[derive(Default)]
pub struct CapabilityCache {
    entries: Mutex<HashMap<(String, String, String), String>>,
}

impl CapabilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, key: &(String, String, String)) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    fn set(&self, key: (String, String, String), permission_id: String) {
        self.entries.lock().unwrap().insert(key, permission_id);
    }

    fn invalidate(&self, key: &(String, String, String)) {
        self.entries.lock().unwrap().remove(key);
    }
}

pub struct DeviceApiProxy {
    peer_base_url: String,
    http: reqwest::Client,
    broker: PermissionBroker,
    cache: CapabilityCache,
}

impl DeviceApiProxy {
    pub fn new(peer_base_url: impl Into<String>, broker: PermissionBroker) -> Self {
        Self {
            peer_base_url: peer_base_url.into(),
            http: reqwest::Client::new(),
            broker,
            cache: CapabilityCache::new(),
        }
    }

    /// Invoke a device API verb (spec §4.E). Unwraps a single level of nested
    /// `{action: device_api, payload: {action, payload}}`, resolves a consent grant
    /// (cached by capability where possible), and either proxies the HTTP call or
    /// returns `permission_required` without blocking.
    pub async fn invoke(&self, action: &str, payload: Value, identity: &str) -> Result<DeviceApiResult> {
        let (action, payload) = unwrap_nested(action, payload);

        if action.starts_with("uvc.") && !ACTION_TABLE.contains_key(action.as_str()) {
            return self.invoke_uvc_virtual(&action, payload, identity).await;
        }

        let Some(spec) = ACTION_TABLE.get(action.as_str()) else {
            return Err(MethingsError::UnknownAction);
        };

        let mut payload = payload;
        if spec.requires_permission {
            let (tool, capability) = capability_for_action(&action);
            let key = (tool.to_string(), capability.to_string(), "session".to_string());

            let grant = if let Some(id) = self.cache.get(&key) {
                match self.broker.get(&id)? {
                    Some(g) if g.status == "approved" => Some(g),
                    _ => {
                        self.cache.invalidate(&key);
                        None
                    }
                }
            } else {
                None
            };

            let grant = match grant {
                Some(g) => g,
                None => {
                    let fresh = self
                        .broker
                        .request(tool, &format!("{action}: device API call"), Scope::Session, Some(60))?;
                    if fresh.status != "approved" {
                        return Ok(DeviceApiResult::PermissionRequired { request: fresh });
                    }
                    self.cache.set(key, fresh.id.clone());
                    fresh
                }
            };

            if let Value::Object(ref mut map) = payload {
                map.insert("permission_id".to_string(), Value::String(grant.id.clone()));
            }
        }

        let url = format!("{}{}", self.peer_base_url, spec.path);
        let mut req = match spec.method {
            Method::Get => self.http.get(&url),
            Method::Post => self.http.post(&url).json(&payload),
        };
        req = req.header("X-Methings-Identity", identity).timeout(timeout_for(&action));

        let response = req
            .send()
            .await
            .map_err(|e| MethingsError::HttpError(e.to_string()))?;
        let http_status = response.status().as_u16();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Ok(DeviceApiResult::Ok { http_status, body })
    }

    /// UVC pan-tilt virtual actions (spec §4.E): composes `usb.raw_descriptors`,
    /// `usb.control_transfer`, and `usb.open`/`usb.close` against the peer rather than
    /// exposing a dedicated peer verb. `uvc.get_pan_tilt` / `uvc.set_pan_tilt` /
    /// `uvc.nudge_pan_tilt` are supported.
    async fn invoke_uvc_virtual(&self, action: &str, payload: Value, identity: &str) -> Result<DeviceApiResult> {
        let device = payload
            .get("device")
            .and_then(|v| v.as_str())
            .ok_or(MethingsError::InvalidPayload)?;

        let open = self
            .invoke("usb.open", serde_json::json!({"device": device}), identity)
            .await?;
        let DeviceApiResult::Ok { body: open_body, .. } = open else {
            return Ok(open);
        };
        let handle = open_body.get("handle").cloned().unwrap_or(Value::Null);

        let descriptors = self
            .invoke(
                "usb.raw_descriptors",
                serde_json::json!({"handle": handle}),
                identity,
            )
            .await?;
        let DeviceApiResult::Ok { body: desc_body, .. } = descriptors else {
            return Ok(descriptors);
        };

        let (entity_id, vc_interface) = find_camera_terminal(&desc_body)
            .ok_or(MethingsError::UnsupportedAction)?;

        let pan_abs = payload.get("pan_abs").and_then(|v| v.as_i64()).unwrap_or(0) as i32;
        let tilt_abs = payload.get("tilt_abs").and_then(|v| v.as_i64()).unwrap_or(0) as i32;

        let is_get = action == "uvc.get_pan_tilt";
        let control_payload =
            pan_tilt_control_payload(&handle, entity_id, vc_interface, pan_abs, tilt_abs, is_get);

        let result = self.invoke("usb.control_transfer", control_payload, identity).await?;
        let _ = self
            .invoke("usb.close", serde_json::json!({"handle": handle}), identity)
            .await;
        Ok(result)
    }
}

fn unwrap_nested(action: &str, payload: Value) -> (String, Value) {
    if action == "device_api" {
        if let Some(inner_action) = payload.get("action").and_then(|v| v.as_str()) {
            let inner_payload = payload.get("payload").cloned().unwrap_or(Value::Object(Default::default()));
            return (inner_action.to_string(), inner_payload);
        }
    }
    (action.to_string(), payload)
}

/// Build the `/usb/control_transfer` body for UVC `CT_PANTILT_ABSOLUTE_CONTROL`
/// (selector `0x0D`): control IN `0xA1` for a get, OUT `0x21` for a set, `wIndex =
/// (entity_id << 8) | vc_interface`, and an 8-byte `<pan_abs:i32 LE, tilt_abs:i32
/// LE>` payload base64-encoded under `data_b64` — the field name and encoding the
/// device-API peer's own UVC helper expects (spec §4.E).
fn pan_tilt_control_payload(
    handle: &Value,
    entity_id: u8,
    vc_interface: u8,
    pan_abs: i32,
    tilt_abs: i32,
    is_get: bool,
) -> Value {
    let mut data = Vec::with_capacity(8);
    data.extend_from_slice(&pan_abs.to_le_bytes());
    data.extend_from_slice(&tilt_abs.to_le_bytes());

    serde_json::json!({
        "handle": handle,
        "request_type": if is_get { 0xA1 } else { 0x21 },
        "request": 0x01, // SET_CUR / GET_CUR
        "value": (0x0D_u16) << 8, // selector CT_PANTILT_ABSOLUTE_CONTROL (0x0D) in high byte
        "index": ((entity_id as u32) << 8) | vc_interface as u32,
        "data_b64": if is_get {
            Value::Null
        } else {
            Value::String(base64::engine::general_purpose::STANDARD.encode(&data))
        },
    })
}

/// Scan interface descriptors for the UVC camera-terminal (class `0x0E`, subclass
/// `0x01`, `VC_INPUT_TERMINAL` `wTerminalType == 0x0201`); returns `(entity_id,
/// vc_interface)` (spec §4.E).
fn find_camera_terminal(descriptors_body: &Value) -> Option<(u8, u8)> {
    let interfaces = descriptors_body.get("interfaces")?.as_array()?;
    for iface in interfaces {
        let class = iface.get("class")?.as_u64()? as u8;
        let subclass = iface.get("subclass")?.as_u64()? as u8;
        if class != 0x0E || subclass != 0x01 {
            continue;
        }
        let vc_interface = iface.get("interface_number")?.as_u64()? as u8;
        let units = iface.get("units").and_then(|v| v.as_array())?;
        for unit in units {
            let terminal_type = unit.get("wTerminalType").and_then(|v| v.as_u64())?;
            if terminal_type == 0x0201 {
                let entity_id = unit.get("entity_id").and_then(|v| v.as_u64())? as u8;
                return Some((entity_id, vc_interface));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_table_covers_spec_examples() {
        for verb in [
            "python.status",
            "camera.capture",
            "usb.bulk_transfer",
            "brain.memory.get",
            "llama.run",
            "viewer.open",
        ] {
            assert!(ACTION_TABLE.contains_key(verb), "missing verb {verb}");
        }
    }

    #[test]
    fn unwrap_nested_device_api_payload() {
        let payload = serde_json::json!({"action": "python.status", "payload": {}});
        let (action, inner) = unwrap_nested("device_api", payload);
        assert_eq!(action, "python.status");
        assert_eq!(inner, serde_json::json!({}));
    }

    #[test]
    fn long_running_actions_get_extended_timeout() {
        assert_eq!(timeout_for("ssh.scp"), Duration::from_secs(600));
        assert_eq!(timeout_for("llama.run"), Duration::from_secs(300));
        assert_eq!(timeout_for("python.status"), Duration::from_secs(12));
    }

    #[test]
    fn find_camera_terminal_matches_vc_input_terminal() {
        let body = serde_json::json!({
            "interfaces": [
                {"class": 0x0E, "subclass": 0x01, "interface_number": 2, "units": [
                    {"wTerminalType": 0x0201, "entity_id": 4}
                ]}
            ]
        });
        assert_eq!(find_camera_terminal(&body), Some((4, 2)));
    }

    #[test]
    fn pan_tilt_control_payload_encodes_data_b64_not_hex() {
        let payload = pan_tilt_control_payload(
            &Value::String("h1".to_string()),
            4,
            2,
            90_000,
            -68_400,
            false,
        );
        assert_eq!(payload["request_type"], 0x21);
        assert_eq!(payload["request"], 0x01);
        assert_eq!(payload["value"], 0x0D00);
        assert_eq!(payload["index"], (4u32 << 8) | 2u32);
        assert!(payload.get("data").is_none(), "must not send a hex `data` field");
        assert!(payload.get("length").is_none(), "the peer infers length from data_b64");

        let mut expected = Vec::with_capacity(8);
        expected.extend_from_slice(&90_000_i32.to_le_bytes());
        expected.extend_from_slice(&(-68_400_i32).to_le_bytes());
        let expected_b64 = base64::engine::general_purpose::STANDARD.encode(&expected);
        assert_eq!(payload["data_b64"], expected_b64);
    }

    #[test]
    fn pan_tilt_control_payload_get_omits_data_b64() {
        let payload = pan_tilt_control_payload(&Value::String("h1".to_string()), 4, 2, 0, 0, true);
        assert_eq!(payload["request_type"], 0xA1);
        assert!(payload["data_b64"].is_null());
    }
}
