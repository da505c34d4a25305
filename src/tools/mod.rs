//! The Tool Dispatcher: uniform invocation of the closed tool set `{filesystem,
//! shell, device_api, cloud_request}` with per-tool permission policy (spec §4.D).

pub mod cloud_request;
pub mod device_api;
pub mod filesystem;
pub mod shell;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::errors::{MethingsError, Result};
use crate::permissions::{Grant, PermissionBroker, Scope};
use crate::storage::Storage;
use cloud_request::{CloudRequestTemplate, CloudRequestTool};
use device_api::DeviceApiProxy;

/// The closed set of tool names the dispatcher recognises (spec §4.D).
pub const REGISTERED_TOOLS: &[&str] = &["filesystem", "shell", "device_api", "cloud_request"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchResult {
    Ok { #[serde(flatten)] value: Value },
    PermissionRequired { request: Grant },
    PermissionExpired { request: Grant },
    Error { error: String, detail: Option<String> },
}

impl DispatchResult {
    pub fn error(kind: MethingsError) -> Self {
        Self::Error { error: kind.kind().to_string(), detail: None }
    }

    pub fn error_detail(kind: MethingsError, detail: impl Into<String>) -> Self {
        Self::Error { error: kind.kind().to_string(), detail: Some(detail.into()) }
    }
}

pub struct Dispatcher {
    storage: Storage,
    broker: PermissionBroker,
    device_api: Arc<DeviceApiProxy>,
    cloud_request: Arc<CloudRequestTool>,
    user_root: PathBuf,
}

impl Dispatcher {
    pub fn new(
        storage: Storage,
        broker: PermissionBroker,
        device_api: Arc<DeviceApiProxy>,
        cloud_request: Arc<CloudRequestTool>,
        user_root: PathBuf,
    ) -> Self {
        Self { storage, broker, device_api, cloud_request, user_root }
    }

    /// `Invoke(name, args, permission_id?, detail) -> Result` (spec §4.D).
    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        permission_id: Option<&str>,
        detail: &str,
        identity: &str,
    ) -> DispatchResult {
        if !REGISTERED_TOOLS.contains(&name) {
            return DispatchResult::error(MethingsError::UnknownTool);
        }

        let result = match name {
            // device_api / cloud_request own their permission flow internally; the
            // dispatcher passes through without acquiring a grant.
            "device_api" => self.invoke_device_api(args, identity).await,
            "cloud_request" => self.invoke_cloud_request(args, identity).await,
            "filesystem" | "shell" => {
                self.invoke_gated(name, args, permission_id, detail).await
            }
            _ => unreachable!("checked against REGISTERED_TOOLS above"),
        };

        let audit_payload = serde_json::json!({"tool": name, "result": &result});
        if let Err(e) = self.storage.add_audit("tool_invoked", &audit_payload.to_string()) {
            warn!("failed to write tool_invoked audit event: {e}");
        }

        result
    }

    async fn invoke_device_api(&self, args: Value, identity: &str) -> DispatchResult {
        let Some(action) = args.get("action").and_then(|v| v.as_str()) else {
            return DispatchResult::error(MethingsError::MissingName);
        };
        let payload = args.get("payload").cloned().unwrap_or(Value::Object(Default::default()));
        match self.device_api.invoke(action, payload, identity).await {
            Ok(device_api::DeviceApiResult::Ok { http_status, body }) => {
                DispatchResult::Ok { value: serde_json::json!({"http_status": http_status, "body": body}) }
            }
            Ok(device_api::DeviceApiResult::PermissionRequired { request }) => {
                DispatchResult::PermissionRequired { request }
            }
            Ok(device_api::DeviceApiResult::Error { error }) => {
                DispatchResult::error_detail(MethingsError::UpstreamError(error.clone()), error)
            }
            Err(e) => DispatchResult::error(e),
        }
    }

    async fn invoke_cloud_request(&self, args: Value, identity: &str) -> DispatchResult {
        let template: CloudRequestTemplate = match serde_json::from_value(args) {
            Ok(t) => t,
            Err(_) => return DispatchResult::error(MethingsError::InvalidPayload),
        };
        match self.cloud_request.run(&template, identity).await {
            Ok(cloud_request::CloudRequestResult::Ok { http_status, body, .. }) => {
                DispatchResult::Ok { value: serde_json::json!({"http_status": http_status, "body": body}) }
            }
            Ok(cloud_request::CloudRequestResult::PermissionRequired { request, .. }) => {
                let grant: Grant = serde_json::from_value(request).unwrap_or(Grant {
                    id: String::new(),
                    tool: "cloud_request".to_string(),
                    detail: String::new(),
                    scope: "once".to_string(),
                    status: "pending".to_string(),
                    created_at: 0,
                    expires_at: None,
                });
                DispatchResult::PermissionRequired { request: grant }
            }
            Ok(cloud_request::CloudRequestResult::Error { error, detail, .. }) => {
                DispatchResult::error_detail(MethingsError::UpstreamError(error.clone()), detail.unwrap_or(error))
            }
            Err(e) => DispatchResult::error(e),
        }
    }

    /// Generic permission-gated path for `filesystem`/`shell` (spec §4.D): if
    /// `permission_id` is missing, create a pending grant and return
    /// `permission_required`; if present, validate and execute, consuming `once`
    /// grants after success.
    async fn invoke_gated(
        &self,
        name: &str,
        args: Value,
        permission_id: Option<&str>,
        detail: &str,
    ) -> DispatchResult {
        let Some(permission_id) = permission_id else {
            match self.broker.request(name, detail, Scope::Once, None) {
                Ok(grant) => return DispatchResult::PermissionRequired { request: grant },
                Err(e) => return DispatchResult::error(e),
            }
        };

        let grant = match self.broker.validate(permission_id, name) {
            Ok(g) => g,
            Err(MethingsError::PermissionExpired) => {
                let grant = self.broker.get(permission_id).ok().flatten().unwrap_or(Grant {
                    id: permission_id.to_string(),
                    tool: name.to_string(),
                    detail: detail.to_string(),
                    scope: "once".to_string(),
                    status: "expired".to_string(),
                    created_at: 0,
                    expires_at: None,
                });
                return DispatchResult::PermissionExpired { request: grant };
            }
            Err(e) => return DispatchResult::error(e),
        };

        let outcome = match name {
            "filesystem" => self.run_filesystem(args).await,
            "shell" => self.run_shell(args).await,
            _ => unreachable!(),
        };

        if outcome.is_ok() {
            let _ = self.broker.consume_once(&grant.id);
        }

        match outcome {
            Ok(value) => DispatchResult::Ok { value },
            Err(e) => DispatchResult::error(e),
        }
    }

    async fn run_filesystem(&self, args: Value) -> Result<Value> {
        let op = args
            .get("op")
            .and_then(|v| v.as_str())
            .ok_or(MethingsError::UnsupportedFsOp)?
            .to_string();
        let root = self.user_root.clone();
        filesystem::dispatch(&root, &op, &args)
    }

    async fn run_shell(&self, args: Value) -> Result<Value> {
        let cmd = args.get("cmd").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let raw_args = args.get("args").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let cwd = args.get("cwd").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let output = shell::exec(&self.user_root, &cmd, &raw_args, &cwd).await?;
        Ok(serde_json::to_value(output).unwrap())
    }
}
