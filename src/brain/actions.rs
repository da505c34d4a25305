//! Action execution, shared by the Tool-Loop and Planner protocols (spec §4.H).

use serde_json::Value;

use crate::tools::{filesystem, shell, Dispatcher};

/// One executed action result, folded into a `tool` role journal message as
/// `{action, result}` and a `brain_action` audit event by the caller.
pub struct ActionOutcome {
    pub action_type: String,
    pub result: Value,
}

/// Execute one action `{type, ...}` (spec §4.H action-execution table). `identity`
/// threads through to `device_api`/`cloud_request` calls made via `tool_invoke`.
pub async fn execute_action(
    dispatcher: &Dispatcher,
    user_root: &std::path::Path,
    action: &Value,
    identity: &str,
) -> ActionOutcome {
    let action_type = action.get("type").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let result = match action_type.as_str() {
        "shell_exec" => exec_shell_exec(user_root, action).await,
        "write_file" => exec_write_file(user_root, action),
        "filesystem" => exec_filesystem(user_root, action),
        "tool_invoke" => exec_tool_invoke(dispatcher, action, identity).await,
        "sleep" => exec_sleep(action).await,
        "denied" => {
            let error = action.get("error").and_then(|v| v.as_str()).unwrap_or("command_not_allowed");
            let detail = action.get("detail").and_then(|v| v.as_str()).unwrap_or("");
            serde_json::json!({"status": "error", "error": error, "detail": detail})
        }
        other => serde_json::json!({"status": "error", "error": "unsupported_action", "detail": other}),
    };
    ActionOutcome { action_type, result }
}

async fn exec_shell_exec(user_root: &std::path::Path, action: &Value) -> Value {
    let cmd = action.get("cmd").and_then(|v| v.as_str()).unwrap_or("");
    let args = action.get("args").and_then(|v| v.as_str()).unwrap_or("");
    let cwd = action.get("cwd").and_then(|v| v.as_str()).unwrap_or("");
    match shell::exec(user_root, cmd, args, cwd).await {
        Ok(output) => serde_json::json!({"status": "ok", "output": output}),
        Err(e) => serde_json::json!({"status": "error", "error": e.kind()}),
    }
}

fn exec_write_file(user_root: &std::path::Path, action: &Value) -> Value {
    let path = action.get("path").and_then(|v| v.as_str()).unwrap_or("");
    let content = action.get("content").and_then(|v| v.as_str()).unwrap_or("");
    match filesystem::write_file(user_root, path, content) {
        Ok(()) => serde_json::json!({"status": "ok"}),
        Err(e) => serde_json::json!({"status": "error", "error": e.kind()}),
    }
}

fn exec_filesystem(user_root: &std::path::Path, action: &Value) -> Value {
    let op = action.get("op").and_then(|v| v.as_str()).unwrap_or("");
    match filesystem::dispatch(user_root, op, action) {
        Ok(value) => serde_json::json!({"status": "ok", "result": value}),
        Err(e) => serde_json::json!({"status": "error", "error": e.kind()}),
    }
}

async fn exec_tool_invoke(dispatcher: &Dispatcher, action: &Value, identity: &str) -> Value {
    let tool = action.get("tool").and_then(|v| v.as_str()).unwrap_or("");
    let args = action.get("args").cloned().unwrap_or(Value::Object(Default::default()));
    let request_id = action.get("request_id").and_then(|v| v.as_str());
    let detail = action.get("detail").and_then(|v| v.as_str()).unwrap_or("");
    let outcome = dispatcher.invoke(tool, args, request_id, detail, identity).await;
    serde_json::to_value(outcome).unwrap_or(Value::Null)
}

async fn exec_sleep(action: &Value) -> Value {
    let seconds = action.get("seconds").and_then(|v| v.as_f64()).unwrap_or(0.0).clamp(0.0, 10.0);
    tokio::time::sleep(std::time::Duration::from_secs_f64(seconds)).await;
    serde_json::json!({"status": "ok", "slept_seconds": seconds})
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::PermissionBroker;
    use crate::storage::Storage;
    use crate::tools::cloud_request::CloudRequestTool;
    use crate::tools::device_api::DeviceApiProxy;
    use std::sync::Arc;

    fn dispatcher(root: std::path::PathBuf) -> Dispatcher {
        let storage = Storage::open_in_memory().unwrap();
        let broker = PermissionBroker::new(storage.clone());
        let device_api = Arc::new(DeviceApiProxy::new("http://127.0.0.1:8765", broker.clone()));
        let cloud_request = Arc::new(CloudRequestTool::new("http://127.0.0.1:8765"));
        Dispatcher::new(storage, broker, device_api, cloud_request, root)
    }

    #[tokio::test]
    async fn sleep_action_clamps_and_reports_seconds() {
        let action = serde_json::json!({"type": "sleep", "seconds": 0.01});
        let outcome = execute_action(
            &dispatcher(std::env::temp_dir()),
            &std::env::temp_dir(),
            &action,
            "default",
        )
        .await;
        assert_eq!(outcome.result["slept_seconds"], 0.01);
    }

    #[tokio::test]
    async fn write_file_action_writes_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let action = serde_json::json!({"type": "write_file", "path": "note.txt", "content": "hi"});
        let outcome = execute_action(&dispatcher(dir.path().to_path_buf()), dir.path(), &action, "default").await;
        assert_eq!(outcome.result["status"], "ok");
        assert_eq!(std::fs::read_to_string(dir.path().join("note.txt")).unwrap(), "hi");
    }

    #[tokio::test]
    async fn unknown_action_type_is_unsupported() {
        let action = serde_json::json!({"type": "nonsense"});
        let outcome = execute_action(
            &dispatcher(std::env::temp_dir()),
            &std::env::temp_dir(),
            &action,
            "default",
        )
        .await;
        assert_eq!(outcome.result["error"], "unsupported_action");
    }
}
