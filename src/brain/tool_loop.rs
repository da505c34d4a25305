//! The Tool-Loop Protocol (spec §4.H): the preferred chat-driving protocol for
//! provider URLs ending in `/responses`. Declares a fixed ~16-function tool schema,
//! rounds through `function_call`/`function_call_output` pairs, and terminates on a
//! plain assistant message, a gated permission request, or round exhaustion.

use serde_json::{json, Value};

use super::{config::RuntimeConfig, keywords, Actor, BrainRuntime};
use crate::errors::Result;
use crate::journal::Role;
use crate::provider::TOOL_LOOP_TIMEOUT_SECS;

const RECENT_MESSAGE_LIMIT: i64 = 30;

/// The closed tool schema the Tool-Loop Protocol registers with the model every round
/// (spec §4.H step 2). Kept as a `LazyLock<Value>` — data, not control flow.
static TOOL_SCHEMA: std::sync::LazyLock<Value> = std::sync::LazyLock::new(|| {
    json!([
        func("list_dir", "List entries in a directory under the user workspace.", json!({
            "type": "object",
            "properties": {
                "path": {"type": "string"},
                "show_hidden": {"type": "boolean"},
                "limit": {"type": "integer"}
            },
            "required": ["path"]
        })),
        func("read_file", "Read a UTF-8 text file under the user workspace.", json!({
            "type": "object",
            "properties": {"path": {"type": "string"}, "max_bytes": {"type": "integer"}},
            "required": ["path"]
        })),
        func("device_api", "Invoke a device API verb on the local device host.", json!({
            "type": "object",
            "properties": {"action": {"type": "string"}, "payload": {"type": "object"}},
            "required": ["action"]
        })),
        func("memory_get", "Fetch this device's persistent memory notes.", json!({
            "type": "object",
            "properties": {}
        })),
        func("memory_set", "Persist a note to long-term memory. Only usable when the \
            user explicitly asked to save/store/persist it.", json!({
            "type": "object",
            "properties": {"note": {"type": "string"}},
            "required": ["note"]
        })),
        func("run_python", "Run the python interpreter with the given argv string.", json!({
            "type": "object",
            "properties": {"args": {"type": "string"}, "cwd": {"type": "string"}},
            "required": ["args"]
        })),
        func("run_pip", "Run pip with the given argv string.", json!({
            "type": "object",
            "properties": {"args": {"type": "string"}, "cwd": {"type": "string"}},
            "required": ["args"]
        })),
        func("run_curl", "Run the curl emulator with the given argv string.", json!({
            "type": "object",
            "properties": {"args": {"type": "string"}},
            "required": ["args"]
        })),
        func("web_search", "Search the web for a query via the device host's web.search verb.", json!({
            "type": "object",
            "properties": {"query": {"type": "string"}},
            "required": ["query"]
        })),
        func("write_file", "Write a text file under the user workspace, creating parent directories.", json!({
            "type": "object",
            "properties": {"path": {"type": "string"}, "content": {"type": "string"}},
            "required": ["path", "content"]
        })),
        func("mkdir", "Create a directory under the user workspace.", json!({
            "type": "object",
            "properties": {"path": {"type": "string"}, "parents": {"type": "boolean"}},
            "required": ["path"]
        })),
        func("move_path", "Move or rename a file or directory under the user workspace.", json!({
            "type": "object",
            "properties": {"src": {"type": "string"}, "dst": {"type": "string"}, "overwrite": {"type": "boolean"}},
            "required": ["src", "dst"]
        })),
        func("delete_path", "Delete a file or directory under the user workspace.", json!({
            "type": "object",
            "properties": {"path": {"type": "string"}, "recursive": {"type": "boolean"}},
            "required": ["path"]
        })),
        func("sleep", "Pause for up to 10 seconds.", json!({
            "type": "object",
            "properties": {"seconds": {"type": "number"}},
            "required": ["seconds"]
        })),
    ])
});

fn func(name: &str, description: &str, parameters: Value) -> Value {
    json!({"type": "function", "name": name, "description": description, "parameters": parameters})
}

/// Translate one `{name, arguments}` function call into the `{type, ...}` action
/// shape `brain::actions::execute_action` understands (spec §4.H action-execution
/// table), reusing the same executor the Planner Protocol drives.
fn translate_call(name: &str, args: &Value, original_text: &str) -> Value {
    match name {
        "list_dir" => json!({"type": "filesystem", "op": "list_dir", "path": args.get("path"),
            "show_hidden": args.get("show_hidden"), "limit": args.get("limit")}),
        "read_file" => json!({"type": "filesystem", "op": "read_file", "path": args.get("path"),
            "max_bytes": args.get("max_bytes")}),
        "mkdir" => json!({"type": "filesystem", "op": "mkdir", "path": args.get("path"),
            "parents": args.get("parents")}),
        "move_path" => json!({"type": "filesystem", "op": "move_path", "src": args.get("src"),
            "dst": args.get("dst"), "overwrite": args.get("overwrite")}),
        "delete_path" => json!({"type": "filesystem", "op": "delete_path", "path": args.get("path"),
            "recursive": args.get("recursive")}),
        "write_file" => json!({"type": "write_file", "path": args.get("path"), "content": args.get("content")}),
        "run_python" => json!({"type": "shell_exec", "cmd": "python", "args": args.get("args"), "cwd": args.get("cwd")}),
        "run_pip" => json!({"type": "shell_exec", "cmd": "pip", "args": args.get("args"), "cwd": args.get("cwd")}),
        "run_curl" => json!({"type": "shell_exec", "cmd": "curl", "args": args.get("args")}),
        "sleep" => json!({"type": "sleep", "seconds": args.get("seconds")}),
        "device_api" => json!({"type": "tool_invoke", "tool": "device_api",
            "args": {"action": args.get("action"), "payload": args.get("payload").cloned().unwrap_or(json!({}))},
            "detail": format!("device_api: {}", args.get("action").and_then(|v| v.as_str()).unwrap_or(""))}),
        "web_search" => json!({"type": "tool_invoke", "tool": "device_api",
            "args": {"action": "web.search", "payload": {"query": args.get("query")}},
            "detail": "web search"}),
        "memory_get" => json!({"type": "tool_invoke", "tool": "device_api",
            "args": {"action": "brain.memory.get", "payload": {}}, "detail": "fetch persistent memory"}),
        "memory_set" => {
            if !keywords::is_explicit_save_request(original_text) {
                json!({"type": "denied", "error": "command_not_allowed", "detail": "explicit user opt-in required"})
            } else {
                json!({"type": "tool_invoke", "tool": "device_api",
                    "args": {"action": "brain.memory.set", "payload": {"note": args.get("note")}},
                    "detail": "persist note to memory"})
            }
        }
        _ => json!({"type": "unknown_tool"}),
    }
}

struct RoundOutput {
    response_id: Option<String>,
    assistant_text: Vec<String>,
    calls: Vec<(String, String, Value)>, // (call_id, name, arguments)
}

fn parse_round(response: &Value) -> RoundOutput {
    let id = response.get("id").and_then(|v| v.as_str()).map(str::to_string);
    let mut assistant_text = Vec::new();
    let mut calls = Vec::new();
    if let Some(items) = response.get("output").and_then(|v| v.as_array()) {
        for item in items {
            match item.get("type").and_then(|v| v.as_str()) {
                Some("message") => {
                    if let Some(content) = item.get("content").and_then(|v| v.as_array()) {
                        for part in content {
                            if let Some(text) = part.get("text").and_then(|v| v.as_str()) {
                                assistant_text.push(text.to_string());
                            }
                        }
                    }
                }
                Some("function_call") => {
                    let call_id = item
                        .get("call_id")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    let name = item.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let arguments = item
                        .get("arguments")
                        .and_then(|v| v.as_str())
                        .and_then(|s| serde_json::from_str::<Value>(s).ok())
                        .unwrap_or(Value::Object(Default::default()));
                    calls.push((call_id, name, arguments));
                }
                _ => {}
            }
        }
    }
    RoundOutput { response_id: id, assistant_text, calls }
}

fn tagged(actor: Actor, text: &str) -> String {
    if matches!(actor, Actor::Human | Actor::Agent) {
        text.to_string()
    } else {
        format!("[{}] {}", actor.as_str().to_uppercase(), text)
    }
}

fn is_blocking_error(error: &str) -> bool {
    matches!(error, "command_not_allowed" | "path_not_allowed" | "invalid_path")
}

/// Run the Tool-Loop Protocol for one chat item.
pub(super) async fn run(
    runtime: &BrainRuntime,
    session_id: &str,
    identity: &str,
    text: &str,
    actor: Actor,
    config: &RuntimeConfig,
    api_key: Option<&str>,
) -> Result<()> {
    let memory = fetch_persistent_memory(runtime, identity).await;
    let notes = runtime.notes.get(session_id);

    let mut input = vec![json!({
        "role": "user",
        "content": format!(
            "Session notes (ephemeral): {}\nPersistent memory:\n{}",
            serde_json::to_string(&notes).unwrap_or_default(),
            memory
        )
    })];

    let recent = runtime.journal.list_for_session(session_id, RECENT_MESSAGE_LIMIT)?;
    for row in &recent {
        let role = if row.role == "assistant" { "assistant" } else { "user" };
        let row_actor = serde_json::from_str::<Value>(&row.meta)
            .ok()
            .map(|m| Actor::from_meta(&m))
            .unwrap_or(Actor::Human);
        input.push(json!({"role": role, "content": tagged(row_actor, &row.text)}));
    }
    input.push(json!({"role": "user", "content": tagged(actor, text)}));

    let mut previous_response_id: Option<String> = None;
    let mut forced_nudge = false;
    let mut last_results: Vec<(String, String)> = Vec::new();

    for _round in 0..config.max_tool_rounds {
        let mut body = json!({
            "model": config.model,
            "tools": TOOL_SCHEMA.clone(),
            "input": input,
            "instructions": config.system_prompt,
        });
        if let Some(prev) = &previous_response_id {
            body["previous_response_id"] = json!(prev);
        }

        let response = runtime
            .model_client
            .call_with_retry(
                &config.provider_url,
                api_key,
                &body,
                std::time::Duration::from_secs(TOOL_LOOP_TIMEOUT_SECS),
            )
            .await?;

        let round = parse_round(&response);
        previous_response_id = round.response_id.or(previous_response_id);

        if round.calls.is_empty() {
            if config.tool_policy == super::config::ToolPolicy::Required
                && keywords::needs_tools(text)
                && !forced_nudge
            {
                forced_nudge = true;
                input.push(json!({
                    "role": "user",
                    "content": "Please use the available tools to carry out this request before answering."
                }));
                continue;
            }

            let final_text = round.assistant_text.join("\n");
            if !final_text.is_empty() {
                runtime.journal.append(session_id, Role::Assistant, &final_text, "{}")?;
            }
            runtime.storage.add_audit(
                "brain_response",
                &json!({"session_id": session_id, "source": "tool_loop"}).to_string(),
            )?;
            return Ok(());
        }

        for text_item in &round.assistant_text {
            runtime.journal.append(session_id, Role::Assistant, text_item, "{}")?;
        }

        for (call_id, name, arguments) in round.calls.iter().take(config.max_actions as usize) {
            let action = translate_call(name, arguments, text);
            let outcome = super::actions::execute_action(&runtime.dispatcher, &runtime.user_root, &action, identity).await;

            runtime.journal.append(
                session_id,
                Role::Tool,
                &json!({"action": name, "result": outcome.result}).to_string(),
                "{}",
            )?;
            runtime.storage.add_audit(
                "brain_action",
                &json!({"session_id": session_id, "action": name, "result": outcome.result}).to_string(),
            )?;

            let status = outcome.result.get("status").and_then(|v| v.as_str()).unwrap_or("ok");
            last_results.push((name.clone(), status.to_string()));
            if last_results.len() > 6 {
                last_results.remove(0);
            }

            if status == "permission_required" || status == "permission_expired" {
                let capability = outcome
                    .result
                    .get("request")
                    .and_then(|r| r.get("tool"))
                    .and_then(|v| v.as_str())
                    .unwrap_or(name);
                let message = format!("Permission required for '{capability}'.");
                runtime.journal.append(session_id, Role::Assistant, &message, "{}")?;
                runtime.storage.add_audit(
                    "brain_response",
                    &json!({"session_id": session_id, "payload": "permission_required"}).to_string(),
                )?;
                return Ok(());
            }

            if status == "error" {
                if let Some(error) = outcome.result.get("error").and_then(|v| v.as_str()) {
                    if is_blocking_error(error) {
                        let message = format!("Blocked: {error}.");
                        runtime.journal.append(session_id, Role::Assistant, &message, "{}")?;
                        return Ok(());
                    }
                }
            }

            input.push(json!({
                "type": "function_call_output",
                "call_id": call_id,
                "output": outcome.result.to_string(),
            }));
        }

        input.push(json!({
            "role": "user",
            "content": "Continue the checklist, or finish with a plain answer if done."
        }));
    }

    let summary = last_results
        .iter()
        .map(|(name, status)| format!("{name}={status}"))
        .collect::<Vec<_>>()
        .join(", ");
    let message = format!(
        "Agent tool loop did not finish within the allowed rounds. Last tools: {summary}"
    );
    runtime.journal.append(session_id, Role::Assistant, &message, "{}")?;
    runtime.storage.add_audit(
        "brain_response",
        &json!({"session_id": session_id, "source": "tool_loop_exhausted"}).to_string(),
    )?;
    Ok(())
}

async fn fetch_persistent_memory(runtime: &BrainRuntime, identity: &str) -> String {
    match runtime.dispatcher.invoke(
        "device_api",
        json!({"action": "brain.memory.get", "payload": {}}),
        None,
        "fetch persistent memory",
        identity,
    ).await {
        crate::tools::DispatchResult::Ok { value } => value
            .get("body")
            .map(|v| v.to_string())
            .unwrap_or_default(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_list_dir_maps_to_filesystem_op() {
        let action = translate_call("list_dir", &json!({"path": "notes"}), "list files");
        assert_eq!(action["type"], "filesystem");
        assert_eq!(action["op"], "list_dir");
    }

    #[test]
    fn translate_memory_set_without_opt_in_is_denied() {
        let action = translate_call("memory_set", &json!({"note": "x"}), "hello there");
        assert_eq!(action["type"], "denied");
        assert_eq!(action["error"], "command_not_allowed");
    }

    #[test]
    fn translate_memory_set_with_opt_in_invokes_device_api() {
        let action = translate_call("memory_set", &json!({"note": "x"}), "please save this permanently");
        assert_eq!(action["type"], "tool_invoke");
        assert_eq!(action["args"]["action"], "brain.memory.set");
    }

    #[test]
    fn parse_round_extracts_text_and_calls() {
        let response = json!({
            "id": "resp_1",
            "output": [
                {"type": "message", "content": [{"type": "output_text", "text": "Checking now."}]},
                {"type": "function_call", "call_id": "call_1", "name": "list_dir", "arguments": "{\"path\":\".\"}"},
            ]
        });
        let round = parse_round(&response);
        assert_eq!(round.response_id.as_deref(), Some("resp_1"));
        assert_eq!(round.assistant_text, vec!["Checking now.".to_string()]);
        assert_eq!(round.calls.len(), 1);
        assert_eq!(round.calls[0].1, "list_dir");
    }

    #[test]
    fn tagged_prefixes_non_human_actors() {
        assert_eq!(tagged(Actor::Human, "hi"), "hi");
        assert_eq!(tagged(Actor::Codex, "hi"), "[CODEX] hi");
    }

    #[test]
    fn blocking_errors_are_recognized() {
        assert!(is_blocking_error("path_not_allowed"));
        assert!(!is_blocking_error("upstream_error"));
    }
}
