//! The Planner Protocol (spec §4.H): the fallback chat-driving protocol for any
//! provider URL that doesn't end in `/responses`. Asks the model for a JSON envelope
//! of `{responses, actions}` in at most three rounds, falling back to a regex
//! extraction pass and finally a deterministic keyword planner when the model
//! doesn't cooperate.

use serde_json::{json, Value};

use super::{config::RuntimeConfig, keywords, Actor, BrainRuntime};
use crate::errors::Result;
use crate::journal::Role;
use crate::provider::PLANNER_TIMEOUT_SECS;

const RECENT_MESSAGE_LIMIT: i64 = 30;
const MAX_ROUNDS: u32 = 3;

/// One parsed planner turn: zero or more lines of prose to show the user, plus zero
/// or more actions to execute before the next round.
struct PlannerTurn {
    responses: Vec<String>,
    actions: Vec<Value>,
}

fn tagged(actor: Actor, text: &str) -> String {
    if matches!(actor, Actor::Human | Actor::Agent) {
        text.to_string()
    } else {
        format!("[{}] {}", actor.as_str().to_uppercase(), text)
    }
}

/// Parse a model reply into a `PlannerTurn`: strict JSON first, then a greedy
/// `{...}` regex extraction over the raw text, in that order (spec §4.H).
fn parse_planner_reply(raw: &str) -> Option<PlannerTurn> {
    if let Ok(value) = serde_json::from_str::<Value>(raw) {
        if let Some(turn) = turn_from_value(&value) {
            return Some(turn);
        }
    }

    static BRACES: std::sync::LazyLock<regex::Regex> =
        std::sync::LazyLock::new(|| regex::Regex::new(r"\{[\s\S]*\}").unwrap());
    let candidate = BRACES.find(raw)?;
    let value: Value = serde_json::from_str(candidate.as_str()).ok()?;
    turn_from_value(&value)
}

fn turn_from_value(value: &Value) -> Option<PlannerTurn> {
    let obj = value.as_object()?;
    let responses = obj
        .get("responses")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    let actions = obj
        .get("actions")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    if responses.is_empty() && actions.is_empty() {
        return None;
    }
    Some(PlannerTurn { responses, actions })
}

fn device_status(action: &str, detail: &str) -> Value {
    json!({"type": "tool_invoke", "tool": "device_api",
        "args": {"action": action, "payload": {}}, "detail": detail})
}

/// Deterministic fallback when the model never returns a parseable envelope: the
/// same keyword policy that decides tool necessity decides the action(s) here
/// (spec §4.H, "heuristic planner"). "status ssh" schedules both `ssh.status` and
/// `python.status`, per the spec's own worked example.
fn heuristic_turn(text: &str) -> PlannerTurn {
    let lower = text.to_lowercase();
    if !keywords::needs_tools(text) {
        return PlannerTurn {
            responses: vec!["Okay.".to_string()],
            actions: vec![],
        };
    }

    let actions = if lower.contains("ssh") {
        vec![
            device_status("ssh.status", "check ssh status"),
            device_status("python.status", "check python status"),
        ]
    } else if lower.contains("python") {
        vec![device_status("python.status", "check python status")]
    } else if lower.contains("camera") {
        vec![device_status("camera.status", "check camera status")]
    } else if lower.contains("wifi") || lower.contains("wi-fi") {
        vec![device_status("wifi.status", "check wifi status")]
    } else if lower.contains("battery") {
        vec![device_status("battery.status", "check battery status")]
    } else if lower.contains("ls") || lower.contains("list") || lower.contains("dir") || lower.contains("folder") {
        vec![json!({"type": "filesystem", "op": "list_dir", "path": "."})]
    } else {
        vec![device_status("device_api", "device status check")]
    };

    PlannerTurn {
        responses: vec!["Checking now.".to_string()],
        actions,
    }
}

fn render_results(results: &[(Value, Value)]) -> Value {
    Value::Array(
        results
            .iter()
            .map(|(action, result)| json!({"action": action, "result": result}))
            .collect(),
    )
}

/// Run the Planner Protocol for one chat item.
pub(super) async fn run(
    runtime: &BrainRuntime,
    session_id: &str,
    identity: &str,
    text: &str,
    actor: Actor,
    config: &RuntimeConfig,
    api_key: Option<&str>,
) -> Result<()> {
    let recent = runtime.journal.list_for_session(session_id, RECENT_MESSAGE_LIMIT)?;
    let mut dialogue = String::new();
    for row in &recent {
        let row_actor = serde_json::from_str::<Value>(&row.meta)
            .ok()
            .map(|m| Actor::from_meta(&m))
            .unwrap_or(Actor::Human);
        dialogue.push_str(&tagged(row_actor, &row.text));
        dialogue.push('\n');
    }
    dialogue.push_str(&tagged(actor, text));

    let planner_prompt = format!(
        "Recent dialogue:\n{dialogue}\n\nRespond with a single JSON object of the shape \
         {{\"responses\": [string, ...], \"actions\": [object, ...]}}. Each action is one of \
         {{\"type\":\"filesystem\", \"op\":...}}, {{\"type\":\"shell_exec\", \"cmd\":...}}, \
         {{\"type\":\"write_file\",...}}, {{\"type\":\"tool_invoke\", \"tool\":\"device_api\", \
         \"args\":{{\"action\":...,\"payload\":...}}}}, or {{\"type\":\"sleep\",\"seconds\":n}}. \
         Return no actions if none are needed."
    );

    let mut tool_results: Vec<(Value, Value)> = Vec::new();
    let mut collected_responses: Vec<String> = Vec::new();
    let mut rounds_used = 0;

    for round in 0..MAX_ROUNDS {
        rounds_used = round + 1;
        let mut content = planner_prompt.clone();
        if !tool_results.is_empty() {
            content.push_str(&format!(
                "\n\nPrevious action results:\n{}",
                render_results(&tool_results)
            ));
        }

        let body = json!({
            "model": config.model,
            "messages": [
                {"role": "system", "content": config.system_prompt},
                {"role": "user", "content": content},
            ],
            "temperature": config.temperature,
        });

        let turn = match runtime
            .model_client
            .call_with_retry(
                &config.provider_url,
                api_key,
                &body,
                std::time::Duration::from_secs(PLANNER_TIMEOUT_SECS),
            )
            .await
        {
            Ok(response) => {
                let raw_text = response
                    .get("choices")
                    .and_then(|c| c.get(0))
                    .and_then(|c| c.get("message"))
                    .and_then(|m| m.get("content"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                parse_planner_reply(raw_text).unwrap_or_else(|| heuristic_turn(text))
            }
            Err(_) => heuristic_turn(text),
        };

        collected_responses.extend(turn.responses.clone());

        if turn.actions.is_empty() {
            break;
        }

        for action in turn.actions.iter().take(config.max_actions as usize) {
            let outcome = super::actions::execute_action(&runtime.dispatcher, &runtime.user_root, action, identity).await;
            runtime.journal.append(
                session_id,
                Role::Tool,
                &json!({"action": action, "result": outcome.result}).to_string(),
                "{}",
            )?;
            runtime.storage.add_audit(
                "brain_action",
                &json!({"session_id": session_id, "action": action, "result": outcome.result}).to_string(),
            )?;

            let status = outcome.result.get("status").and_then(|v| v.as_str()).unwrap_or("ok");
            if status == "permission_required" || status == "permission_expired" {
                let message = "Permission required before I can continue.".to_string();
                runtime.journal.append(session_id, Role::Assistant, &message, "{}")?;
                runtime.storage.add_audit(
                    "brain_response",
                    &json!({"session_id": session_id, "payload": "permission_required"}).to_string(),
                )?;
                return Ok(());
            }

            tool_results.push((action.clone(), outcome.result));
        }
    }

    let final_text = if collected_responses.is_empty() {
        "Done.".to_string()
    } else {
        collected_responses.join("\n")
    };
    runtime.journal.append(session_id, Role::Assistant, &final_text, "{}")?;
    runtime.storage.add_audit(
        "brain_response",
        &json!({"session_id": session_id, "source": "planner", "rounds": rounds_used}).to_string(),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_planner_reply_accepts_strict_json() {
        let raw = r#"{"responses":["hi"],"actions":[]}"#;
        let turn = parse_planner_reply(raw).unwrap();
        assert_eq!(turn.responses, vec!["hi".to_string()]);
        assert!(turn.actions.is_empty());
    }

    #[test]
    fn parse_planner_reply_extracts_embedded_json() {
        let raw = "Sure thing! {\"responses\":[\"ok\"],\"actions\":[{\"type\":\"sleep\",\"seconds\":1}]} Thanks.";
        let turn = parse_planner_reply(raw).unwrap();
        assert_eq!(turn.responses, vec!["ok".to_string()]);
        assert_eq!(turn.actions.len(), 1);
    }

    #[test]
    fn parse_planner_reply_rejects_unstructured_text() {
        assert!(parse_planner_reply("just a plain sentence").is_none());
    }

    #[test]
    fn heuristic_turn_skips_actions_when_tools_not_needed() {
        let turn = heuristic_turn("hello there, how are you?");
        assert!(turn.actions.is_empty());
    }

    #[test]
    fn heuristic_turn_maps_ssh_keyword_to_ssh_status() {
        let turn = heuristic_turn("what's the ssh status?");
        assert_eq!(turn.actions.len(), 2);
        assert_eq!(turn.actions[0]["args"]["action"], "ssh.status");
        assert_eq!(turn.actions[1]["args"]["action"], "python.status");
    }
}
