//! The Cloud Request Tool: an outbound peer wrapper around `/cloud/request` that lets
//! the model issue an HTTP request via a template the peer expands and secures
//! (spec §4.D, §6). Grounded on the reference tool, which forwards an identity header
//! and pads its own timeout beyond the upstream one so a slow-but-progressing
//! transfer is never killed locally first.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{MethingsError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudRequestTemplate {
    pub method: Option<String>,
    pub url: String,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub json: Option<Value>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub timeout_s: Option<f64>,
    #[serde(default)]
    pub allow_insecure_http: bool,
    #[serde(default)]
    pub permission_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CloudRequestResult {
    Ok { status: String, http_status: u16, body: Value },
    PermissionRequired { status: String, request: Value },
    Error { status: String, error: String, detail: Option<String> },
}

/// `tool_timeout_s = max(60, min(300, req_timeout_s + 60))`: the local call timeout
/// must exceed the upstream request timeout, otherwise the tool can time out even
/// while the upstream transfer is making progress.
pub fn tool_timeout(req_timeout_s: f64) -> Duration {
    let padded = (req_timeout_s + 60.0).clamp(60.0, 300.0);
    Duration::from_secs_f64(padded)
}

pub struct CloudRequestTool {
    peer_base_url: String,
    http: reqwest::Client,
}

impl CloudRequestTool {
    pub fn new(peer_base_url: impl Into<String>) -> Self {
        Self {
            peer_base_url: peer_base_url.into(),
            http: reqwest::Client::new(),
        }
    }

    /// Forward a request template to the peer's `/cloud/request` endpoint, tagging
    /// the call with the caller's session identity (spec §6). On `403
    /// permission_required`, surfaces the grant immediately instead of blocking —
    /// the agent is expected to ask the user to approve and retry.
    pub async fn run(&self, template: &CloudRequestTemplate, identity: &str) -> Result<CloudRequestResult> {
        let req_timeout_s = template.timeout_s.unwrap_or(45.0);
        let timeout = tool_timeout(req_timeout_s);

        let url = format!("{}/cloud/request", self.peer_base_url);
        let response = self
            .http
            .post(&url)
            .header("X-Methings-Identity", identity)
            .header("Accept", "application/json")
            .json(template)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| MethingsError::HttpError(e.to_string()))?;

        let http_status = response.status().as_u16();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if http_status == 403 {
            if let Some(obj) = body.as_object() {
                if obj.get("status").and_then(|v| v.as_str()) == Some("permission_required") {
                    return Ok(CloudRequestResult::PermissionRequired {
                        status: "permission_required".to_string(),
                        request: obj.get("request").cloned().unwrap_or(Value::Null),
                    });
                }
            }
        }

        Ok(CloudRequestResult::Ok {
            status: "ok".to_string(),
            http_status,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_timeout_pads_and_clamps() {
        assert_eq!(tool_timeout(10.0), Duration::from_secs_f64(70.0));
        assert_eq!(tool_timeout(0.0), Duration::from_secs_f64(60.0));
        assert_eq!(tool_timeout(1000.0), Duration::from_secs_f64(300.0));
    }
}
