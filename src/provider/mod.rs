//! The Remote Model Client: a thin, generic HTTP JSON wrapper the Brain Runtime uses to
//! reach whichever cloud model endpoint the operator configured (spec §4.I).
//!
//! Unlike the chat-completions abstraction in `providers/`, the Brain Runtime builds its
//! own request envelopes (Tool-Loop responses-style bodies, Planner chat-completions-style
//! bodies) and just needs `Call(url, api_key, body, timeout) -> parsed_json`. Retry-with-
//! jitter is grounded on `providers::base::LLMProvider::chat_with_retry`.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{MethingsError, Result};
use crate::storage::Storage;

/// Default call timeout for the Tool-Loop Protocol's responses-endpoint round trip.
pub const TOOL_LOOP_TIMEOUT_SECS: u64 = 40;
/// Default call timeout for the Planner Protocol's chat-completions-style round trip.
pub const PLANNER_TIMEOUT_SECS: u64 = 25;

const MAX_RETRIES: usize = 2;
const INITIAL_DELAY_MS: u64 = 500;
const MAX_DELAY_MS: u64 = 4000;
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Known credential-name -> env-var fallback chains, checked in order when the
/// operator hasn't stored a credential row for the configured name (spec §4.I).
const ENV_FALLBACKS: &[(&str, &str)] = &[
    ("openai_api_key", "OPENAI_API_KEY"),
    ("anthropic_api_key", "ANTHROPIC_API_KEY"),
    ("kimi_api_key", "KIMI_API_KEY"),
    ("moonshot_api_key", "KIMI_API_KEY"),
];

/// Resolve an API key: a stored credential row takes precedence, then the env-var
/// fallback chain for well-known names, then an explicit override env var name.
pub fn resolve_api_key(storage: &Storage, credential_name: &str, override_env: Option<&str>) -> Option<String> {
    if let Ok(Some(row)) = storage.get_credential(credential_name) {
        if !row.value.is_empty() {
            return Some(row.value);
        }
    }
    if let Some(env_name) = override_env {
        if let Ok(value) = std::env::var(env_name) {
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    for (name, env_name) in ENV_FALLBACKS {
        if *name == credential_name {
            if let Ok(value) = std::env::var(env_name) {
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
    }
    None
}

pub struct ModelClient {
    http: reqwest::Client,
}

impl Default for ModelClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelClient {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }

    /// `Call(url, api_key, body, timeout) -> parsed_json` (spec §4.I): a single POST,
    /// no retry. Used when the caller wants to own the retry/termination policy itself
    /// (the Tool-Loop Protocol distinguishes `permission_required` from transient
    /// failure and must not retry the former).
    pub async fn call(&self, url: &str, api_key: Option<&str>, body: &Value, timeout: Duration) -> Result<Value> {
        let mut req = self.http.post(url).timeout(timeout).json(body);
        if let Some(key) = api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        let response = req.send().await.map_err(|e| MethingsError::HttpError(e.to_string()))?;
        let status = response.status();
        let json: Value = response.json().await.unwrap_or(Value::Null);
        if status.is_client_error() || status.is_server_error() {
            return Err(MethingsError::UpstreamError(format!(
                "{}: {}",
                status.as_u16(),
                json
            )));
        }
        Ok(json)
    }

    /// `call` wrapped in exponential backoff with jitter on retryable failures (HTTP
    /// 429/5xx or transport errors). Non-retryable failures (4xx other than 429)
    /// return immediately.
    pub async fn call_with_retry(&self, url: &str, api_key: Option<&str>, body: &Value, timeout: Duration) -> Result<Value> {
        let mut last_error = None;
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                warn!("model client retry attempt {attempt}/{MAX_RETRIES}");
            }
            match self.call(url, api_key, body, timeout).await {
                Ok(value) => return Ok(value),
                Err(MethingsError::UpstreamError(msg)) if is_retryable_upstream(&msg) => {
                    last_error = Some(MethingsError::UpstreamError(msg));
                }
                Err(MethingsError::HttpError(msg)) => {
                    last_error = Some(MethingsError::HttpError(msg));
                }
                Err(e) => return Err(e),
            }
            if attempt < MAX_RETRIES {
                let base = (INITIAL_DELAY_MS as f64 * BACKOFF_MULTIPLIER.powi(attempt as i32)).min(MAX_DELAY_MS as f64);
                let jitter = base * 0.25 * fastrand::f64();
                let delay = Duration::from_millis((base + jitter) as u64);
                debug!("backing off {delay:?} before retry");
                tokio::time::sleep(delay).await;
            }
        }
        Err(last_error.unwrap_or(MethingsError::UpstreamError("all retry attempts failed".to_string())))
    }
}

fn is_retryable_upstream(msg: &str) -> bool {
    msg.starts_with("429") || msg.starts_with("500") || msg.starts_with("502") || msg.starts_with("503") || msg.starts_with("504")
}
