//! The Brain Runtime (spec §4.H): a background loop that consumes the inbox, builds
//! per-session conversational context, drives the tool-calling protocol against the
//! configured model endpoint, dispatches tool calls through the Tool Dispatcher, and
//! feeds results back until a terminal assistant answer is produced.

pub mod actions;
pub mod config;
pub mod inbox;
pub mod keywords;
mod planner;
mod tool_loop;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::errors::Result;
use crate::journal::{Journal, Role, SharedSessionNotes};
use crate::permissions::PermissionBroker;
use crate::storage::Storage;
use crate::tools::Dispatcher;

pub use config::{FsScope, RuntimeConfig, ToolPolicy};
pub use inbox::{extract_legacy_text, Inbox, InboxItem};

/// Actor tag carried on chat-message metadata (spec §3). Anything other than
/// `human`/`agent` is rendered as a `[TAG]` prefix in the model's recent-dialogue
/// window (spec §4.H step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Human,
    Agent,
    Tool,
    Codex,
    System,
}

impl Actor {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Agent => "agent",
            Self::Tool => "tool",
            Self::Codex => "codex",
            Self::System => "system",
        }
    }

    fn from_meta(meta: &Value) -> Self {
        match meta.get("actor").and_then(|v| v.as_str()) {
            Some("agent") => Self::Agent,
            Some("tool") => Self::Tool,
            Some("codex") => Self::Codex,
            Some("system") => Self::System,
            _ => Self::Human,
        }
    }
}

/// `GET /brain/status` payload shape (spec §6), returned from [`BrainRuntime::status`].
#[derive(Debug, Clone, Serialize)]
pub struct BrainStatus {
    pub running: bool,
    pub enabled: bool,
    pub busy: bool,
    pub queue_size: usize,
    pub last_error: Option<String>,
    pub last_processed_at: Option<i64>,
    pub model: String,
    pub provider_url: String,
}

/// Resolve the session identity override (spec §6 env vars): `METHINGS_IDENTITY`
/// takes precedence over `METHINGS_SESSION_ID`; falls back to `default`.
pub fn resolve_identity() -> String {
    std::env::var("METHINGS_IDENTITY")
        .or_else(|_| std::env::var("METHINGS_SESSION_ID"))
        .unwrap_or_else(|_| "default".to_string())
}

struct RuntimeState {
    busy: AtomicBool,
    running: AtomicBool,
    last_error: std::sync::Mutex<Option<String>>,
    last_processed_at: AtomicI64,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            busy: AtomicBool::new(false),
            running: AtomicBool::new(false),
            last_error: std::sync::Mutex::new(None),
            last_processed_at: AtomicI64::new(0),
        }
    }
}

/// The Brain Runtime (spec §4.H/§9). Exactly one instance is expected per process;
/// owned by whichever HTTP/service root constructs it rather than a package-level
/// singleton (spec §9 design note).
pub struct BrainRuntime {
    storage: Storage,
    journal: Journal,
    dispatcher: Arc<Dispatcher>,
    broker: PermissionBroker,
    model_client: crate::provider::ModelClient,
    inbox: Arc<Inbox>,
    notes: Arc<SharedSessionNotes>,
    user_root: PathBuf,
    state: Arc<RuntimeState>,
    worker: AsyncMutex<Option<JoinHandle<()>>>,
}

impl BrainRuntime {
    pub fn new(
        storage: Storage,
        journal: Journal,
        dispatcher: Arc<Dispatcher>,
        broker: PermissionBroker,
        user_root: PathBuf,
    ) -> Self {
        Self {
            storage,
            journal,
            dispatcher,
            broker,
            model_client: crate::provider::ModelClient::new(),
            inbox: Arc::new(Inbox::new()),
            notes: Arc::new(SharedSessionNotes::default()),
            user_root,
            state: Arc::new(RuntimeState::default()),
            worker: AsyncMutex::new(None),
        }
    }

    fn config(&self) -> RuntimeConfig {
        RuntimeConfig::load(&self.storage).unwrap_or_default()
    }

    pub async fn status(&self) -> BrainStatus {
        let config = self.config();
        BrainStatus {
            running: self.state.running.load(Ordering::SeqCst),
            enabled: config.enabled,
            busy: self.state.busy.load(Ordering::SeqCst),
            queue_size: self.inbox.len().await,
            last_error: self.state.last_error.lock().unwrap().clone(),
            last_processed_at: {
                let v = self.state.last_processed_at.load(Ordering::SeqCst);
                (v > 0).then_some(v)
            },
            model: config.model,
            provider_url: config.provider_url,
        }
    }

    pub async fn queue_size(&self) -> usize {
        self.inbox.len().await
    }

    pub async fn enqueue_chat(&self, text: String, meta: Value) -> InboxItem {
        self.inbox
            .enqueue_chat(text, meta, crate::storage::now_ms())
            .await
    }

    pub async fn enqueue_event(&self, name: String, payload: Value) -> InboxItem {
        self.inbox
            .enqueue_event(name, payload, crate::storage::now_ms())
            .await
    }

    /// `MaybeAutostart` (spec §4.H): starts the worker iff `config.auto_start`.
    pub fn maybe_autostart(self: &Arc<Self>) {
        if self.config().auto_start {
            self.start();
        }
    }

    /// Starts the single dedicated worker task if not already running (spec §5:
    /// exactly one worker owns the inbox; no cross-item parallelism).
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut guard = this.worker.lock().await;
            if guard.is_some() {
                return;
            }
            this.state.running.store(true, Ordering::SeqCst);
            let worker_self = Arc::clone(&this);
            *guard = Some(tokio::spawn(async move { worker_self.run_loop().await }));
        });
    }

    /// Signals the worker to stop and joins with a 2-second grace (spec §5).
    pub async fn stop(&self) {
        self.state.running.store(false, Ordering::SeqCst);
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
                warn!("brain worker did not stop within the 2s grace period");
            }
        }
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            if !self.state.running.load(Ordering::SeqCst) {
                return;
            }
            let config = self.config();
            if !config.enabled {
                tokio::time::sleep(Duration::from_millis(config.idle_sleep_ms)).await;
                continue;
            }
            let Some(item) = self.inbox.pop().await else {
                self.inbox
                    .wait_for_item(Duration::from_millis(config.idle_sleep_ms))
                    .await;
                continue;
            };

            self.state.busy.store(true, Ordering::SeqCst);
            *self.state.last_error.lock().unwrap() = None;

            if let Err(e) = self.process_item(&item, &config).await {
                let message = sanitize_error(&e.to_string());
                error!("brain item {} failed: {message}", item.id());
                *self.state.last_error.lock().unwrap() = Some(message.clone());
                let session_id = session_id_for(&item);
                let _ = self.journal.append(
                    &session_id,
                    Role::Assistant,
                    &format!("Error: {message}"),
                    "{}",
                );
                let _ = self.storage.add_audit(
                    "brain_item_failed",
                    &serde_json::json!({"item_id": item.id(), "error": message}).to_string(),
                );
            }

            self.state.busy.store(false, Ordering::SeqCst);
            self.state
                .last_processed_at
                .store(crate::storage::now_ms(), Ordering::SeqCst);
        }
    }

    async fn process_item(&self, item: &InboxItem, config: &RuntimeConfig) -> Result<()> {
        match item {
            InboxItem::Chat { text, meta, .. } => self.process_chat(text, meta, config).await,
            InboxItem::Event { name, payload, .. } => self.process_event(name, payload, config).await,
        }
    }

    async fn process_event(&self, name: &str, payload: &Value, _config: &RuntimeConfig) -> Result<()> {
        let identity = resolve_identity();
        self.storage.add_audit(
            "brain_event",
            &serde_json::json!({"name": name, "payload": payload, "identity": identity}).to_string(),
        )?;
        Ok(())
    }

    /// The chat processing pipeline (spec §4.H).
    async fn process_chat(&self, text: &str, meta: &Value, config: &RuntimeConfig) -> Result<()> {
        // Legacy `{messages: [...]}` payloads resolve to the last user message at
        // enqueue time (see `inbox::extract_legacy_text`); by the time an item reaches
        // here `text` is always the literal user text.
        let session_id = meta
            .get("session_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(resolve_identity);
        let identity = session_id.clone();
        let actor = Actor::from_meta(meta);

        // Step 1: append the user message, tagging actor and propagating debug tags.
        self.journal.append(&session_id, Role::User, text, &meta.to_string())?;

        // Step 2: ephemeral note extraction; may short-circuit the model entirely.
        let existing_notes = self.notes.get(&session_id);
        let changed = crate::journal::extract_notes(text, &existing_notes);
        if !changed.is_empty() {
            self.notes.update(&session_id, &changed);
        }
        let forced_no_tools = keywords::is_no_tools_override(text);
        let needs_tools = !forced_no_tools && keywords::needs_tools(text);

        if let Some(answer) = local_note_answer(text, &changed, &self.notes.get(&session_id)) {
            if !needs_tools {
                self.journal.append(&session_id, Role::Assistant, &answer, "{}")?;
                self.storage.add_audit(
                    "brain_response",
                    &serde_json::json!({"session_id": session_id, "source": "notes"}).to_string(),
                )?;
                return Ok(());
            }
        }

        // Step 3: dispatch to one of the two model protocols.
        let api_key = crate::provider::resolve_api_key(
            &self.storage,
            &config.api_key_credential,
            config.api_key_env.as_deref(),
        );

        if config.uses_tool_loop_protocol() {
            tool_loop::run(self, &session_id, &identity, text, actor, config, api_key.as_deref()).await
        } else {
            planner::run(self, &session_id, &identity, text, actor, config, api_key.as_deref()).await
        }
    }

    fn storage(&self) -> &Storage {
        &self.storage
    }

    fn journal(&self) -> &Journal {
        &self.journal
    }

    fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn broker(&self) -> &PermissionBroker {
        &self.broker
    }

    fn model_client(&self) -> &crate::provider::ModelClient {
        &self.model_client
    }

    fn user_root(&self) -> &std::path::Path {
        &self.user_root
    }
}

fn session_id_for(item: &InboxItem) -> String {
    match item {
        InboxItem::Chat { meta, .. } => meta
            .get("session_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(resolve_identity),
        InboxItem::Event { .. } => resolve_identity(),
    }
}

/// Normalise a raw error message for user display: strip obvious secrets and
/// translate the most common upstream failure into a friendlier hint (spec §4.H
/// step 3).
fn sanitize_error(raw: &str) -> String {
    if raw.contains("401") && raw.to_lowercase().contains("unauthorized") {
        return "The configured API key was rejected (401 Unauthorized). Check your \
                credentials in settings."
            .to_string();
    }
    static KEY_PATTERN: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
        regex::Regex::new(r"(sk-[A-Za-z0-9_-]{10,}|Bearer\s+[A-Za-z0-9._-]{10,})").unwrap()
    });
    KEY_PATTERN.replace_all(raw, "[redacted]").to_string()
}

/// Answer a note-triggering message without contacting the model (spec §4.H step 2,
/// scenario 3): either confirm a note just learned, or answer a direct question from
/// notes already on file.
fn local_note_answer(
    text: &str,
    changed: &std::collections::HashMap<String, String>,
    notes: &std::collections::HashMap<String, String>,
) -> Option<String> {
    let lower = text.to_lowercase();
    let is_question = lower.trim_end().ends_with('?')
        || lower.contains("what's")
        || lower.contains("what is")
        || text.contains('何');

    if !is_question {
        if let Some(color) = changed.get("favorite_color") {
            return Some(format!(
                "Got it. For this session, I'll remember your favorite color is {color}."
            ));
        }
        if let Some(name) = changed.get("name") {
            return Some(format!("Got it. I'll remember your name is {name} for this session."));
        }
    }

    if is_question && (lower.contains("favorite color") || lower.contains("favorite colour") || text.contains("好きな色")) {
        if let Some(color) = notes.get("favorite_color") {
            return Some(format!("Your favorite color (in this session) is {color}."));
        }
    }

    None
}
