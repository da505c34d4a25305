//! The Local HTTP Gateway (spec §6, component K): the loopback-only axum surface the
//! on-device control plane exposes for permissions, tool invocation, and the Brain
//! Runtime. Grounded on this crate's own webhook/chat gateway (`build_router`,
//! `Clone`-able state, handlers translating domain results into `StatusCode`+`Json`)
//! generalised from chat/webhook routing to the permission/brain/tool surface.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::Stream;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

use crate::brain::BrainRuntime;
use crate::errors::MethingsError;
use crate::journal::Journal;
use crate::permissions::{PermissionBroker, Scope};
use crate::storage::Storage;
use crate::tools::{DispatchResult, Dispatcher};

/// Shared state for every handler in this router (spec §6).
#[derive(Clone)]
pub struct GatewayState {
    pub storage: Storage,
    pub broker: PermissionBroker,
    pub dispatcher: Arc<Dispatcher>,
    pub journal: Journal,
    pub brain: Arc<BrainRuntime>,
}

impl GatewayState {
    pub fn new(
        storage: Storage,
        broker: PermissionBroker,
        dispatcher: Arc<Dispatcher>,
        journal: Journal,
        brain: Arc<BrainRuntime>,
    ) -> Self {
        Self { storage, broker, dispatcher, journal, brain }
    }

    /// Record one audit-log entry and fan it out to any connected `/logs/stream`
    /// subscribers, via `Storage::add_audit` — the single sink every audit-carrying
    /// component (gateway, Tool Dispatcher, Brain Runtime) shares (spec §6, §9),
    /// so `/audit/recent` and `/logs/stream` never disagree about what happened.
    pub fn publish(&self, event: &str, data: &Value) {
        if let Err(e) = self.storage.add_audit(event, &data.to_string()) {
            warn!("failed to write {event} audit event: {e}");
        }
    }
}

pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/permissions/request", post(request_permission))
        .route("/permissions/pending", get(list_pending_permissions))
        .route("/permissions/{id}/approve", post(approve_permission))
        .route("/permissions/{id}/deny", post(deny_permission))
        .route("/permissions/{id}", get(get_permission))
        .route("/tools/{name}/invoke", post(invoke_tool))
        .route("/logs/stream", get(stream_logs))
        .route("/audit/recent", get(recent_audit))
        .route("/brain/status", get(brain_status))
        .route("/brain/config", get(brain_get_config).post(brain_set_config))
        .route("/brain/start", post(brain_start))
        .route("/brain/stop", post(brain_stop))
        .route("/brain/inbox/chat", post(brain_inbox_chat))
        .route("/brain/inbox/event", post(brain_inbox_event))
        .route("/brain/messages", get(brain_messages))
        .route("/brain/sessions", get(brain_sessions))
        .with_state(state)
}

fn error_response(err: MethingsError) -> axum::response::Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(json!({"status": "error", "error": err.kind()}))).into_response()
}

async fn health(State(state): State<GatewayState>) -> impl IntoResponse {
    let db = state.storage.encryption_status();
    Json(json!({"status": "ok", "db": {"encrypted": db.encrypted, "mode": db.mode}}))
}

#[derive(Debug, Deserialize)]
struct PermissionRequestBody {
    tool: String,
    detail: String,
    scope: Option<Value>,
    #[allow(dead_code)]
    identity: Option<String>,
    duration_min: Option<i64>,
}

async fn request_permission(
    State(state): State<GatewayState>,
    Json(body): Json<PermissionRequestBody>,
) -> impl IntoResponse {
    let scope = body
        .scope
        .and_then(|v| serde_json::from_value::<Scope>(v).ok())
        .unwrap_or(Scope::Once);
    match state.broker.request(&body.tool, &body.detail, scope, body.duration_min) {
        Ok(grant) => {
            state.publish("permission_requested", &json!(grant));
            Json(grant).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn list_pending_permissions(State(state): State<GatewayState>) -> impl IntoResponse {
    match state.broker.list_pending() {
        Ok(pending) => Json(json!({"pending": pending})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn approve_permission(State(state): State<GatewayState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.broker.approve(&id) {
        Ok(grant) => {
            state.publish("permission_approved", &json!(grant));
            Json(grant).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn deny_permission(State(state): State<GatewayState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.broker.deny(&id) {
        Ok(grant) => {
            state.publish("permission_denied", &json!(grant));
            Json(grant).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn get_permission(State(state): State<GatewayState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.broker.get(&id) {
        Ok(Some(grant)) => Json(grant).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct InvokeToolBody {
    request_id: Option<String>,
    args: Value,
    detail: Option<String>,
    identity: Option<String>,
}

async fn invoke_tool(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
    Json(body): Json<InvokeToolBody>,
) -> impl IntoResponse {
    let identity = body.identity.unwrap_or_else(|| "default".to_string());
    let detail = body.detail.unwrap_or_default();
    let result = state
        .dispatcher
        .invoke(&name, body.args, body.request_id.as_deref(), &detail, &identity)
        .await;
    // `Dispatcher::invoke` already records + publishes `tool_invoked` via
    // `Storage::add_audit` for every registered tool (unknown-tool calls never
    // reach that audit write, so they'd otherwise go unpublished).
    if matches!(&result, DispatchResult::Error { error, .. } if error == "unknown_tool") {
        state.publish("tool_invoked", &json!({"tool": name, "result": &result}));
    }
    match &result {
        DispatchResult::PermissionRequired { .. } | DispatchResult::PermissionExpired { .. } => {
            (StatusCode::FORBIDDEN, Json(result)).into_response()
        }
        DispatchResult::Error { .. } => (StatusCode::BAD_REQUEST, Json(result)).into_response(),
        DispatchResult::Ok { .. } => Json(result).into_response(),
    }
}

/// `GET /logs/stream`: an SSE feed of audit events published by every other
/// handler in this router via `GatewayState::publish`.
async fn stream_logs(
    State(state): State<GatewayState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.storage.subscribe_audit();
    let stream = BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(value) => Some(Ok(Event::default().data(value.to_string()))),
            Err(tokio_stream::wrappers::errors::BroadcastStreamRecvError::Lagged(n)) => {
                warn!("logs/stream subscriber lagged, dropped {n} events");
                None
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<i64>,
}

async fn recent_audit(State(state): State<GatewayState>, Query(q): Query<LimitQuery>) -> impl IntoResponse {
    match state.storage.get_audit(q.limit.unwrap_or(100)) {
        Ok(events) => Json(json!({"events": events})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn brain_status(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(state.brain.status().await)
}

async fn brain_get_config(State(state): State<GatewayState>) -> impl IntoResponse {
    match crate::brain::RuntimeConfig::load(&state.storage) {
        Ok(config) => Json(config).into_response(),
        Err(e) => error_response(e),
    }
}

async fn brain_set_config(State(state): State<GatewayState>, Json(patch): Json<Value>) -> impl IntoResponse {
    let current = match crate::brain::RuntimeConfig::load(&state.storage) {
        Ok(c) => c,
        Err(e) => return error_response(e),
    };
    let merged = current.merge_patch(&patch);
    match merged.save(&state.storage) {
        Ok(()) => Json(merged).into_response(),
        Err(e) => error_response(e),
    }
}

async fn brain_start(State(state): State<GatewayState>) -> impl IntoResponse {
    state.brain.start();
    Json(json!({"status": "starting"}))
}

async fn brain_stop(State(state): State<GatewayState>) -> impl IntoResponse {
    state.brain.stop().await;
    Json(json!({"status": "stopped"}))
}

#[derive(Debug, Deserialize)]
struct ChatInboxBody {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    meta: Value,
    #[serde(default)]
    messages: Option<Value>,
}

/// `POST /brain/inbox/chat` (spec §4.H): accepts either `{text, meta}` or the legacy
/// `{messages: [{role, content}, ...]}` shape, extracting the last user message in
/// the latter case.
async fn brain_inbox_chat(State(state): State<GatewayState>, Json(body): Json<ChatInboxBody>) -> impl IntoResponse {
    let text = body.text.filter(|t| !t.trim().is_empty()).or_else(|| {
        body.messages
            .as_ref()
            .and_then(|messages| crate::brain::extract_legacy_text(&json!({"messages": messages})))
    });
    let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
        return error_response(MethingsError::MissingText);
    };
    let item = state.brain.enqueue_chat(text, body.meta).await;
    Json(item).into_response()
}

#[derive(Debug, Deserialize)]
struct EventInboxBody {
    name: String,
    #[serde(default)]
    payload: Value,
}

async fn brain_inbox_event(State(state): State<GatewayState>, Json(body): Json<EventInboxBody>) -> impl IntoResponse {
    if body.name.trim().is_empty() {
        return error_response(MethingsError::MissingName);
    }
    let item = state.brain.enqueue_event(body.name, body.payload).await;
    Json(item).into_response()
}

#[derive(Debug, Deserialize)]
struct SessionMessagesQuery {
    session_id: Option<String>,
    limit: Option<i64>,
}

async fn brain_messages(State(state): State<GatewayState>, Query(q): Query<SessionMessagesQuery>) -> impl IntoResponse {
    let session_id = q.session_id.unwrap_or_else(|| "default".to_string());
    match state.journal.list_for_session(&session_id, q.limit.unwrap_or(50)) {
        Ok(messages) => Json(json!({"messages": messages})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn brain_sessions(State(state): State<GatewayState>, Query(q): Query<LimitQuery>) -> impl IntoResponse {
    match state.journal.list_sessions(q.limit.unwrap_or(20)) {
        Ok(sessions) => Json(json!({"sessions": sessions})).into_response(),
        Err(e) => error_response(e),
    }
}
