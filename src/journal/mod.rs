//! The Session Journal: durable per-session chat history plus ephemeral session notes
//! extracted without model calls (spec §4.C).

use std::collections::VecDeque;
use std::sync::Mutex;

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::errors::Result;
use crate::storage::{ChatMessageRow, ChatSessionSummary, Storage};

/// Sanitise a session id to the allowed charset `[A-Za-z0-9_.-]`, max 80 bytes,
/// normalised to `default` when empty (spec §3). Grounded on the original
/// `sanitize_session_id` (which collapses any run of disallowed characters to `_`,
/// trims leading/trailing `._-`, and falls back to `default`).
pub fn sanitize_session_id(raw: &str) -> String {
    static DISALLOWED: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_.-]+").expect("session id regex"));

    let collapsed = DISALLOWED.replace_all(raw.trim(), "_");
    let trimmed = collapsed.trim_matches(|c| c == '.' || c == '_' || c == '-');
    let truncated: String = trimmed.chars().take(80).collect();
    if truncated.is_empty() {
        "default".to_string()
    } else {
        truncated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::System => "system",
        }
    }
}

/// `UpdateNotes` extraction patterns (spec §4.C): English and one non-Latin example.
/// Each entry is `(regex, key, max_len)`.
struct NotePattern {
    regex: Regex,
    key: &'static str,
    max_len: usize,
}

static NOTE_PATTERNS: LazyLock<Vec<NotePattern>> = LazyLock::new(|| {
    vec![
        NotePattern {
            regex: Regex::new(r"(?i)my favorite colou?r is\s+([^.!?\n]{1,60})").unwrap(),
            key: "favorite_color",
            max_len: 40,
        },
        NotePattern {
            regex: Regex::new(r"(?i)my name is\s+([^.!?\n]{1,100})").unwrap(),
            key: "name",
            max_len: 80,
        },
        // Japanese: "好きな色は紫です" → captures "紫" (strips trailing copula/particles).
        NotePattern {
            regex: Regex::new(r"好きな色は\s*([^。、.!?\n]{1,40})").unwrap(),
            key: "favorite_color",
            max_len: 40,
        },
    ]
});

fn clean_capture(raw: &str, max_len: usize) -> String {
    let trimmed = raw.trim().trim_end_matches(['。', '.', '！', '!', '?', '？']);
    let trimmed = trimmed.trim_end_matches("です").trim_end_matches("だ").trim();
    trimmed.chars().take(max_len).collect()
}

/// Extract deterministic key/value session notes from free text (spec §4.C). Returns
/// only the keys that changed relative to the notes already on file for the session.
pub fn extract_notes(text: &str, existing: &HashMap<String, String>) -> HashMap<String, String> {
    let mut changed = HashMap::new();
    for pattern in NOTE_PATTERNS.iter() {
        if let Some(caps) = pattern.regex.captures(text) {
            let value = clean_capture(&caps[1], pattern.max_len);
            if value.is_empty() {
                continue;
            }
            if existing.get(pattern.key) != Some(&value) {
                changed.insert(pattern.key.to_string(), value);
            }
        }
    }
    changed
}

const MAX_ACTIVE_SESSIONS: usize = 50;
const EVICT_ON_OVERFLOW: usize = 10;

/// In-memory ephemeral session notes, bounded to ~50 active sessions with FIFO-10
/// eviction on overflow (spec §3/§4.C). Owned exclusively by the runtime.
#[derive(Default)]
pub struct SessionNotes {
    order: VecDeque<String>,
    notes: HashMap<String, HashMap<String, String>>,
}

impl SessionNotes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> HashMap<String, String> {
        self.notes.get(session_id).cloned().unwrap_or_default()
    }

    /// Apply `changed` to a session's notes, touching it to the back of the FIFO
    /// order and evicting the oldest `EVICT_ON_OVERFLOW` sessions if the active-set
    /// cap is exceeded.
    pub fn update(&mut self, session_id: &str, changed: &HashMap<String, String>) {
        if changed.is_empty() && self.notes.contains_key(session_id) {
            return;
        }
        if !self.notes.contains_key(session_id) {
            self.order.push_back(session_id.to_string());
        }
        let entry = self.notes.entry(session_id.to_string()).or_default();
        for (k, v) in changed {
            entry.insert(k.clone(), v.clone());
        }
        while self.notes.len() > MAX_ACTIVE_SESSIONS {
            for _ in 0..EVICT_ON_OVERFLOW {
                if let Some(oldest) = self.order.pop_front() {
                    self.notes.remove(&oldest);
                } else {
                    break;
                }
            }
        }
    }
}

/// The Session Journal (spec §4.C). Writes and session-scoped reads are delegated to
/// the Storage Adapter; ephemeral notes are kept separately in `SessionNotes`, which
/// the runtime owns and passes in by reference (the journal itself is stateless
/// beyond the database handle).
#[derive(Clone)]
pub struct Journal {
    storage: Storage,
}

impl Journal {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn append(&self, session_id: &str, role: Role, text: &str, meta_json: &str) -> Result<()> {
        let sid = sanitize_session_id(session_id);
        self.storage.add_chat_message(&sid, role.as_str(), text, meta_json)?;
        Ok(())
    }

    /// `ListForSession(session_id, limit)`, ascending time order.
    pub fn list_for_session(&self, session_id: &str, limit: i64) -> Result<Vec<ChatMessageRow>> {
        let sid = sanitize_session_id(session_id);
        Ok(self.storage.list_chat_messages(&sid, limit)?)
    }

    /// `List(limit)`, default-session tail.
    pub fn list_default(&self, limit: i64) -> Result<Vec<ChatMessageRow>> {
        self.list_for_session("default", limit)
    }

    pub fn list_sessions(&self, limit: i64) -> Result<Vec<ChatSessionSummary>> {
        Ok(self.storage.list_chat_sessions(limit)?)
    }
}

/// Wraps `SessionNotes` in a mutex for shared ownership by the runtime's async task
/// and any synchronous callers (spec §5: the session-notes map is local to the
/// runtime, guarded by a single mutex).
pub struct SharedSessionNotes(Mutex<SessionNotes>);

impl Default for SharedSessionNotes {
    fn default() -> Self {
        Self(Mutex::new(SessionNotes::new()))
    }
}

impl SharedSessionNotes {
    pub fn get(&self, session_id: &str) -> HashMap<String, String> {
        self.0.lock().unwrap().get(session_id)
    }

    pub fn update(&self, session_id: &str, changed: &HashMap<String, String>) {
        self.0.lock().unwrap().update(session_id, changed);
    }
}
