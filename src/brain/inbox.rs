//! Bounded FIFO inbox queue (spec §4.H). Owned exclusively by the runtime.

use std::collections::VecDeque;

use serde_json::Value;
use tokio::sync::{Mutex, Notify};

pub const INBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InboxItem {
    Chat { id: String, text: String, meta: Value, created_at: i64 },
    Event { id: String, name: String, payload: Value, created_at: i64 },
}

impl InboxItem {
    pub fn id(&self) -> &str {
        match self {
            Self::Chat { id, .. } | Self::Event { id, .. } => id,
        }
    }
}

/// Extract the last user message from a legacy `{messages: [{role, content}, ...]}`
/// payload, if the chat body was submitted in that shape instead of plain `text`.
pub fn extract_legacy_text(payload: &Value) -> Option<String> {
    let messages = payload.get("messages")?.as_array()?;
    messages
        .iter()
        .rev()
        .find(|m| m.get("role").and_then(|r| r.as_str()) == Some("user"))
        .and_then(|m| m.get("content").and_then(|c| c.as_str()))
        .map(str::to_string)
}

pub struct Inbox {
    queue: Mutex<VecDeque<InboxItem>>,
    notify: Notify,
}

impl Default for Inbox {
    fn default() -> Self {
        Self { queue: Mutex::new(VecDeque::with_capacity(INBOX_CAPACITY)), notify: Notify::new() }
    }
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enqueue_chat(&self, text: String, meta: Value, now_ms: i64) -> InboxItem {
        let item = InboxItem::Chat { id: format!("chat_{now_ms}"), text, meta, created_at: now_ms };
        self.push(item.clone()).await;
        item
    }

    pub async fn enqueue_event(&self, name: String, payload: Value, now_ms: i64) -> InboxItem {
        let item = InboxItem::Event { id: format!("event_{now_ms}"), name, payload, created_at: now_ms };
        self.push(item.clone()).await;
        item
    }

    async fn push(&self, item: InboxItem) {
        let mut queue = self.queue.lock().await;
        if queue.len() >= INBOX_CAPACITY {
            queue.pop_front();
        }
        queue.push_back(item);
        drop(queue);
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> Option<InboxItem> {
        self.queue.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn wait_for_item(&self, timeout: std::time::Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_and_pop_is_fifo() {
        let inbox = Inbox::new();
        inbox.enqueue_chat("first".to_string(), Value::Null, 1).await;
        inbox.enqueue_chat("second".to_string(), Value::Null, 2).await;
        let first = inbox.pop().await.unwrap();
        assert!(matches!(first, InboxItem::Chat { text, .. } if text == "first"));
    }

    #[test]
    fn legacy_payload_extracts_last_user_message() {
        let payload = serde_json::json!({"messages": [
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "hello"},
            {"role": "user", "content": "what's the weather"},
        ]});
        assert_eq!(extract_legacy_text(&payload).as_deref(), Some("what's the weather"));
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let inbox = Inbox::new();
        for i in 0..(INBOX_CAPACITY + 5) {
            inbox.enqueue_chat(format!("msg{i}"), Value::Null, i as i64).await;
        }
        assert_eq!(inbox.len().await, INBOX_CAPACITY);
        let first = inbox.pop().await.unwrap();
        assert!(matches!(first, InboxItem::Chat { text, .. } if text == "msg5"));
    }
}
