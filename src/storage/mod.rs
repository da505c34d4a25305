//! Row-level persistence for permissions, credentials, audit, chat and settings.
//!
//! A relational store with snapshot-per-call semantics is assumed (spec §4.A); backed
//! here by `rusqlite` in WAL mode, following the same connection-pragma idiom as the
//! rest of the codebase's SQLite-backed stores.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Opaque, core-agnostic description of the storage backend's encryption state.
/// Passed through to `/health` untouched (spec §4.A).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionStatus {
    pub encrypted: bool,
    pub mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRow {
    pub id: String,
    pub tool: String,
    pub detail: String,
    pub status: String,
    pub scope: String,
    pub expires_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRow {
    pub name: String,
    pub value: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessageRow {
    pub session_id: String,
    pub role: String,
    pub text: String,
    pub meta: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSessionSummary {
    pub session_id: String,
    pub count: i64,
    pub last_created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event: String,
    pub data: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRow {
    pub name: String,
    pub code_hash: String,
    pub token: String,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCredentialRow {
    pub service_name: String,
    pub name: String,
    pub value: String,
    pub updated_at: i64,
}

pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// The Storage Adapter (spec §4.A). Cloneable: every clone re-opens the same on-disk
/// database file, so callers can freely share a `Storage` across tasks without an
/// `Arc` wrapper — the same contract as the teacher's memory-db connection pool.
///
/// `audit_tx` is the single fan-out point for every audit event this adapter
/// persists: `add_audit` both writes the row and broadcasts it, so every
/// component that calls `add_audit` — the Brain Runtime, the Tool Dispatcher, the
/// gateway — reaches `/logs/stream` subscribers through the same path (spec §6,
/// §9 "fan-out from a bounded buffer").
pub struct Storage {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    audit_tx: broadcast::Sender<Value>,
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        let conn = Connection::open(&self.db_path).unwrap_or_else(|err| {
            panic!(
                "Storage::clone: failed to reopen database at {}: {err}. Callers depend on \
                 every clone addressing the same database file.",
                self.db_path.display()
            )
        });
        configure_connection(&conn).expect("Storage::clone: failed to configure connection");
        Self {
            conn: Mutex::new(conn),
            db_path: self.db_path.clone(),
            audit_tx: self.audit_tx.clone(),
        }
    }
}

fn configure_connection(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("setting journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("setting synchronous=NORMAL")?;
    conn.pragma_update(None, "busy_timeout", 3000)
        .context("setting busy_timeout")?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .context("setting foreign_keys=ON")?;
    Ok(())
}

impl Storage {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }
        let conn = Connection::open(&db_path)
            .with_context(|| format!("opening database at {}", db_path.display()))?;
        configure_connection(&conn)?;
        let (audit_tx, _) = broadcast::channel(256);
        let storage = Self {
            conn: Mutex::new(conn),
            db_path,
            audit_tx,
        };
        storage.ensure_schema()?;
        Ok(storage)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory database")?;
        configure_connection(&conn)?;
        let (audit_tx, _) = broadcast::channel(256);
        let storage = Self {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
            audit_tx,
        };
        storage.ensure_schema()?;
        Ok(storage)
    }

    /// Subscribe to every audit event this adapter persists, for `/logs/stream`
    /// (spec §6). `broadcast`'s drop-oldest-on-lag is the only backpressure: a slow
    /// subscriber misses the oldest unread event rather than blocking writers.
    pub fn subscribe_audit(&self) -> broadcast::Receiver<Value> {
        self.audit_tx.subscribe()
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS permissions (
                id TEXT PRIMARY KEY,
                tool TEXT NOT NULL,
                detail TEXT NOT NULL,
                status TEXT NOT NULL,
                scope TEXT NOT NULL,
                expires_at INTEGER,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS credentials (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS services (
                name TEXT PRIMARY KEY,
                code_hash TEXT NOT NULL,
                token TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS service_credentials (
                service_name TEXT NOT NULL,
                name TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (service_name, name)
            );
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS chat_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL,
                text TEXT NOT NULL,
                meta TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chat_messages_session ON chat_messages(session_id, id);
            ",
        )
        .context("creating schema")?;
        Ok(())
    }

    pub fn encryption_status(&self) -> EncryptionStatus {
        EncryptionStatus {
            encrypted: false,
            mode: "sqlite".to_string(),
        }
    }

    // --- permissions ---

    pub fn create_permission(
        &self,
        id: &str,
        tool: &str,
        detail: &str,
        scope: &str,
        expires_at: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO permissions (id, tool, detail, status, scope, expires_at, created_at) \
             VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6)",
            params![id, tool, detail, scope, expires_at, now_ms()],
        )
        .context("inserting permission")?;
        Ok(())
    }

    pub fn get_permission(&self, id: &str) -> Result<Option<PermissionRow>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, tool, detail, status, scope, expires_at, created_at \
             FROM permissions WHERE id = ?1",
            params![id],
            row_to_permission,
        )
        .optional()
        .context("fetching permission")
    }

    pub fn list_pending_permissions(&self) -> Result<Vec<PermissionRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, tool, detail, status, scope, expires_at, created_at \
             FROM permissions WHERE status = 'pending' ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map([], row_to_permission)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("listing pending permissions")?;
        Ok(rows)
    }

    pub fn update_permission_status(&self, id: &str, status: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE permissions SET status = ?1 WHERE id = ?2",
            params![status, id],
        )
        .context("updating permission status")?;
        Ok(())
    }

    // --- credentials ---

    pub fn set_credential(&self, name: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO credentials (name, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![name, value, now_ms()],
        )
        .context("upserting credential")?;
        Ok(())
    }

    pub fn get_credential(&self, name: &str) -> Result<Option<CredentialRow>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT name, value, updated_at FROM credentials WHERE name = ?1",
            params![name],
            |row| {
                Ok(CredentialRow {
                    name: row.get(0)?,
                    value: row.get(1)?,
                    updated_at: row.get(2)?,
                })
            },
        )
        .optional()
        .context("fetching credential")
    }

    pub fn delete_credential(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM credentials WHERE name = ?1", params![name])
            .context("deleting credential")?;
        Ok(())
    }

    // --- audit ---

    pub fn add_audit(&self, event: &str, data: &str) -> Result<()> {
        let created_at = now_ms();
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO audit_log (event, data, created_at) VALUES (?1, ?2, ?3)",
                params![event, data, created_at],
            )
            .context("inserting audit event")?;
        }
        let data_value = serde_json::from_str(data).unwrap_or_else(|_| Value::String(data.to_string()));
        let _ = self.audit_tx.send(serde_json::json!({
            "event": event,
            "data": data_value,
            "created_at": created_at,
        }));
        Ok(())
    }

    pub fn get_audit(&self, limit: i64) -> Result<Vec<AuditEvent>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT event, data, created_at FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(AuditEvent {
                    event: row.get(0)?,
                    data: row.get(1)?,
                    created_at: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("listing audit events")?;
        Ok(rows)
    }

    // --- settings ---

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .context("fetching setting")
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now_ms()],
        )
        .context("upserting setting")?;
        Ok(())
    }

    // --- chat messages (Session Journal backing store) ---

    pub fn add_chat_message(&self, session_id: &str, role: &str, text: &str, meta: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO chat_messages (session_id, role, text, meta, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, role, text, meta, now_ms()],
        )
        .context("inserting chat message")?;
        // Bound retention: per-session top 400, global top 4000 (spec §3/§6).
        conn.execute(
            "DELETE FROM chat_messages WHERE session_id = ?1 AND id NOT IN ( \
                SELECT id FROM chat_messages WHERE session_id = ?1 ORDER BY id DESC LIMIT 400)",
            params![session_id],
        )
        .context("pruning per-session chat history")?;
        conn.execute(
            "DELETE FROM chat_messages WHERE id NOT IN ( \
                SELECT id FROM chat_messages ORDER BY id DESC LIMIT 4000)",
            [],
        )
        .context("pruning global chat history")?;
        Ok(())
    }

    pub fn list_chat_messages(&self, session_id: &str, limit: i64) -> Result<Vec<ChatMessageRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT session_id, role, text, meta, created_at FROM chat_messages \
             WHERE session_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let mut rows = stmt
            .query_map(params![session_id, limit], row_to_chat_message)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("listing chat messages")?;
        rows.reverse();
        Ok(rows)
    }

    pub fn list_chat_sessions(&self, limit: i64) -> Result<Vec<ChatSessionSummary>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT session_id, COUNT(*) AS count, MAX(created_at) AS last_created_at \
             FROM chat_messages GROUP BY session_id ORDER BY last_created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(ChatSessionSummary {
                    session_id: row.get(0)?,
                    count: row.get(1)?,
                    last_created_at: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("listing chat sessions")?;
        Ok(rows)
    }

    // --- services / service credentials (supplemented, spec §3 expansion) ---

    pub fn upsert_service(&self, name: &str, code_hash: &str, token: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = now_ms();
        conn.execute(
            "INSERT INTO services (name, code_hash, token, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?4) \
             ON CONFLICT(name) DO UPDATE SET code_hash = excluded.code_hash, token = excluded.token, \
             updated_at = excluded.updated_at",
            params![name, code_hash, token, now],
        )
        .context("upserting service")?;
        Ok(())
    }

    pub fn get_service(&self, name: &str) -> Result<Option<ServiceRow>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT name, code_hash, token, created_at, updated_at FROM services WHERE name = ?1",
            params![name],
            |row| {
                Ok(ServiceRow {
                    name: row.get(0)?,
                    code_hash: row.get(1)?,
                    token: row.get(2)?,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            },
        )
        .optional()
        .context("fetching service")
    }

    pub fn set_service_credential(&self, service_name: &str, name: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO service_credentials (service_name, name, value, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(service_name, name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![service_name, name, value, now_ms()],
        )
        .context("upserting service credential")?;
        Ok(())
    }

    pub fn get_service_credential(&self, service_name: &str, name: &str) -> Result<Option<ServiceCredentialRow>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT service_name, name, value, updated_at FROM service_credentials \
             WHERE service_name = ?1 AND name = ?2",
            params![service_name, name],
            |row| {
                Ok(ServiceCredentialRow {
                    service_name: row.get(0)?,
                    name: row.get(1)?,
                    value: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            },
        )
        .optional()
        .context("fetching service credential")
    }
}

fn row_to_permission(row: &rusqlite::Row) -> rusqlite::Result<PermissionRow> {
    Ok(PermissionRow {
        id: row.get(0)?,
        tool: row.get(1)?,
        detail: row.get(2)?,
        status: row.get(3)?,
        scope: row.get(4)?,
        expires_at: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn row_to_chat_message(row: &rusqlite::Row) -> rusqlite::Result<ChatMessageRow> {
    Ok(ChatMessageRow {
        session_id: row.get(0)?,
        role: row.get(1)?,
        text: row.get(2)?,
        meta: row.get(3)?,
        created_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_round_trip() {
        let storage = Storage::open_in_memory().unwrap();
        storage
            .create_permission("p_1", "shell", "run python", "once", None)
            .unwrap();
        let row = storage.get_permission("p_1").unwrap().unwrap();
        assert_eq!(row.status, "pending");
        storage.update_permission_status("p_1", "approved").unwrap();
        let row = storage.get_permission("p_1").unwrap().unwrap();
        assert_eq!(row.status, "approved");
    }

    #[test]
    fn chat_messages_ordered_and_bounded() {
        let storage = Storage::open_in_memory().unwrap();
        for i in 0..5 {
            storage
                .add_chat_message("s1", "user", &format!("msg {i}"), "{}")
                .unwrap();
        }
        let rows = storage.list_chat_messages("s1", 10).unwrap();
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[0].text, "msg 0");
        assert_eq!(rows[4].text, "msg 4");
    }

    #[test]
    fn settings_last_write_wins() {
        let storage = Storage::open_in_memory().unwrap();
        storage.set_setting("brain.config.v1", "a").unwrap();
        storage.set_setting("brain.config.v1", "b").unwrap();
        assert_eq!(storage.get_setting("brain.config.v1").unwrap().unwrap(), "b");
    }

    #[test]
    fn credential_round_trip_and_delete() {
        let storage = Storage::open_in_memory().unwrap();
        storage.set_credential("openai_api_key", "sk-test").unwrap();
        assert_eq!(
            storage.get_credential("openai_api_key").unwrap().unwrap().value,
            "sk-test"
        );
        storage.delete_credential("openai_api_key").unwrap();
        assert!(storage.get_credential("openai_api_key").unwrap().is_none());
    }

    #[test]
    fn clone_reopens_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("methings.db");
        let storage = Storage::open(&path).unwrap();
        storage.set_setting("k", "v").unwrap();
        let cloned = storage.clone();
        assert_eq!(cloned.get_setting("k").unwrap().unwrap(), "v");
    }

    #[test]
    fn add_audit_fans_out_to_subscribers() {
        let storage = Storage::open_in_memory().unwrap();
        let mut rx = storage.subscribe_audit();
        storage.add_audit("tool_invoked", r#"{"tool":"shell"}"#).unwrap();
        let msg = rx.try_recv().expect("add_audit should publish to subscribers");
        assert_eq!(msg["event"], "tool_invoked");
        assert_eq!(msg["data"]["tool"], "shell");
    }

    #[test]
    fn clone_shares_the_same_audit_channel() {
        let storage = Storage::open_in_memory().unwrap();
        let mut rx = storage.subscribe_audit();
        let cloned = storage.clone();
        cloned.add_audit("brain_response", "{}").unwrap();
        let msg = rx.try_recv().expect("clone should publish on the shared channel");
        assert_eq!(msg["event"], "brain_response");
    }
}
