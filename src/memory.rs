// Session-scoped chat history behind a pluggable memory backend.
use crate::config::MemoryConfig;
use crate::schemas::StoredMessage;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rusqlite::{params, Connection};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Capability interface for conversation storage. Implementations must keep
/// message order append-only; a Turn is two messages pushed in one call.
#[async_trait]
pub trait ChatMemory: Send + Sync {
    async fn add_messages(&self, session_id: &str, messages: &[StoredMessage]) -> Result<()>;
    async fn get_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>>;
    async fn session_exists(&self, session_id: &str) -> bool;
    async fn clear_session(&self, session_id: &str) -> Result<()>;
}

fn history_key(session_id: &str) -> String {
    format!("chat_history:{session_id}")
}

fn now_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Volatile backend; suitable for development, lost on restart.
#[derive(Default)]
pub struct InMemoryChatMemory {
    storage: DashMap<String, Vec<StoredMessage>>,
}

impl InMemoryChatMemory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatMemory for InMemoryChatMemory {
    async fn add_messages(&self, session_id: &str, messages: &[StoredMessage]) -> Result<()> {
        self.storage
            .entry(history_key(session_id))
            .or_default()
            .extend_from_slice(messages);
        Ok(())
    }

    async fn get_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        Ok(self
            .storage
            .get(&history_key(session_id))
            .map(|entry| entry.clone())
            .unwrap_or_default())
    }

    async fn session_exists(&self, session_id: &str) -> bool {
        self.storage.contains_key(&history_key(session_id))
    }

    async fn clear_session(&self, session_id: &str) -> Result<()> {
        self.storage.remove(&history_key(session_id));
        Ok(())
    }
}

/// Durable backend on SQLite. Each append runs in one transaction that both
/// pushes the messages and refreshes the session expiry, so a partial write
/// is never visible. Expired sessions are pruned lazily.
pub struct SqliteChatMemory {
    db_path: PathBuf,
    ttl_s: i64,
}

impl SqliteChatMemory {
    pub fn new(db_path: impl Into<PathBuf>, ttl_s: i64) -> Result<Self> {
        let store = Self {
            db_path: db_path.into(),
            ttl_s,
        };
        // Connectivity check at construction time; a failure here makes the
        // factory fall back to the volatile backend.
        let conn = store.open()?;
        Self::ensure_tables(&conn)?;
        Ok(store)
    }

    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create memory db dir {}", parent.display()))?;
        }
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Ok(conn)
    }

    fn ensure_tables(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chat_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                history_key TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_chat_history_key ON chat_history(history_key);
            CREATE TABLE IF NOT EXISTS chat_history_expiry (
                history_key TEXT PRIMARY KEY,
                expires_at REAL NOT NULL
            );",
        )?;
        Ok(())
    }

    fn prune_if_expired(conn: &Connection, key: &str) -> Result<()> {
        let expires_at: Option<f64> = conn
            .query_row(
                "SELECT expires_at FROM chat_history_expiry WHERE history_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .ok();
        if let Some(expires_at) = expires_at {
            if expires_at <= now_ts() {
                conn.execute(
                    "DELETE FROM chat_history WHERE history_key = ?1",
                    params![key],
                )?;
                conn.execute(
                    "DELETE FROM chat_history_expiry WHERE history_key = ?1",
                    params![key],
                )?;
            }
        }
        Ok(())
    }

    fn blocking_add(&self, key: &str, messages: &[StoredMessage]) -> Result<()> {
        let mut conn = self.open()?;
        Self::ensure_tables(&conn)?;
        Self::prune_if_expired(&conn, key)?;
        let now = now_ts();
        let expires_at = now + self.ttl_s as f64;
        let tx = conn.transaction()?;
        for message in messages {
            let payload = serde_json::to_string(message)?;
            tx.execute(
                "INSERT INTO chat_history (history_key, payload, created_at) VALUES (?1, ?2, ?3)",
                params![key, payload, now],
            )?;
        }
        tx.execute(
            "INSERT INTO chat_history_expiry (history_key, expires_at) VALUES (?1, ?2)
             ON CONFLICT(history_key) DO UPDATE SET expires_at = excluded.expires_at",
            params![key, expires_at],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn blocking_get(&self, key: &str) -> Result<Vec<StoredMessage>> {
        let conn = self.open()?;
        Self::ensure_tables(&conn)?;
        Self::prune_if_expired(&conn, key)?;
        let mut statement = conn.prepare(
            "SELECT payload FROM chat_history WHERE history_key = ?1 ORDER BY id ASC",
        )?;
        let rows = statement.query_map(params![key], |row| row.get::<_, String>(0))?;
        let mut messages = Vec::new();
        for row in rows {
            let raw = match row {
                Ok(raw) => raw,
                Err(err) => {
                    warn!("chat history row read failed, skipping: {err}");
                    continue;
                }
            };
            // A corrupt record is dropped, never fatal for the whole read.
            match serde_json::from_str::<StoredMessage>(&raw) {
                Ok(message) if message.role == "user" || message.role == "assistant" => {
                    messages.push(message);
                }
                Ok(message) => {
                    warn!("unknown message role '{}', skipping", message.role);
                }
                Err(err) => {
                    warn!("chat history payload parse failed, skipping: {err}");
                }
            }
        }
        Ok(messages)
    }

    fn blocking_exists(&self, key: &str) -> Result<bool> {
        let conn = self.open()?;
        Self::ensure_tables(&conn)?;
        let expires_at: Option<f64> = conn
            .query_row(
                "SELECT expires_at FROM chat_history_expiry WHERE history_key = ?1",
                params![key],
                |row| row.get(0),
            )
            .ok();
        Ok(matches!(expires_at, Some(value) if value > now_ts()))
    }

    fn blocking_clear(&self, key: &str) -> Result<()> {
        let conn = self.open()?;
        Self::ensure_tables(&conn)?;
        conn.execute(
            "DELETE FROM chat_history WHERE history_key = ?1",
            params![key],
        )?;
        conn.execute(
            "DELETE FROM chat_history_expiry WHERE history_key = ?1",
            params![key],
        )?;
        Ok(())
    }

    fn clone_handle(&self) -> Self {
        Self {
            db_path: self.db_path.clone(),
            ttl_s: self.ttl_s,
        }
    }
}

#[async_trait]
impl ChatMemory for SqliteChatMemory {
    async fn add_messages(&self, session_id: &str, messages: &[StoredMessage]) -> Result<()> {
        let store = self.clone_handle();
        let key = history_key(session_id);
        let messages = messages.to_vec();
        tokio::task::spawn_blocking(move || store.blocking_add(&key, &messages))
            .await
            .context("memory add task join failed")?
    }

    async fn get_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        let store = self.clone_handle();
        let key = history_key(session_id);
        tokio::task::spawn_blocking(move || store.blocking_get(&key))
            .await
            .context("memory get task join failed")?
    }

    async fn session_exists(&self, session_id: &str) -> bool {
        let store = self.clone_handle();
        let key = history_key(session_id);
        tokio::task::spawn_blocking(move || store.blocking_exists(&key))
            .await
            .unwrap_or_else(|err| {
                warn!("memory exists task join failed: {err}");
                Ok(false)
            })
            .unwrap_or(false)
    }

    async fn clear_session(&self, session_id: &str) -> Result<()> {
        let store = self.clone_handle();
        let key = history_key(session_id);
        tokio::task::spawn_blocking(move || store.blocking_clear(&key))
            .await
            .context("memory clear task join failed")?
    }
}

/// Selects the memory backend from configuration. A durable backend that
/// fails to come up degrades to the volatile one instead of aborting startup.
pub fn build_memory_backend(config: &MemoryConfig) -> Arc<dyn ChatMemory> {
    match config.backend.trim().to_lowercase().as_str() {
        "sqlite" | "default" | "" => {
            match SqliteChatMemory::new(config.db_path.clone(), config.ttl_s) {
                Ok(store) => Arc::new(store),
                Err(err) => {
                    warn!("durable memory backend unavailable, falling back to in-memory: {err}");
                    Arc::new(InMemoryChatMemory::new())
                }
            }
        }
        "in-memory" | "memory" => Arc::new(InMemoryChatMemory::new()),
        other => {
            warn!("unknown memory backend '{other}', using in-memory");
            Arc::new(InMemoryChatMemory::new())
        }
    }
}
