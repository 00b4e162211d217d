//! SQLite persistence for the messaging API: per-user conversation history and
//! a log of received messages.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use utoipa::ToSchema;

pub const DEFAULT_LIST_LIMIT: u32 = 50;
pub const MAX_LIST_LIMIT: u32 = 500;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    user_id TEXT PRIMARY KEY,
    whatsapp_id TEXT NOT NULL UNIQUE,
    conversation_history TEXT NOT NULL DEFAULT '[]',
    updated_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS received_messages (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    platform TEXT NOT NULL,
    chat_id TEXT NOT NULL,
    message TEXT NOT NULL,
    received_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_received_messages_user
    ON received_messages (user_id, received_at);
";

/// One human/AI turn in a stored conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Exchange {
    pub human: String,
    pub ai: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedMessage {
    pub id: String,
    pub user_id: String,
    pub platform: String,
    pub chat_id: String,
    pub message: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ReceivedQuery {
    pub user_id: Option<String>,
    pub platform: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Clone)]
pub struct MessageStore {
    conn: Arc<Mutex<Connection>>,
}

impl MessageStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            Connection::open(&path).with_context(|| format!("open database {}", path.display()))
        })
        .await
        .context("database open task panicked")??;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA).context("apply message store schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| anyhow!("message store connection poisoned"))?;
            f(&mut guard).map_err(anyhow::Error::from)
        })
        .await
        .context("message store task panicked")?
    }

    /// Internal user id for a WhatsApp id, created on first sight.
    pub async fn get_or_create_user(&self, whatsapp_id: &str) -> Result<String> {
        let whatsapp_id = whatsapp_id.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let existing: Option<String> = tx
                .query_row(
                    "SELECT user_id FROM messages WHERE whatsapp_id = ?1",
                    params![whatsapp_id],
                    |row| row.get(0),
                )
                .optional()?;
            let user_id = match existing {
                Some(user_id) => user_id,
                None => {
                    let user_id = uuid::Uuid::new_v4().to_string();
                    tx.execute(
                        "INSERT INTO messages (user_id, whatsapp_id, conversation_history, updated_at) \
                         VALUES (?1, ?2, '[]', ?3)",
                        params![user_id, whatsapp_id, timestamp(Utc::now())],
                    )?;
                    user_id
                }
            };
            tx.commit()?;
            Ok(user_id)
        })
        .await
    }

    pub async fn conversation_history(&self, user_id: &str) -> Result<Vec<Exchange>> {
        let user_id = user_id.to_string();
        let raw: Option<String> = self
            .call(move |conn| {
                conn.query_row(
                    "SELECT conversation_history FROM messages WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        match raw {
            Some(raw) => serde_json::from_str(&raw).context("decode conversation history"),
            None => Ok(Vec::new()),
        }
    }

    pub async fn append_exchange(&self, user_id: &str, human: &str, ai: &str) -> Result<()> {
        let user_id = user_id.to_string();
        let exchange = Exchange {
            human: human.to_string(),
            ai: ai.to_string(),
            timestamp: Utc::now(),
        };
        let updated = self
            .call(move |conn| {
                let tx = conn.transaction()?;
                let raw: Option<String> = tx
                    .query_row(
                        "SELECT conversation_history FROM messages WHERE user_id = ?1",
                        params![user_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(raw) = raw else {
                    return Ok(false);
                };
                let mut history: Vec<Exchange> = serde_json::from_str(&raw).unwrap_or_default();
                history.push(exchange);
                let encoded = serde_json::to_string(&history)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                tx.execute(
                    "UPDATE messages SET conversation_history = ?1, updated_at = ?2 WHERE user_id = ?3",
                    params![encoded, timestamp(Utc::now()), user_id],
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await?;
        if !updated {
            return Err(anyhow!("unknown user id"));
        }
        Ok(())
    }

    pub async fn record_received(&self, message: ReceivedMessage) -> Result<()> {
        self.call(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO received_messages \
                 (id, user_id, platform, chat_id, message, received_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    message.id,
                    message.user_id,
                    message.platform,
                    message.chat_id,
                    message.message,
                    timestamp(message.received_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    /// Newest first. `limit` defaults to 50 and is capped at 500.
    pub async fn list_received(&self, query: ReceivedQuery) -> Result<Vec<ReceivedMessage>> {
        let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).min(MAX_LIST_LIMIT);
        let offset = query.offset.unwrap_or(0);
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, user_id, platform, chat_id, message, received_at \
                 FROM received_messages \
                 WHERE (?1 IS NULL OR user_id = ?1) AND (?2 IS NULL OR platform = ?2) \
                 ORDER BY received_at DESC, rowid DESC \
                 LIMIT ?3 OFFSET ?4",
            )?;
            let rows = stmt.query_map(
                params![query.user_id, query.platform, limit, offset],
                |row| {
                    let received_at: String = row.get(5)?;
                    let received_at = DateTime::parse_from_rfc3339(&received_at)
                        .map(|t| t.with_timezone(&Utc))
                        .map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(
                                5,
                                rusqlite::types::Type::Text,
                                Box::new(e),
                            )
                        })?;
                    Ok(ReceivedMessage {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        platform: row.get(2)?,
                        chat_id: row.get(3)?,
                        message: row.get(4)?,
                        received_at,
                    })
                },
            )?;
            let messages = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(messages)
        })
        .await
    }
}

/// Fixed-width so stored timestamps sort lexically.
fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
