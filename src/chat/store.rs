//! Chat message store.
//!
//! `ChatStore` is the persistence contract the broadcast layer depends on:
//! single-record create / find / update / delete, plus a room history
//! query. Every operation is atomic on its own; nothing spans records.
//!
//! `SqliteChatStore` keeps messages in SQLite. With no path it opens an
//! in-memory database, which is what tests use.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{RelayError, Result};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS chat_messages (
    id TEXT PRIMARY KEY,
    room_id TEXT NOT NULL,
    author_user_id TEXT NOT NULL,
    text TEXT NOT NULL DEFAULT '',
    image_ref TEXT,
    -- Unix millis
    created_at INTEGER NOT NULL,
    edited INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_chat_messages_room
    ON chat_messages(room_id, created_at);
"#;

const SELECT_COLUMNS: &str =
    "id, room_id, author_user_id, text, image_ref, created_at, edited";

/// A message as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub id: String,
    pub room_id: String,
    pub author_user_id: String,
    pub text: String,
    pub image_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub edited: bool,
}

impl StoredMessage {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let created_ms: i64 = row.get(5)?;
        let edited: i64 = row.get(6)?;
        Ok(Self {
            id: row.get(0)?,
            room_id: row.get(1)?,
            author_user_id: row.get(2)?,
            text: row.get(3)?,
            image_ref: row.get(4)?,
            created_at: DateTime::from_timestamp_millis(created_ms).unwrap_or_else(Utc::now),
            edited: edited != 0,
        })
    }
}

/// Input to `ChatStore::create`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub room_id: String,
    pub author_user_id: String,
    pub text: String,
    pub image_ref: Option<String>,
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn create(&self, message: NewMessage) -> Result<StoredMessage>;

    async fn find_by_id(&self, id: &str) -> Result<Option<StoredMessage>>;

    /// Replace the text and mark the message edited.
    async fn update_text(&self, id: &str, text: &str) -> Result<StoredMessage>;

    /// Remove a message, returning what was removed.
    async fn delete(&self, id: &str) -> Result<StoredMessage>;

    /// The most recent `limit` messages of a room, oldest first.
    async fn list_room(&self, room_id: &str, limit: usize) -> Result<Vec<StoredMessage>>;
}

#[derive(Clone)]
pub struct SqliteChatStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteChatStore {
    /// Open or create a store. `None` opens an in-memory database.
    pub fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)?,
            None => Connection::open_in_memory()?,
        };

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(CREATE_TABLES)?;

        let version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        if version.is_none() {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
            tracing::info!("Chat schema created (version {})", SCHEMA_VERSION);
        }
        Ok(())
    }

    /// Run a blocking closure against the connection off the async runtime.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn)
        })
        .await
        .map_err(|e| RelayError::Store(format!("store task failed: {}", e)))?
    }
}

fn find(conn: &Connection, id: &str) -> Result<Option<StoredMessage>> {
    let sql = format!("SELECT {} FROM chat_messages WHERE id = ?1", SELECT_COLUMNS);
    let found = conn
        .query_row(&sql, params![id], StoredMessage::from_row)
        .optional()?;
    Ok(found)
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn create(&self, message: NewMessage) -> Result<StoredMessage> {
        let stored = StoredMessage {
            id: Uuid::new_v4().to_string(),
            room_id: message.room_id,
            author_user_id: message.author_user_id,
            text: message.text,
            image_ref: message.image_ref,
            created_at: Utc::now(),
            edited: false,
        };

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO chat_messages (id, room_id, author_user_id, text, image_ref, created_at, edited)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
                params![
                    stored.id,
                    stored.room_id,
                    stored.author_user_id,
                    stored.text,
                    stored.image_ref,
                    stored.created_at.timestamp_millis(),
                ],
            )?;
            Ok(stored)
        })
        .await
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<StoredMessage>> {
        let id = id.to_string();
        self.with_conn(move |conn| find(conn, &id)).await
    }

    async fn update_text(&self, id: &str, text: &str) -> Result<StoredMessage> {
        let id = id.to_string();
        let text = text.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE chat_messages SET text = ?1, edited = 1 WHERE id = ?2",
                params![text, id],
            )?;
            if changed == 0 {
                return Err(RelayError::MessageNotFound(id));
            }
            find(conn, &id)?.ok_or(RelayError::MessageNotFound(id))
        })
        .await
    }

    async fn delete(&self, id: &str) -> Result<StoredMessage> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let existing = find(conn, &id)?.ok_or_else(|| RelayError::MessageNotFound(id.clone()))?;
            conn.execute("DELETE FROM chat_messages WHERE id = ?1", params![id])?;
            Ok(existing)
        })
        .await
    }

    async fn list_room(&self, room_id: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let room_id = room_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM chat_messages WHERE room_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                SELECT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![room_id, limit as i64], StoredMessage::from_row)?;
            let mut messages = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            messages.reverse();
            Ok(messages)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_message(room: &str, text: &str) -> NewMessage {
        NewMessage {
            room_id: room.to_string(),
            author_user_id: "U1".to_string(),
            text: text.to_string(),
            image_ref: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let store = SqliteChatStore::open(None).unwrap();
        let created = store.create(new_message("farmers", "hello")).await.unwrap();
        assert!(!created.edited);

        let found = store.find_by_id(&created.id).await.unwrap().unwrap();
        assert_eq!(found.text, "hello");
        assert_eq!(found.room_id, "farmers");
        assert_eq!(
            found.created_at.timestamp_millis(),
            created.created_at.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn test_update_marks_edited() {
        let store = SqliteChatStore::open(None).unwrap();
        let created = store.create(new_message("farmers", "helo")).await.unwrap();

        let updated = store.update_text(&created.id, "hello").await.unwrap();
        assert_eq!(updated.text, "hello");
        assert!(updated.edited);
    }

    #[tokio::test]
    async fn test_missing_message_errors() {
        let store = SqliteChatStore::open(None).unwrap();
        assert!(store.find_by_id("nope").await.unwrap().is_none());
        assert!(matches!(
            store.update_text("nope", "x").await,
            Err(RelayError::MessageNotFound(_))
        ));
        assert!(matches!(
            store.delete("nope").await,
            Err(RelayError::MessageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_returns_removed_record() {
        let store = SqliteChatStore::open(None).unwrap();
        let created = store.create(new_message("farmers", "bye")).await.unwrap();

        let removed = store.delete(&created.id).await.unwrap();
        assert_eq!(removed.id, created.id);
        assert!(store.find_by_id(&created.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_room_returns_latest_oldest_first() {
        let store = SqliteChatStore::open(None).unwrap();
        for i in 0..5 {
            store
                .create(new_message("farmers", &format!("msg-{}", i)))
                .await
                .unwrap();
        }
        store.create(new_message("dealers", "other room")).await.unwrap();

        let history = store.list_room("farmers", 3).await.unwrap();
        let texts: Vec<&str> = history.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["msg-2", "msg-3", "msg-4"]);
    }

    #[tokio::test]
    async fn test_file_database_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.db");
        let path = path.to_str().unwrap();

        let id = {
            let store = SqliteChatStore::open(Some(path)).unwrap();
            store.create(new_message("farmers", "kept")).await.unwrap().id
        };

        let reopened = SqliteChatStore::open(Some(path)).unwrap();
        let found = reopened.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(found.text, "kept");
    }
}
