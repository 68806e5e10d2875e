//! Relational storage for conversations, messages and documents.
//!
//! The query pipeline only ever sees these rows through the
//! [`ConversationStore`] and [`DocumentRegistry`] traits. [`SqliteStore`]
//! implements both on top of a shared `sqlx` pool. Each call checks a
//! connection out of the pool and returns it when the call completes, and
//! no call spans more than one row-level unit of work.
//!
//! Timestamps are stored as Unix milliseconds and rendered as RFC 3339
//! strings on the way out.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::models::{Conversation, Document, Message, NewDocument, Role};

/// Longest title derived from a first message, in characters.
const TITLE_MAX_CHARS: usize = 50;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Create a conversation. `None` uses the default title.
    async fn create(&self, title: Option<&str>) -> Result<Conversation, PersistenceError>;

    async fn find(&self, id: &str) -> Result<Option<Conversation>, PersistenceError>;

    /// All conversations, most recently updated first.
    async fn list(&self) -> Result<Vec<Conversation>, PersistenceError>;

    /// Returns `false` when no such conversation exists.
    async fn rename(&self, id: &str, title: &str) -> Result<bool, PersistenceError>;

    /// Delete a conversation and its messages.
    async fn delete(&self, id: &str) -> Result<bool, PersistenceError>;

    /// Append a message and touch the conversation. The first user message
    /// of a conversation also becomes its title.
    async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message, PersistenceError>;

    /// Messages of a conversation, oldest first.
    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, PersistenceError>;
}

#[async_trait]
pub trait DocumentRegistry: Send + Sync {
    async fn create(&self, doc: NewDocument) -> Result<Document, PersistenceError>;

    async fn get(&self, id: &str) -> Result<Option<Document>, PersistenceError>;

    /// Remove the registry row only. Embedding records are left in place.
    async fn delete(&self, id: &str) -> Result<bool, PersistenceError>;

    /// All documents, newest first.
    async fn list(&self) -> Result<Vec<Document>, PersistenceError>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Title derived from the first message of a conversation.
pub fn title_from_message(content: &str) -> String {
    let mut title: String = content.chars().take(TITLE_MAX_CHARS).collect();
    if content.chars().count() > TITLE_MAX_CHARS {
        title.push_str("...");
    }
    title
}

fn format_ts(millis: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn row_to_conversation(row: &sqlx::sqlite::SqliteRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        title: row.get("title"),
        created_at: format_ts(row.get("created_at")),
        updated_at: format_ts(row.get("updated_at")),
        message_count: row.get("message_count"),
    }
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> Document {
    Document {
        id: row.get("id"),
        filename: row.get("filename"),
        file_path: row.get("file_path"),
        file_size: row.get("file_size"),
        chunk_count: row.get("chunk_count"),
        created_at: format_ts(row.get("created_at")),
    }
}

const CONVERSATION_COLUMNS: &str = r#"
    SELECT c.id, c.title, c.created_at, c.updated_at,
           (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id) AS message_count
    FROM conversations c
"#;

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn create(&self, title: Option<&str>) -> Result<Conversation, PersistenceError> {
        let id = Uuid::new_v4().to_string();
        let title = title.unwrap_or("New Chat");
        let now = now_millis();

        sqlx::query(
            "INSERT INTO conversations (id, title, created_at, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(title)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Conversation {
            id,
            title: title.to_string(),
            created_at: format_ts(now),
            updated_at: format_ts(now),
            message_count: 0,
        })
    }

    async fn find(&self, id: &str) -> Result<Option<Conversation>, PersistenceError> {
        let row = sqlx::query(&format!("{} WHERE c.id = ?", CONVERSATION_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_conversation))
    }

    async fn list(&self) -> Result<Vec<Conversation>, PersistenceError> {
        let rows = sqlx::query(&format!(
            "{} ORDER BY c.updated_at DESC, c.created_at DESC",
            CONVERSATION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_conversation).collect())
    }

    async fn rename(&self, id: &str, title: &str) -> Result<bool, PersistenceError> {
        let result = sqlx::query("UPDATE conversations SET title = ?, updated_at = ? WHERE id = ?")
            .bind(title)
            .bind(now_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: &str) -> Result<bool, PersistenceError> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
    ) -> Result<Message, PersistenceError> {
        let mut tx = self.pool.begin().await?;
        let now = now_millis();

        // Write before reading so the transaction holds the write lock and
        // never has to upgrade a read snapshot.
        let touched = sqlx::query("UPDATE conversations SET updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            return Err(sqlx::Error::RowNotFound.into());
        }

        let id = Uuid::new_v4().to_string();
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO messages (id, conversation_id, seq, role, content, created_at)
            SELECT ?, ?, COALESCE(MAX(seq) + 1, 0), ?, ?, ?
            FROM messages WHERE conversation_id = ?
            RETURNING seq
            "#,
        )
        .bind(&id)
        .bind(conversation_id)
        .bind(role.as_str())
        .bind(content)
        .bind(now)
        .bind(conversation_id)
        .fetch_one(&mut *tx)
        .await?;

        if seq == 0 && role == Role::User {
            sqlx::query("UPDATE conversations SET title = ? WHERE id = ?")
                .bind(title_from_message(content))
                .bind(conversation_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(Message {
            id,
            role,
            content: content.to_string(),
            created_at: format_ts(now),
        })
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, PersistenceError> {
        let rows = sqlx::query(
            r#"
            SELECT id, role, content, created_at
            FROM messages
            WHERE conversation_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in &rows {
            let role: String = row.get("role");
            let role = Role::parse(&role).ok_or_else(|| {
                sqlx::Error::Decode(format!("unknown message role '{}'", role).into())
            })?;
            messages.push(Message {
                id: row.get("id"),
                role,
                content: row.get("content"),
                created_at: format_ts(row.get("created_at")),
            });
        }
        Ok(messages)
    }
}

#[async_trait]
impl DocumentRegistry for SqliteStore {
    async fn create(&self, doc: NewDocument) -> Result<Document, PersistenceError> {
        let now = now_millis();
        sqlx::query(
            r#"
            INSERT INTO documents (id, filename, file_path, file_size, chunk_count, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.filename)
        .bind(&doc.file_path)
        .bind(doc.file_size)
        .bind(doc.chunk_count)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Document {
            id: doc.id,
            filename: doc.filename,
            file_path: doc.file_path,
            file_size: doc.file_size,
            chunk_count: doc.chunk_count,
            created_at: format_ts(now),
        })
    }

    async fn get(&self, id: &str) -> Result<Option<Document>, PersistenceError> {
        let row = sqlx::query(
            "SELECT id, filename, file_path, file_size, chunk_count, created_at \
             FROM documents WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_document))
    }

    async fn delete(&self, id: &str) -> Result<bool, PersistenceError> {
        let result = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list(&self) -> Result<Vec<Document>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT id, filename, file_path, file_size, chunk_count, created_at \
             FROM documents ORDER BY created_at DESC, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_document).collect())
    }
}
