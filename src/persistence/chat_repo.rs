//! Chat session and message repository for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::chat::{ChatSession, Message, Role};
use crate::{AppError, Result};

use super::db::Database;

/// Repository wrapper around `SQLite` for chat sessions and their messages.
#[derive(Clone)]
pub struct ChatRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct ChatSessionRow {
    id: String,
    title: String,
    created_at: String,
    message_count: i64,
    last_message: Option<String>,
    project_path: Option<String>,
    project_name: Option<String>,
}

impl ChatSessionRow {
    fn into_session(self) -> Result<ChatSession> {
        Ok(ChatSession {
            id: self.id,
            title: self.title,
            created_at: parse_timestamp(&self.created_at, "created_at")?,
            message_count: self.message_count,
            last_message: self.last_message,
            project_path: self.project_path,
            project_name: self.project_name,
            messages: Vec::new(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ChatMessageRow {
    id: String,
    role: String,
    content: String,
    units: String,
    raw_events: String,
    attachments: String,
    created_at: String,
}

impl ChatMessageRow {
    fn into_message(self) -> Result<Message> {
        let role = match self.role.as_str() {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => return Err(AppError::Db(format!("invalid message role: {other}"))),
        };
        Ok(Message {
            id: self.id,
            role,
            content: self.content,
            units: serde_json::from_str(&self.units)
                .map_err(|e| AppError::Db(format!("invalid units: {e}")))?,
            raw_events: serde_json::from_str(&self.raw_events)
                .map_err(|e| AppError::Db(format!("invalid raw_events: {e}")))?,
            attachments: serde_json::from_str(&self.attachments)
                .map_err(|e| AppError::Db(format!("invalid attachments: {e}")))?,
            created_at: parse_timestamp(&self.created_at, "created_at")?,
        })
    }
}

fn parse_timestamp(raw: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| AppError::Db(format!("invalid {field}: {e}")))
}

fn to_json<T: serde::Serialize>(value: &T, field: &str) -> Result<String> {
    serde_json::to_string(value).map_err(|e| AppError::Db(format!("serialize {field}: {e}")))
}

fn not_found(id: &str) -> AppError {
    AppError::NotFound(format!("chat {id} not found"))
}

impl ChatRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new chat session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn create(&self, session: &ChatSession) -> Result<ChatSession> {
        sqlx::query(
            "INSERT INTO chat_session (id, title, created_at, message_count,
             last_message, project_path, project_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&session.id)
        .bind(&session.title)
        .bind(session.created_at.to_rfc3339())
        .bind(session.message_count)
        .bind(&session.last_message)
        .bind(&session.project_path)
        .bind(&session.project_name)
        .execute(self.db.as_ref())
        .await?;

        Ok(session.clone())
    }

    /// Retrieve a session's summary without its messages.
    ///
    /// Returns `Ok(None)` if the session does not exist.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<ChatSession>> {
        let row: Option<ChatSessionRow> =
            sqlx::query_as("SELECT * FROM chat_session WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(ChatSessionRow::into_session).transpose()
    }

    /// Retrieve a session together with all of its messages.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if a query fails.
    pub async fn load(&self, id: &str) -> Result<Option<ChatSession>> {
        let Some(mut session) = self.get_by_id(id).await? else {
            return Ok(None);
        };
        session.messages = self.list_messages(id).await?;
        Ok(Some(session))
    }

    /// List session summaries, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self) -> Result<Vec<ChatSession>> {
        let rows: Vec<ChatSessionRow> =
            sqlx::query_as("SELECT * FROM chat_session ORDER BY created_at DESC, rowid DESC")
                .fetch_all(self.db.as_ref())
                .await?;

        rows.into_iter().map(ChatSessionRow::into_session).collect()
    }

    /// Change a session's title.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist, or
    /// `AppError::Db` if the update fails.
    pub async fn rename(&self, id: &str, title: &str) -> Result<()> {
        let done = sqlx::query("UPDATE chat_session SET title = ?1 WHERE id = ?2")
            .bind(title)
            .bind(id)
            .execute(self.db.as_ref())
            .await?;

        if done.rows_affected() == 0 {
            return Err(not_found(id));
        }
        Ok(())
    }

    /// Bind a session to a project directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist, or
    /// `AppError::Db` if the update fails.
    pub async fn set_project(
        &self,
        id: &str,
        project_path: Option<&str>,
        project_name: Option<&str>,
    ) -> Result<()> {
        let done = sqlx::query(
            "UPDATE chat_session SET project_path = ?1, project_name = ?2 WHERE id = ?3",
        )
        .bind(project_path)
        .bind(project_name)
        .bind(id)
        .execute(self.db.as_ref())
        .await?;

        if done.rows_affected() == 0 {
            return Err(not_found(id));
        }
        Ok(())
    }

    /// Delete a session and its messages.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist, or
    /// `AppError::Db` if the delete fails.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query("DELETE FROM chat_message WHERE chat_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let done = sqlx::query("DELETE FROM chat_session WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        if done.rows_affected() == 0 {
            return Err(not_found(id));
        }
        tx.commit().await?;
        Ok(())
    }

    /// Append a message and update the session's summary metadata.
    ///
    /// Returns the updated session summary.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist, or
    /// `AppError::Db` if a write fails.
    pub async fn append(&self, chat_id: &str, message: &Message) -> Result<ChatSession> {
        let mut tx = self.db.begin().await?;

        let row: Option<ChatSessionRow> =
            sqlx::query_as("SELECT * FROM chat_session WHERE id = ?1")
                .bind(chat_id)
                .fetch_optional(&mut *tx)
                .await?;
        let mut session = row.ok_or_else(|| not_found(chat_id))?.into_session()?;
        let seq = session.message_count;
        session.record_appended(message);

        sqlx::query(
            "INSERT INTO chat_message (id, chat_id, seq, role, content, units,
             raw_events, attachments, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&message.id)
        .bind(chat_id)
        .bind(seq)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(to_json(&message.units, "units")?)
        .bind(to_json(&message.raw_events, "raw_events")?)
        .bind(to_json(&message.attachments, "attachments")?)
        .bind(message.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE chat_session SET title = ?1, message_count = ?2, last_message = ?3
             WHERE id = ?4",
        )
        .bind(&session.title)
        .bind(session.message_count)
        .bind(&session.last_message)
        .bind(chat_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(session)
    }

    /// All messages of a session in append order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_messages(&self, chat_id: &str) -> Result<Vec<Message>> {
        let rows: Vec<ChatMessageRow> = sqlx::query_as(
            "SELECT id, role, content, units, raw_events, attachments, created_at
             FROM chat_message WHERE chat_id = ?1 ORDER BY seq ASC",
        )
        .bind(chat_id)
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(ChatMessageRow::into_message).collect()
    }

    /// Remove every message of a session and reset its counters.
    ///
    /// The title is kept.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist, or
    /// `AppError::Db` if a write fails.
    pub async fn clear_messages(&self, chat_id: &str) -> Result<()> {
        let mut tx = self.db.begin().await?;

        sqlx::query("DELETE FROM chat_message WHERE chat_id = ?1")
            .bind(chat_id)
            .execute(&mut *tx)
            .await?;
        let done = sqlx::query(
            "UPDATE chat_session SET message_count = 0, last_message = NULL WHERE id = ?1",
        )
        .bind(chat_id)
        .execute(&mut *tx)
        .await?;

        if done.rows_affected() == 0 {
            return Err(not_found(chat_id));
        }
        tx.commit().await?;
        Ok(())
    }
}
