//! `SQLite` schema bootstrap logic.
//!
//! Every statement is `IF NOT EXISTS`, so this runs on each startup.

use sqlx::SqlitePool;

use crate::Result;

/// Create the chat tables idempotently.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS chat_session (
    id              TEXT PRIMARY KEY NOT NULL,
    title           TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    message_count   INTEGER NOT NULL DEFAULT 0,
    last_message    TEXT,
    project_path    TEXT,
    project_name    TEXT
);

CREATE TABLE IF NOT EXISTS chat_message (
    id              TEXT PRIMARY KEY NOT NULL,
    chat_id         TEXT NOT NULL REFERENCES chat_session(id) ON DELETE CASCADE,
    seq             INTEGER NOT NULL,
    role            TEXT NOT NULL CHECK(role IN ('user','assistant')),
    content         TEXT NOT NULL,
    units           TEXT NOT NULL DEFAULT '[]',
    raw_events      TEXT NOT NULL DEFAULT '[]',
    attachments     TEXT NOT NULL DEFAULT '[]',
    created_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_message_chat ON chat_message(chat_id, seq);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
