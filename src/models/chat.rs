//! Conversation model: messages and chat sessions.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::stream::event::{truncate_chars, ContentUnit};

/// Characters of the latest message kept as the session preview.
pub const PREVIEW_CHARS: usize = 100;

/// Characters of the first user message used as the generated title.
pub const TITLE_CHARS: usize = 50;

/// Title given to chats before their first user message.
pub const DEFAULT_TITLE: &str = "New Chat";

/// Author of a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Prompt typed by the user.
    User,
    /// Response produced by the assistant.
    Assistant,
}

impl Role {
    /// Storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Kind of file referenced by a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    /// Source code extracted from a fenced block.
    Code,
}

/// File reference attached to a message for the UI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileAttachment {
    /// Display file name.
    pub name: String,
    /// Human-readable size, e.g. `1.2 KB`.
    pub size: String,
    /// File kind.
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
}

/// Finalized, immutable artifact of one exchange.
///
/// A placeholder shown while streaming is replaced by identifier once the
/// final message exists; messages are never edited in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique identifier.
    pub id: String,
    /// Author.
    pub role: Role,
    /// Text content.
    pub content: String,
    /// Display units accumulated while streaming, in arrival order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub units: Vec<ContentUnit>,
    /// Raw stream records kept for verbose replay.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub raw_events: Vec<String>,
    /// Code blocks found in the content.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<FileAttachment>,
    /// Creation time.
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Build a user message with a generated identifier.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Uuid::new_v4().to_string(), Role::User, content.into())
    }

    /// Build an assistant message with the given identifier.
    ///
    /// Attachments are derived from fenced code blocks in `content`.
    #[must_use]
    pub fn assistant(
        id: impl Into<String>,
        content: impl Into<String>,
        units: Vec<ContentUnit>,
        raw_events: Vec<String>,
    ) -> Self {
        let content = content.into();
        let attachments = extract_attachments(&content);
        Self {
            id: id.into(),
            role: Role::Assistant,
            content,
            units,
            raw_events,
            attachments,
            created_at: Utc::now(),
        }
    }

    fn plain(id: String, role: Role, content: String) -> Self {
        Self {
            id,
            role,
            content,
            units: Vec::new(),
            raw_events: Vec::new(),
            attachments: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// Persisted conversation: ordered messages plus summary metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    /// Unique identifier.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Number of messages.
    pub message_count: i64,
    /// Preview of the latest message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    /// Bound working directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    /// Display name of the bound project.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    /// Messages; only populated when the full session is loaded.
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl ChatSession {
    /// Construct an empty session with a generated identifier.
    #[must_use]
    pub fn new(
        title: Option<String>,
        project_path: Option<String>,
        project_name: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title: title
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_TITLE.to_owned()),
            created_at: Utc::now(),
            message_count: 0,
            last_message: None,
            project_path,
            project_name,
            messages: Vec::new(),
        }
    }

    /// Update summary metadata for a message appended at position `message_count`.
    ///
    /// The first message of a chat, when written by the user, becomes its title.
    pub fn record_appended(&mut self, message: &Message) {
        if self.message_count == 0 && message.role == Role::User {
            self.title = truncate_chars(&message.content, TITLE_CHARS);
        }
        self.message_count += 1;
        self.last_message = Some(message.content.chars().take(PREVIEW_CHARS).collect());
    }
}

/// Derive code attachments from fenced code blocks.
#[must_use]
pub fn extract_attachments(content: &str) -> Vec<FileAttachment> {
    static FENCE: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(fence) = FENCE
        .get_or_init(|| Regex::new(r"```(\w+)?\n([\s\S]*?)```").ok())
        .as_ref()
    else {
        return Vec::new();
    };

    fence
        .captures_iter(content)
        .enumerate()
        .map(|(idx, caps)| {
            let language = caps.get(1).map_or("text", |m| m.as_str());
            let code = caps.get(2).map_or("", |m| m.as_str());
            FileAttachment {
                name: format!("generated_{}.{}", idx + 1, file_extension(language)),
                size: format_kb(code.len()),
                kind: AttachmentKind::Code,
            }
        })
        .collect()
}

fn file_extension(language: &str) -> &'static str {
    match language.to_lowercase().as_str() {
        "javascript" => "js",
        "typescript" => "ts",
        "jsx" => "jsx",
        "tsx" => "tsx",
        "python" => "py",
        "rust" => "rs",
        "java" => "java",
        "cpp" => "cpp",
        "c" => "c",
        "html" => "html",
        "css" => "css",
        "json" => "json",
        "yaml" | "yml" => "yml",
        "markdown" => "md",
        "sql" => "sql",
        "bash" | "shell" => "sh",
        _ => "txt",
    }
}

#[allow(clippy::cast_precision_loss)]
fn format_kb(bytes: usize) -> String {
    let kb = (bytes as f64 / 1024.0 * 10.0).round() / 10.0;
    format!("{kb} KB")
}
