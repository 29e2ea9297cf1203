//! Event classification for the assistant's stream-json output.
//!
//! Each complete record from the [`LineFramer`](super::codec::LineFramer) is
//! parsed into a [`StreamEvent`]. Parsing never fails: a record that is not a
//! JSON object becomes an [`EventKind::Unknown`] event with no displayable
//! content, so a bad line can never halt the stream.
//!
//! # Display mapping
//!
//! | `type`         | Condition                  | [`ContentUnit`] text                    |
//! |----------------|----------------------------|-----------------------------------------|
//! | `system`       | `subtype == "init"`        | session start notice                    |
//! | `system`       | any other subtype          | `System: <subtype>`                     |
//! | `assistant`    | text blocks                | text blocks joined with a space         |
//! | `assistant`    | only `tool_use` blocks     | `Using tools: a, b`                     |
//! | `user`         | `tool_result` blocks       | `Tool completed (N results)`            |
//! | `result`       | string `result`            | first 100 characters of the result      |
//! | `result`       | no string `result`         | duration and cost summary               |
//! | `final_result` | relay terminal line        | final message content                   |
//! | `error`        | relay terminal line        | error message content                   |
//! | *(other)*      | any                        | nothing                                 |

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

/// Maximum characters of a `result` payload shown in its summary unit.
pub const RESULT_SUMMARY_CHARS: usize = 100;

/// Semantic kind of a stream record, taken from its `type` discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Session lifecycle notices (`init` and friends).
    System,
    /// Assistant turn carrying the full current text and/or tool calls.
    Assistant,
    /// Tool results fed back to the model.
    User,
    /// Terminal summary emitted by the assistant.
    Result,
    /// Terminal message line appended by the relay itself.
    FinalResult,
    /// Terminal failure line appended by the relay itself.
    Error,
    /// Unparseable record or unrecognised `type`.
    Unknown,
}

impl EventKind {
    /// Category tag used for UI grouping of content units.
    #[must_use]
    pub fn category(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Assistant => "assistant",
            Self::User => "user",
            Self::Result => "result",
            Self::FinalResult => "final_result",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }

    fn from_type(kind: &str) -> Self {
        match kind {
            "system" => Self::System,
            "assistant" => Self::Assistant,
            "user" => Self::User,
            "result" => Self::Result,
            "final_result" => Self::FinalResult,
            "error" => Self::Error,
            _ => Self::Unknown,
        }
    }
}

/// Minimal user-facing fact extracted from one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentUnit {
    /// Display text; empty means nothing to show.
    pub text: String,
    /// Grouping tag mirroring the event kind.
    pub category: String,
    /// Whether the unit is worth showing at all.
    pub should_display: bool,
}

impl ContentUnit {
    fn shown(text: impl Into<String>, kind: EventKind) -> Self {
        Self {
            text: text.into(),
            category: kind.category().to_owned(),
            should_display: true,
        }
    }

    fn hidden(kind: EventKind) -> Self {
        Self {
            text: String::new(),
            category: kind.category().to_owned(),
            should_display: false,
        }
    }

    /// Whether the unit carries non-blank text that should be shown.
    #[must_use]
    pub fn is_displayable(&self) -> bool {
        self.should_display && !self.text.trim().is_empty()
    }
}

/// Loose wire envelope; every field is optional so partial records still classify.
#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    subtype: Option<String>,
}

/// One content block of an assistant or user message.
#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// One parsed record from the assistant's output stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    /// Semantic kind.
    pub kind: EventKind,
    /// Optional `subtype` discriminant.
    pub subtype: Option<String>,
    /// Parsed payload; `Value::Null` when the record was not JSON.
    pub raw: Value,
    /// The record exactly as received, for verbatim forwarding.
    pub line: String,
}

impl StreamEvent {
    /// Text of all `text` blocks concatenated with no separator.
    ///
    /// This is the running answer: each assistant event carries the full
    /// current text, so the latest one supersedes earlier ones. Returns
    /// `None` for non-assistant events or when no text is present.
    #[must_use]
    pub fn assistant_text(&self) -> Option<String> {
        if self.kind != EventKind::Assistant {
            return None;
        }
        let text = message_text(&self.raw, "")?;
        (!text.is_empty()).then_some(text)
    }

    /// Non-empty string `result` payload of a `result` event.
    #[must_use]
    pub fn result_text(&self) -> Option<&str> {
        if self.kind != EventKind::Result {
            return None;
        }
        self.raw
            .get("result")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Reported cost in USD, when present.
    #[must_use]
    pub fn total_cost_usd(&self) -> Option<f64> {
        self.raw.get("total_cost_usd").and_then(Value::as_f64)
    }

    /// Reported wall-clock duration in milliseconds, when present.
    #[must_use]
    pub fn duration_ms(&self) -> Option<u64> {
        self.raw.get("duration_ms").and_then(Value::as_u64)
    }

    /// Derive the user-facing [`ContentUnit`] for this event.
    #[must_use]
    pub fn content_unit(&self) -> ContentUnit {
        match self.kind {
            EventKind::System => self.system_unit(),
            EventKind::Assistant => self.assistant_unit(),
            EventKind::User => self.user_unit(),
            EventKind::Result => self.result_unit(),
            EventKind::FinalResult | EventKind::Error => self.relay_unit(),
            EventKind::Unknown => ContentUnit::hidden(EventKind::Unknown),
        }
    }

    fn system_unit(&self) -> ContentUnit {
        if self.subtype.as_deref() == Some("init") {
            return ContentUnit::shown("🔧 Initializing assistant session...", EventKind::System);
        }
        let subtype = self.subtype.as_deref().unwrap_or("message");
        ContentUnit::shown(format!("📋 System: {subtype}"), EventKind::System)
    }

    fn assistant_unit(&self) -> ContentUnit {
        if let Some(text) = message_text(&self.raw, " ") {
            if !text.trim().is_empty() {
                return ContentUnit::shown(text, EventKind::Assistant);
            }
        }

        let tools: Vec<String> = content_blocks(&self.raw)
            .into_iter()
            .filter(|block| block.block_type == "tool_use")
            .map(|block| block.name.unwrap_or_else(|| "unknown".to_owned()))
            .collect();
        if tools.is_empty() {
            return ContentUnit::hidden(EventKind::Assistant);
        }
        ContentUnit::shown(
            format!("⚙️ Using tools: {}", tools.join(", ")),
            EventKind::Assistant,
        )
    }

    fn user_unit(&self) -> ContentUnit {
        let results = content_blocks(&self.raw)
            .iter()
            .filter(|block| block.block_type == "tool_result")
            .count();
        match results {
            0 => ContentUnit::hidden(EventKind::User),
            1 => ContentUnit::shown("📄 Tool completed (1 result)", EventKind::User),
            n => ContentUnit::shown(format!("📄 Tool completed ({n} results)"), EventKind::User),
        }
    }

    fn result_unit(&self) -> ContentUnit {
        if let Some(result) = self.raw.get("result").and_then(Value::as_str) {
            return ContentUnit::shown(
                format!("✅ Task completed: {}", truncate_chars(result, RESULT_SUMMARY_CHARS)),
                EventKind::Result,
            );
        }

        let parts: Vec<String> = [
            self.duration_ms().map(format_duration),
            self.total_cost_usd().map(format_cost),
        ]
        .into_iter()
        .flatten()
        .collect();
        let text = if parts.is_empty() {
            "✅ Task completed".to_owned()
        } else {
            format!("✅ Task completed ({})", parts.join(", "))
        };
        ContentUnit::shown(text, EventKind::Result)
    }

    fn relay_unit(&self) -> ContentUnit {
        match message_text(&self.raw, " ") {
            Some(text) if !text.is_empty() => ContentUnit::shown(text, self.kind),
            _ => ContentUnit::hidden(self.kind),
        }
    }
}

/// Classify one complete record.
///
/// Never fails; malformed input yields an [`EventKind::Unknown`] event.
#[must_use]
pub fn classify(line: &str) -> StreamEvent {
    let raw: Value = match serde_json::from_str(line) {
        Ok(value @ Value::Object(_)) => value,
        Ok(_) | Err(_) => {
            trace!(len = line.len(), "classifier: record is not a json object");
            return StreamEvent {
                kind: EventKind::Unknown,
                subtype: None,
                raw: Value::Null,
                line: line.to_owned(),
            };
        }
    };

    let envelope = Envelope::deserialize(&raw).unwrap_or_default();
    let kind = envelope
        .kind
        .as_deref()
        .map_or(EventKind::Unknown, EventKind::from_type);

    StreamEvent {
        kind,
        subtype: envelope.subtype,
        raw,
        line: line.to_owned(),
    }
}

/// Format a USD cost: thousandths with an `m` suffix below one cent.
#[must_use]
pub fn format_cost(cost: f64) -> String {
    if cost < 0.01 {
        format!("${:.1}m", cost * 1000.0)
    } else {
        format!("${cost:.3}")
    }
}

/// Format a duration: milliseconds below one second, else seconds.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}

/// Truncate to `max` characters, appending `...` when anything was cut.
#[must_use]
pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_owned(),
    }
}

/// Content blocks of `message.content`, skipping any that do not parse.
fn content_blocks(raw: &Value) -> Vec<ContentBlock> {
    raw.get("message")
        .and_then(|m| m.get("content"))
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| ContentBlock::deserialize(b).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Text of `message.content`: the string itself, or `text` blocks joined by `sep`.
fn message_text(raw: &Value, sep: &str) -> Option<String> {
    let content = raw.get("message")?.get("content")?;
    if let Some(text) = content.as_str() {
        return Some(text.to_owned());
    }
    let texts: Vec<String> = content_blocks(raw)
        .into_iter()
        .filter(|block| block.block_type == "text")
        .filter_map(|block| block.text)
        .collect();
    Some(texts.join(sep))
}
