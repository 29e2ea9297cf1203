//! Per-request accumulation of classified events into a final [`Message`].
//!
//! A [`Reconciler`] is owned by exactly one request pipeline and sees events
//! strictly in arrival order. It:
//!
//! - records every raw record for verbose replay,
//! - appends displayable, not-yet-seen `(text, category)` units and reports
//!   them to the caller for immediate forwarding,
//! - keeps the latest assistant text (each assistant event carries the full
//!   current text, so it replaces rather than appends),
//! - keeps the `result` payload, which wins over assistant text at finalize.

use std::collections::HashSet;

use tracing::debug;

use crate::models::chat::Message;
use crate::stream::event::{ContentUnit, StreamEvent};

/// Content used when a successful run produced no text at all.
pub const NO_CONTENT_PLACEHOLDER: &str = "Streaming completed but no content received.";

/// Content used when a cancelled run produced no text.
pub const CANCELLED_PLACEHOLDER: &str = "Request cancelled.";

/// How the underlying process run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Process exited with a status code.
    Exited(i32),
    /// Process ended without a code (killed by a signal it did not expect).
    Signalled,
    /// The binary could not be launched.
    SpawnFailed(String),
    /// Reading the output stream failed.
    StreamFailed(String),
    /// Cancelled by the caller; not an error.
    Cancelled,
    /// No output or exit within the idle window.
    TimedOut(u64),
}

/// Mutable state for one in-flight request.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    units: Vec<ContentUnit>,
    seen: HashSet<(String, String)>,
    raw_events: Vec<String>,
    latest_assistant_text: Option<String>,
    final_text: Option<String>,
}

impl StreamAccumulator {
    /// Units accepted so far, in arrival order.
    #[must_use]
    pub fn units(&self) -> &[ContentUnit] {
        &self.units
    }

    /// Raw records observed so far, in arrival order.
    #[must_use]
    pub fn raw_events(&self) -> &[String] {
        &self.raw_events
    }

    /// Latest assistant text seen.
    #[must_use]
    pub fn latest_assistant_text(&self) -> Option<&str> {
        self.latest_assistant_text.as_deref()
    }

    /// Result payload, if one arrived.
    #[must_use]
    pub fn final_text(&self) -> Option<&str> {
        self.final_text.as_deref()
    }

    /// Best available answer: result text, else latest assistant text.
    ///
    /// Blank candidates are ignored.
    #[must_use]
    pub fn best_text(&self) -> Option<&str> {
        self.final_text()
            .or_else(|| self.latest_assistant_text())
            .filter(|text| !text.trim().is_empty())
    }

    fn insert_unit(&mut self, unit: &ContentUnit) -> bool {
        let key = (unit.text.clone(), unit.category.clone());
        if self.seen.contains(&key) {
            return false;
        }
        self.seen.insert(key);
        self.units.push(unit.clone());
        true
    }
}

/// Reconciles one request's event stream into a single [`Message`].
#[derive(Debug)]
pub struct Reconciler {
    message_id: String,
    acc: StreamAccumulator,
}

impl Reconciler {
    /// Start reconciling a request whose final message will carry `message_id`.
    #[must_use]
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            acc: StreamAccumulator::default(),
        }
    }

    /// Identifier the finalized message will carry.
    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Current accumulation state.
    #[must_use]
    pub fn accumulator(&self) -> &StreamAccumulator {
        &self.acc
    }

    /// Apply one event.
    ///
    /// Returns the event's unit when it is new and displayable, so the
    /// caller can forward it immediately.
    pub fn observe(&mut self, event: &StreamEvent) -> Option<ContentUnit> {
        self.acc.raw_events.push(event.line.clone());

        if let Some(text) = event.assistant_text() {
            self.acc.latest_assistant_text = Some(text);
        }
        if let Some(result) = event.result_text() {
            self.acc.final_text = Some(result.to_owned());
        }

        let unit = event.content_unit();
        if !unit.is_displayable() {
            return None;
        }
        if self.acc.insert_unit(&unit) {
            Some(unit)
        } else {
            debug!(category = %unit.category, "reconciler: duplicate unit dropped");
            None
        }
    }

    /// Append a chunk of plain-text output to the running answer.
    pub fn observe_plain(&mut self, chunk: &str) {
        self.acc
            .latest_assistant_text
            .get_or_insert_with(String::new)
            .push_str(chunk);
    }

    /// Consume the accumulator and produce the request's terminal message.
    ///
    /// Partial progress is always attached, whatever the outcome.
    #[must_use]
    pub fn finalize(self, outcome: &RunOutcome) -> Message {
        let content = match outcome {
            RunOutcome::Exited(0) => self
                .acc
                .best_text()
                .unwrap_or(NO_CONTENT_PLACEHOLDER)
                .to_owned(),
            RunOutcome::Cancelled => self
                .acc
                .best_text()
                .unwrap_or(CANCELLED_PLACEHOLDER)
                .to_owned(),
            RunOutcome::Exited(code) => {
                format!("Error: assistant command failed with exit code {code}")
            }
            RunOutcome::Signalled => "Error: assistant process was terminated".to_owned(),
            RunOutcome::SpawnFailed(reason) => format!("Error executing assistant: {reason}"),
            RunOutcome::StreamFailed(reason) => {
                format!("Error reading assistant output: {reason}")
            }
            RunOutcome::TimedOut(secs) => format!("Error: no output from assistant for {secs}s"),
        };

        Message::assistant(
            self.message_id,
            content,
            self.acc.units,
            self.acc.raw_events,
        )
    }
}

/// Whether an outcome should be reported to the UI as a failure.
#[must_use]
pub fn is_failure(outcome: &RunOutcome) -> bool {
    !matches!(outcome, RunOutcome::Exited(0) | RunOutcome::Cancelled)
}
