//! Assistant output stream handling.
//!
//! - `codec`: newline framing of raw stdout bytes.
//! - `event`: classification of each record into a [`StreamEvent`](event::StreamEvent)
//!   and its display [`ContentUnit`](event::ContentUnit).
//! - `reconciler`: per-request accumulation and finalization.

pub mod codec;
pub mod event;
pub mod reconciler;
