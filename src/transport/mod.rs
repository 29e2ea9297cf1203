//! Transport bridge between assistant pipelines and UI clients.

pub mod http;
pub mod registry;
