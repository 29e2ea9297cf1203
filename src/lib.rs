#![forbid(unsafe_code)]

pub mod config;
pub mod errors;
pub mod models;
pub mod persistence;
pub mod pipeline;
pub mod project;
pub mod runner;
pub mod stream;
pub mod transport;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
