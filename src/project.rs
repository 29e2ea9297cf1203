//! Project inspection and one-shot initialization.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::chat::Message;
use crate::runner::{spawn_stderr_logger, Invocation, ProcessRunner};
use crate::{AppError, Result};

/// Assistant configuration files, in lookup order.
pub const CONFIG_FILE_NAMES: [&str; 4] = ["CLAUDE.md", "Claude.md", "claude.md", ".claude.md"];

/// Content returned when initialization succeeds without output.
pub const INIT_DEFAULT_CONTENT: &str = "Project initialized successfully.";

/// Whether a directory already carries assistant configuration.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    /// A configuration file was found.
    pub has_claude_config: bool,
    /// Path of the first configuration file found.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude_config_path: Option<PathBuf>,
    /// The directory should be initialized before use.
    pub needs_init: bool,
}

/// Look for an assistant configuration file in `dir`.
#[must_use]
pub fn check_project(dir: &Path) -> ProjectInfo {
    let found = CONFIG_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file());

    ProjectInfo {
        has_claude_config: found.is_some(),
        needs_init: found.is_none(),
        claude_config_path: found,
    }
}

/// Run the assistant's one-shot init in `dir` and report the result.
///
/// Failures are reported as the message content rather than as errors.
pub async fn init_project(runner: &ProcessRunner, dir: &Path) -> Message {
    let request_id = Uuid::new_v4().to_string();
    let content = match run_init(runner, dir, &request_id).await {
        Ok(output) if output.trim().is_empty() => INIT_DEFAULT_CONTENT.to_owned(),
        Ok(output) => output.trim().to_owned(),
        Err(err) => {
            warn!(dir = %dir.display(), %err, "project init failed");
            match err {
                AppError::Process(reason) => format!("Error: {reason}"),
                other => format!("Error executing assistant: {other}"),
            }
        }
    };
    Message::assistant(request_id, content, Vec::new(), Vec::new())
}

async fn run_init(runner: &ProcessRunner, dir: &Path, request_id: &str) -> Result<String> {
    let mut process = runner.spawn(&Invocation::init(dir))?;
    if let Some(stderr) = process.take_stderr() {
        drop(spawn_stderr_logger(request_id.to_owned(), stderr));
    }

    let (output, report) = process.collect_output().await?;
    if report.success() {
        info!(dir = %dir.display(), "project initialized");
        return Ok(output);
    }
    Err(AppError::Process(match report.code {
        Some(code) => format!("project init failed with exit code {code}"),
        None => "project init was terminated".to_owned(),
    }))
}
