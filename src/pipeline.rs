//! Request pipeline: one assistant run from spawn to final [`Message`].
//!
//! ```text
//! ProcessRunner → LineFramer → classify → Reconciler → subscribers
//! ```
//!
//! The pipeline runs on a single task, so one request's events are applied
//! strictly in arrival order. Every subscriber gets its own unbounded
//! channel: a slow consumer never blocks the stdout reader and nothing is
//! dropped. A subscriber that goes away is removed; the rest keep receiving.
//!
//! The only suspension points are the next stdout chunk, process exit, and
//! cancellation. Every run resolves to exactly one [`Message`], including
//! spawn failures and cancellations.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::process::ChildStdout;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::models::chat::Message;
use crate::runner::{
    spawn_stderr_logger, ExitReport, Invocation, InvocationMode, ProcessRunner, RunningProcess,
};
use crate::stream::codec::LineFramer;
use crate::stream::event::{classify, ContentUnit};
use crate::stream::reconciler::{is_failure, Reconciler, RunOutcome};
use crate::Result;

const READ_CHUNK_BYTES: usize = 8192;

/// Update published to pipeline subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamUpdate {
    /// A JSON record from the assistant, verbatim.
    Raw(String),
    /// A chunk of plain-text output.
    Progress(String),
    /// A newly accepted display unit.
    Content(ContentUnit),
    /// The terminal message; always the last update.
    Finished {
        /// Finalized message.
        message: Message,
        /// Whether the run ended in failure.
        failed: bool,
    },
}

/// Fan-out of [`StreamUpdate`]s to any number of consumers.
#[derive(Debug, Default)]
pub struct Subscribers {
    senders: Vec<mpsc::UnboundedSender<StreamUpdate>>,
}

impl Subscribers {
    /// Register a new consumer.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<StreamUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.push(tx);
        rx
    }

    /// Number of live consumers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.senders.len()
    }

    /// Whether no consumer is attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }

    /// Deliver `update` to every live consumer, dropping closed ones.
    pub fn publish(&mut self, update: &StreamUpdate) {
        self.senders.retain(|tx| tx.send(update.clone()).is_ok());
    }
}

/// Drives a single request.
#[derive(Debug)]
pub struct RequestPipeline {
    runner: ProcessRunner,
    idle_timeout: Option<Duration>,
    subscribers: Subscribers,
}

enum ReadStep {
    Data(usize),
    Eof,
    Failed(String),
    Idle,
    Cancelled,
}

impl RequestPipeline {
    /// Pipeline using `runner`, abandoning runs silent for `idle_timeout`.
    #[must_use]
    pub fn new(runner: ProcessRunner, idle_timeout: Option<Duration>) -> Self {
        Self {
            runner,
            idle_timeout,
            subscribers: Subscribers::default(),
        }
    }

    /// Register a consumer before the run starts.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<StreamUpdate> {
        self.subscribers.subscribe()
    }

    /// Run `invocation` to completion and return its final message.
    ///
    /// `message_id` becomes the final message's identifier. Cancelling
    /// `cancel` terminates the process; whatever was accumulated is kept.
    pub async fn run(
        mut self,
        request_id: &str,
        message_id: String,
        invocation: &Invocation,
        cancel: CancellationToken,
    ) -> Message {
        let span = info_span!("request", request_id);
        async move {
            let mut reconciler = Reconciler::new(message_id);
            let outcome = self
                .drive(request_id, invocation, &mut reconciler, &cancel)
                .await;

            let failed = is_failure(&outcome);
            info!(?outcome, failed, "request finished");
            let message = reconciler.finalize(&outcome);
            self.subscribers.publish(&StreamUpdate::Finished {
                message: message.clone(),
                failed,
            });
            message
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &mut self,
        request_id: &str,
        invocation: &Invocation,
        reconciler: &mut Reconciler,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        if cancel.is_cancelled() {
            return RunOutcome::Cancelled;
        }

        let mut process = match self.runner.spawn(invocation) {
            Ok(process) => process,
            Err(err) => {
                warn!(%err, "assistant spawn failed");
                return RunOutcome::SpawnFailed(err.to_string());
            }
        };

        if let Some(stderr) = process.take_stderr() {
            drop(spawn_stderr_logger(request_id.to_owned(), stderr));
        }

        let mut early = match process.take_stdout() {
            Some(stdout) => {
                self.pump(stdout, invocation.mode, reconciler, cancel)
                    .await
            }
            None => Some(RunOutcome::StreamFailed("stdout not captured".into())),
        };

        if early.is_some() {
            process.abort();
        }

        // Once stdout is closed the idle window also bounds the exit wait.
        let exit_limit = if early.is_none() { self.idle_timeout } else { None };
        let waited = tokio::select! {
            waited = wait_within(&mut process, exit_limit) => waited,
            () = cancel.cancelled(), if early.is_none() => {
                early = Some(RunOutcome::Cancelled);
                process.abort();
                Some(process.wait().await)
            }
        };
        let waited = match waited {
            Some(waited) => waited,
            None => {
                let secs = self.idle_timeout.map_or(0, |d| d.as_secs());
                warn!(idle_seconds = secs, "assistant closed stdout but did not exit");
                early = Some(RunOutcome::TimedOut(secs));
                process.abort();
                process.wait().await
            }
        };

        if let Some(outcome) = early {
            return outcome;
        }
        match waited {
            Ok(report) => report
                .code
                .map_or(RunOutcome::Signalled, RunOutcome::Exited),
            Err(err) => RunOutcome::StreamFailed(err.to_string()),
        }
    }

    /// Read stdout until EOF. Returns an outcome only when the run must stop early.
    async fn pump(
        &mut self,
        mut stdout: ChildStdout,
        mode: InvocationMode,
        reconciler: &mut Reconciler,
        cancel: &CancellationToken,
    ) -> Option<RunOutcome> {
        let mut framer = LineFramer::new();
        let mut buf = BytesMut::new();
        let mut pending_utf8: Vec<u8> = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK_BYTES];

        loop {
            let step = tokio::select! {
                biased;
                () = cancel.cancelled() => ReadStep::Cancelled,
                step = read_chunk(&mut stdout, &mut chunk, self.idle_timeout) => step,
            };

            match step {
                ReadStep::Data(n) => {
                    let bytes = &chunk[..n];
                    if mode == InvocationMode::Streaming {
                        for line in framer.push_chunk(&mut buf, bytes) {
                            self.handle_record(&line, reconciler);
                        }
                    } else {
                        pending_utf8.extend_from_slice(bytes);
                        let text = take_utf8_prefix(&mut pending_utf8);
                        if !text.is_empty() {
                            reconciler.observe_plain(&text);
                            self.subscribers.publish(&StreamUpdate::Progress(text));
                        }
                    }
                }
                ReadStep::Eof => {
                    framer.finish(&mut buf);
                    if !pending_utf8.is_empty() {
                        let tail = String::from_utf8_lossy(&pending_utf8).into_owned();
                        reconciler.observe_plain(&tail);
                        self.subscribers.publish(&StreamUpdate::Progress(tail));
                    }
                    debug!("assistant stdout closed");
                    return None;
                }
                ReadStep::Failed(reason) => {
                    warn!(%reason, "assistant stdout read failed");
                    return Some(RunOutcome::StreamFailed(reason));
                }
                ReadStep::Idle => {
                    let secs = self.idle_timeout.map_or(0, |d| d.as_secs());
                    warn!(idle_seconds = secs, "assistant idle timeout");
                    return Some(RunOutcome::TimedOut(secs));
                }
                ReadStep::Cancelled => {
                    info!("request cancelled");
                    return Some(RunOutcome::Cancelled);
                }
            }
        }
    }

    fn handle_record(&mut self, line: &str, reconciler: &mut Reconciler) {
        if line.trim().is_empty() {
            return;
        }
        let event = classify(line);
        if !event.raw.is_null() {
            self.subscribers
                .publish(&StreamUpdate::Raw(event.line.clone()));
        }
        if let Some(unit) = reconciler.observe(&event) {
            self.subscribers.publish(&StreamUpdate::Content(unit));
        }
    }
}

/// Wait for exit, giving up after `limit`. `None` means the limit elapsed.
async fn wait_within(
    process: &mut RunningProcess,
    limit: Option<Duration>,
) -> Option<Result<ExitReport>> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, process.wait()).await.ok(),
        None => Some(process.wait().await),
    }
}

async fn read_chunk(
    stdout: &mut ChildStdout,
    chunk: &mut [u8],
    idle_timeout: Option<Duration>,
) -> ReadStep {
    let result = match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, stdout.read(chunk)).await {
            Ok(result) => result,
            Err(_elapsed) => return ReadStep::Idle,
        },
        None => stdout.read(chunk).await,
    };
    match result {
        Ok(0) => ReadStep::Eof,
        Ok(n) => ReadStep::Data(n),
        Err(err) => ReadStep::Failed(err.to_string()),
    }
}

/// Decode everything in `pending` except an incomplete trailing character.
///
/// Invalid bytes are replaced and decoding continues past them; only an
/// unfinished multi-byte sequence at the end stays buffered.
fn take_utf8_prefix(pending: &mut Vec<u8>) -> String {
    let mut text = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(valid) => {
                text.push_str(valid);
                pending.clear();
                return text;
            }
            Err(err) => {
                let valid = err.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match err.error_len() {
                    Some(bad) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + bad);
                    }
                    None => {
                        pending.drain(..valid);
                        return text;
                    }
                }
            }
        }
    }
}
