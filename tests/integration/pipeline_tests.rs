//! End-to-end request pipeline tests against a scripted fake assistant.

#![cfg(unix)]

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use assistant_relay::models::chat::Role;
use assistant_relay::pipeline::{RequestPipeline, StreamUpdate};
use assistant_relay::runner::{Invocation, ProcessRunner};

use super::test_helpers::{script_runner, FAILING_SCRIPT, SLOW_SCRIPT, STREAM_SCRIPT};

fn streaming() -> Invocation {
    Invocation::streaming("hello", std::env::temp_dir(), false)
}

fn plain() -> Invocation {
    Invocation::plain("hello", std::env::temp_dir(), false)
}

async fn drain(mut rx: mpsc::UnboundedReceiver<StreamUpdate>) -> Vec<StreamUpdate> {
    let mut updates = Vec::new();
    while let Some(update) = rx.recv().await {
        updates.push(update);
    }
    updates
}

async fn run_script(
    script: &str,
    invocation: &Invocation,
) -> (assistant_relay::models::chat::Message, Vec<StreamUpdate>) {
    let mut pipeline = RequestPipeline::new(script_runner(script), Some(Duration::from_secs(10)));
    let rx = pipeline.subscribe();
    let message = pipeline
        .run("req-1", "msg-1".into(), invocation, CancellationToken::new())
        .await;
    (message, drain(rx).await)
}

fn raw_lines(updates: &[StreamUpdate]) -> Vec<&str> {
    updates
        .iter()
        .filter_map(|u| match u {
            StreamUpdate::Raw(line) => Some(line.as_str()),
            _ => None,
        })
        .collect()
}

fn content_texts(updates: &[StreamUpdate]) -> Vec<&str> {
    updates
        .iter()
        .filter_map(|u| match u {
            StreamUpdate::Content(unit) => Some(unit.text.as_str()),
            _ => None,
        })
        .collect()
}

fn finished(updates: &[StreamUpdate]) -> (&assistant_relay::models::chat::Message, bool) {
    match updates.last() {
        Some(StreamUpdate::Finished { message, failed }) => (message, *failed),
        other => panic!("expected Finished last, got {other:?}"),
    }
}

#[tokio::test]
async fn successful_run_streams_records_then_finishes() {
    let (message, updates) = run_script(STREAM_SCRIPT, &streaming()).await;

    let raw = raw_lines(&updates);
    assert_eq!(raw.len(), 3);
    assert!(raw[0].contains(r#""subtype":"init""#));
    assert!(raw[2].contains(r#""type":"result""#));

    let texts = content_texts(&updates);
    assert_eq!(texts[0], "🔧 Initializing assistant session...");
    assert_eq!(texts[1], "Hello");
    assert!(texts[2].starts_with("✅ Task completed: Hello world"));

    let (final_message, failed) = finished(&updates);
    assert!(!failed);
    assert_eq!(final_message, &message);

    assert_eq!(message.id, "msg-1");
    assert_eq!(message.role, Role::Assistant);
    assert_eq!(message.content, "Hello world");
    assert_eq!(message.units.len(), 3);
    assert_eq!(message.raw_events.len(), 3);
}

#[tokio::test]
async fn exactly_one_finished_update() {
    let (_, updates) = run_script(STREAM_SCRIPT, &streaming()).await;
    let count = updates
        .iter()
        .filter(|u| matches!(u, StreamUpdate::Finished { .. }))
        .count();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn malformed_and_blank_lines_are_not_forwarded() {
    let script = r#"printf '%s\n' 'not json at all' '' '[1,2]' \
'{"type":"assistant","message":{"content":[{"type":"text","text":"survived"}]}}'"#;
    let (message, updates) = run_script(script, &streaming()).await;

    assert_eq!(raw_lines(&updates).len(), 1);
    assert_eq!(content_texts(&updates), vec!["survived"]);
    assert_eq!(message.content, "survived");
    // Non-JSON records are still kept for replay; blank ones are not.
    assert_eq!(message.raw_events.len(), 3);
}

#[tokio::test]
async fn repeated_assistant_text_is_forwarded_once() {
    let script = r#"printf '%s\n' \
'{"type":"assistant","message":{"content":[{"type":"text","text":"same"}]}}' \
'{"type":"assistant","message":{"content":[{"type":"text","text":"same"}]}}' \
'{"type":"assistant","message":{"content":[{"type":"text","text":"same, extended"}]}}'"#;
    let (message, updates) = run_script(script, &streaming()).await;

    assert_eq!(content_texts(&updates), vec!["same", "same, extended"]);
    assert_eq!(message.content, "same, extended");
}

#[tokio::test]
async fn trailing_record_without_newline_is_discarded() {
    let script = r#"printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"kept"}]}}'
printf '%s' '{"type":"result","result":"lost"}'"#;
    let (message, updates) = run_script(script, &streaming()).await;

    assert_eq!(raw_lines(&updates).len(), 1);
    assert_eq!(message.content, "kept");
}

#[tokio::test]
async fn records_split_across_writes_are_reassembled() {
    let script = r#"printf '%s' '{"type":"assistant","message":{"content":[{"type":"text","te'
sleep 0.1
printf '%s\n' 'xt":"héllo wörld"}]}}'"#;
    let (message, updates) = run_script(script, &streaming()).await;

    assert_eq!(raw_lines(&updates).len(), 1);
    assert_eq!(message.content, "héllo wörld");
}

#[tokio::test]
async fn empty_successful_run_gets_placeholder() {
    let (message, updates) = run_script("exit 0", &streaming()).await;
    let (_, failed) = finished(&updates);
    assert!(!failed);
    assert_eq!(
        message.content,
        "Streaming completed but no content received."
    );
}

#[tokio::test]
async fn non_zero_exit_fails_with_code_and_keeps_units() {
    let (message, updates) = run_script(FAILING_SCRIPT, &streaming()).await;

    let (_, failed) = finished(&updates);
    assert!(failed);
    assert_eq!(
        message.content,
        "Error: assistant command failed with exit code 3"
    );
    assert_eq!(message.units.len(), 1);
    assert_eq!(message.units[0].text, "working");
}

#[tokio::test]
async fn spawn_failure_finishes_with_error_message() {
    let runner = ProcessRunner::new("/nonexistent/assistant-binary", Vec::new());
    let mut pipeline = RequestPipeline::new(runner, None);
    let rx = pipeline.subscribe();
    let message = pipeline
        .run("req-1", "msg-1".into(), &streaming(), CancellationToken::new())
        .await;
    let updates = drain(rx).await;

    assert_eq!(updates.len(), 1);
    let (_, failed) = finished(&updates);
    assert!(failed);
    assert!(
        message.content.starts_with("Error executing assistant:"),
        "got: {}",
        message.content
    );
}

#[tokio::test]
async fn cancellation_stops_the_process_and_keeps_partial_text() {
    let mut pipeline =
        RequestPipeline::new(script_runner(SLOW_SCRIPT), Some(Duration::from_secs(30)));
    let mut rx = pipeline.subscribe();
    let token = CancellationToken::new();
    let run_token = token.clone();
    let invocation = streaming();

    let started = Instant::now();
    let handle = tokio::spawn(async move {
        pipeline
            .run("req-1", "msg-1".into(), &invocation, run_token)
            .await
    });

    loop {
        match rx.recv().await {
            Some(StreamUpdate::Content(unit)) if unit.text == "partial" => break,
            Some(_) => {}
            None => panic!("stream ended before the first unit"),
        }
    }
    token.cancel();

    let message = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("run finishes after cancel")
        .expect("join");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(message.content, "partial");

    let rest = drain(rx).await;
    let (_, failed) = finished(&rest);
    assert!(!failed, "cancellation is not a failure");
}

#[tokio::test]
async fn cancelled_before_start_never_spawns() {
    let runner = ProcessRunner::new("/nonexistent/assistant-binary", Vec::new());
    let pipeline = RequestPipeline::new(runner, None);
    let token = CancellationToken::new();
    token.cancel();

    let message = pipeline
        .run("req-1", "msg-1".into(), &streaming(), token)
        .await;
    assert_eq!(message.content, "Request cancelled.");
}

#[tokio::test]
async fn silent_assistant_times_out() {
    let mut pipeline =
        RequestPipeline::new(script_runner(SLOW_SCRIPT), Some(Duration::from_secs(1)));
    let rx = pipeline.subscribe();
    let message = tokio::time::timeout(
        Duration::from_secs(10),
        pipeline.run("req-1", "msg-1".into(), &streaming(), CancellationToken::new()),
    )
    .await
    .expect("idle timeout fires");
    let updates = drain(rx).await;

    let (_, failed) = finished(&updates);
    assert!(failed);
    assert_eq!(message.content, "Error: no output from assistant for 1s");
    assert_eq!(message.units.len(), 1);
}

#[tokio::test]
async fn assistant_that_closes_stdout_but_lingers_times_out() {
    let script = r#"printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"partial"}]}}'
exec 1>&-
exec sleep 30"#;
    let mut pipeline = RequestPipeline::new(script_runner(script), Some(Duration::from_secs(1)));
    let rx = pipeline.subscribe();

    let started = Instant::now();
    let message = tokio::time::timeout(
        Duration::from_secs(10),
        pipeline.run("req-1", "msg-1".into(), &streaming(), CancellationToken::new()),
    )
    .await
    .expect("exit wait is bounded by the idle timeout");
    let updates = drain(rx).await;

    assert!(started.elapsed() < Duration::from_secs(8));
    let (_, failed) = finished(&updates);
    assert!(failed);
    assert_eq!(message.content, "Error: no output from assistant for 1s");
    assert_eq!(message.units.len(), 1);
}

#[tokio::test]
async fn plain_mode_publishes_progress_and_appends_output() {
    let script = "printf 'Hello, '; sleep 0.1; printf 'plain wörld'";
    let (message, updates) = run_script(script, &plain()).await;

    let progress: String = updates
        .iter()
        .filter_map(|u| match u {
            StreamUpdate::Progress(text) => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(progress, "Hello, plain wörld");
    assert!(raw_lines(&updates).is_empty());
    assert_eq!(message.content, "Hello, plain wörld");
}

#[tokio::test]
async fn every_subscriber_sees_the_same_updates() {
    let mut pipeline = RequestPipeline::new(script_runner(STREAM_SCRIPT), None);
    let first = pipeline.subscribe();
    let second = pipeline.subscribe();
    let dropped = pipeline.subscribe();
    drop(dropped);

    pipeline
        .run("req-1", "msg-1".into(), &streaming(), CancellationToken::new())
        .await;

    let a = drain(first).await;
    let b = drain(second).await;
    assert_eq!(a, b);
    assert!(matches!(a.last(), Some(StreamUpdate::Finished { .. })));
}

#[tokio::test]
async fn prompt_and_flags_reach_the_assistant() {
    let invocation = Invocation::plain("what now?", std::env::temp_dir(), true);
    let (message, _) = run_script(r#"printf '%s|' "$@""#, &invocation).await;

    assert!(message.content.contains("--continue|"), "got: {}", message.content);
    assert!(message.content.ends_with("what now?|"), "got: {}", message.content);
}
