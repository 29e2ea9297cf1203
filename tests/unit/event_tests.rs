//! Unit tests for stream record classification and display formatting.

use serde_json::json;

use assistant_relay::stream::event::{classify, format_cost, format_duration, EventKind};

fn line(value: &serde_json::Value) -> String {
    value.to_string()
}

#[test]
fn system_init_announces_session_start() {
    let event = classify(&line(&json!({"type": "system", "subtype": "init", "session_id": "s1"})));
    let unit = event.content_unit();

    assert_eq!(event.kind, EventKind::System);
    assert_eq!(event.subtype.as_deref(), Some("init"));
    assert_eq!(unit.text, "🔧 Initializing assistant session...");
    assert_eq!(unit.category, "system");
    assert!(unit.is_displayable());
}

#[test]
fn other_system_subtype_is_a_generic_notice() {
    let unit = classify(&line(&json!({"type": "system", "subtype": "compact"}))).content_unit();

    assert_eq!(unit.text, "📋 System: compact");
    assert_eq!(unit.category, "system");
}

#[test]
fn system_without_subtype_still_displays() {
    let unit = classify(&line(&json!({"type": "system"}))).content_unit();

    assert_eq!(unit.text, "📋 System: message");
}

#[test]
fn assistant_text_blocks_are_joined_in_order() {
    let event = classify(&line(&json!({
        "type": "assistant",
        "message": {"content": [
            {"type": "text", "text": "Hello"},
            {"type": "tool_use", "name": "Read"},
            {"type": "text", "text": "world"}
        ]}
    })));

    assert_eq!(event.content_unit().text, "Hello world");
    assert_eq!(event.content_unit().category, "assistant");
    assert_eq!(event.assistant_text().as_deref(), Some("Helloworld"));
}

#[test]
fn assistant_string_content_counts_as_text() {
    let event = classify(&line(&json!({
        "type": "assistant",
        "message": {"content": "plain answer"}
    })));

    assert_eq!(event.content_unit().text, "plain answer");
    assert_eq!(event.assistant_text().as_deref(), Some("plain answer"));
}

#[test]
fn assistant_tool_only_names_tools_in_block_order() {
    let unit = classify(&line(&json!({
        "type": "assistant",
        "message": {"content": [
            {"type": "tool_use", "name": "Grep"},
            {"type": "tool_use", "name": "Edit"},
            {"type": "tool_use"}
        ]}
    })))
    .content_unit();

    assert_eq!(unit.text, "⚙️ Using tools: Grep, Edit, unknown");
    assert_eq!(unit.category, "assistant");
    assert!(unit.should_display);
}

#[test]
fn assistant_without_content_is_hidden() {
    let event = classify(&line(&json!({"type": "assistant", "message": {"content": []}})));

    assert!(!event.content_unit().should_display);
    assert_eq!(event.assistant_text(), None);
}

#[test]
fn user_tool_results_are_counted() {
    let one = classify(&line(&json!({
        "type": "user",
        "message": {"content": [{"type": "tool_result", "content": "ok"}]}
    })))
    .content_unit();
    let many = classify(&line(&json!({
        "type": "user",
        "message": {"content": [
            {"type": "tool_result"}, {"type": "tool_result"}, {"type": "tool_result"}
        ]}
    })))
    .content_unit();

    assert_eq!(one.text, "📄 Tool completed (1 result)");
    assert_eq!(many.text, "📄 Tool completed (3 results)");
    assert_eq!(many.category, "user");
}

#[test]
fn user_without_tool_result_is_hidden() {
    let unit = classify(&line(&json!({
        "type": "user",
        "message": {"content": [{"type": "text", "text": "hi"}]}
    })))
    .content_unit();

    assert!(!unit.should_display);
}

#[test]
fn result_with_payload_is_summarised_to_one_hundred_chars() {
    let long = "r".repeat(150);
    let event = classify(&line(&json!({"type": "result", "subtype": "success", "result": long})));
    let unit = event.content_unit();

    let expected = format!("✅ Task completed: {}...", "r".repeat(100));
    assert_eq!(unit.text, expected);
    assert_eq!(unit.category, "result");
    assert_eq!(event.result_text(), Some(long.as_str()));
}

#[test]
fn result_with_short_payload_has_no_ellipsis() {
    let unit = classify(&line(&json!({"type": "result", "result": "Done."}))).content_unit();

    assert_eq!(unit.text, "✅ Task completed: Done.");
}

#[test]
fn result_without_payload_uses_duration_and_cost() {
    let event = classify(&line(&json!({
        "type": "result",
        "duration_ms": 1500,
        "total_cost_usd": 0.0042
    })));

    assert_eq!(event.content_unit().text, "✅ Task completed (1.5s, $4.2m)");
    assert_eq!(event.duration_ms(), Some(1500));
    assert_eq!(event.result_text(), None);
}

#[test]
fn result_lists_only_present_fields() {
    let cost_only =
        classify(&line(&json!({"type": "result", "total_cost_usd": 0.25}))).content_unit();
    let neither = classify(&line(&json!({"type": "result"}))).content_unit();

    assert_eq!(cost_only.text, "✅ Task completed ($0.250)");
    assert_eq!(neither.text, "✅ Task completed");
}

#[test]
fn unrecognised_type_is_unknown_and_hidden() {
    let event = classify(&line(&json!({"type": "stream_event", "delta": "x"})));

    assert_eq!(event.kind, EventKind::Unknown);
    assert!(!event.content_unit().should_display);
}

#[test]
fn non_json_record_is_unknown_with_null_payload() {
    let event = classify("not json");

    assert_eq!(event.kind, EventKind::Unknown);
    assert!(event.raw.is_null());
    assert_eq!(event.line, "not json");
    assert!(!event.content_unit().is_displayable());
}

#[test]
fn json_that_is_not_an_object_is_unknown() {
    assert_eq!(classify("[1,2,3]").kind, EventKind::Unknown);
    assert_eq!(classify("\"text\"").kind, EventKind::Unknown);
}

#[test]
fn relay_terminal_lines_carry_message_content() {
    let final_line = classify(&line(&json!({
        "type": "final_result",
        "message": {"id": "m1", "role": "assistant", "content": "All done"}
    })));
    let error_line = classify(&line(&json!({
        "type": "error",
        "message": {"id": "m2", "role": "assistant", "content": "Error: boom"}
    })));

    assert_eq!(final_line.kind, EventKind::FinalResult);
    assert_eq!(final_line.content_unit().text, "All done");
    assert_eq!(final_line.content_unit().category, "final_result");
    assert_eq!(error_line.kind, EventKind::Error);
    assert_eq!(error_line.content_unit().text, "Error: boom");
}

#[test]
fn record_line_is_preserved_verbatim() {
    let raw = r#"{"type":"system","subtype":"init",  "extra":  true}"#;

    assert_eq!(classify(raw).line, raw);
}

#[test]
fn cost_formatting_switches_at_one_cent() {
    assert_eq!(format_cost(0.0001), "$0.1m");
    assert_eq!(format_cost(0.0099), "$9.9m");
    assert_eq!(format_cost(0.01), "$0.010");
    assert_eq!(format_cost(0.05), "$0.050");
    assert_eq!(format_cost(1.23456), "$1.235");
}

#[test]
fn duration_formatting_switches_at_one_second() {
    assert_eq!(format_duration(0), "0ms");
    assert_eq!(format_duration(999), "999ms");
    assert_eq!(format_duration(1000), "1.0s");
    assert_eq!(format_duration(1500), "1.5s");
    assert_eq!(format_duration(61_240), "61.2s");
}
