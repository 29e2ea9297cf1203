//! Unit tests for the in-flight request registry.

use assistant_relay::transport::registry::ActiveRequests;
use assistant_relay::AppError;

#[test]
fn cancel_fires_token_and_removes_entry() {
    let registry = ActiveRequests::new();
    let guard = registry.register("req-1", None);
    let token = guard.token();

    registry.cancel("req-1").expect("cancel");

    assert!(token.is_cancelled());
    assert!(!registry.contains("req-1"));
}

#[test]
fn cancel_unknown_request_is_not_found() {
    let registry = ActiveRequests::new();

    let result = registry.cancel("missing");

    assert!(matches!(result, Err(AppError::NotFound(ref msg)) if msg == "Request not found"));
}

#[test]
fn second_cancel_is_not_found() {
    let registry = ActiveRequests::new();
    let _guard = registry.register("req-1", None);

    registry.cancel("req-1").expect("first cancel");

    assert!(registry.cancel("req-1").is_err());
}

#[test]
fn dropping_guard_deregisters_without_cancelling() {
    let registry = ActiveRequests::new();
    let guard = registry.register("req-1", None);
    let token = guard.token();

    drop(guard);

    assert!(registry.is_empty());
    assert!(!token.is_cancelled());
}

#[test]
fn reused_id_cancels_previous_and_old_guard_keeps_new_entry() {
    let registry = ActiveRequests::new();
    let first = registry.register("req-1", None);
    let first_token = first.token();

    let second = registry.register("req-1", None);

    assert!(first_token.is_cancelled());
    drop(first);
    assert!(registry.contains("req-1"));
    assert!(!second.token().is_cancelled());
    drop(second);
    assert!(registry.is_empty());
}

#[test]
fn cancel_for_chat_only_touches_that_chat() {
    let registry = ActiveRequests::new();
    let a = registry.register("a", Some("chat-1"));
    let b = registry.register("b", Some("chat-2"));
    let c = registry.register("c", None);

    let cancelled = registry.cancel_for_chat("chat-1");

    assert_eq!(cancelled, 1);
    assert!(a.token().is_cancelled());
    assert!(!b.token().is_cancelled());
    assert!(!c.token().is_cancelled());
    assert_eq!(registry.len(), 2);
}

#[test]
fn cancel_all_drains_registry() {
    let registry = ActiveRequests::new();
    let a = registry.register("a", None);
    let b = registry.register("b", Some("chat"));

    assert_eq!(registry.cancel_all(), 2);

    assert!(a.token().is_cancelled());
    assert!(b.token().is_cancelled());
    assert!(registry.is_empty());
}

#[test]
fn concurrent_register_and_cancel_leave_registry_empty() {
    let registry = ActiveRequests::new();

    std::thread::scope(|scope| {
        for worker in 0..8 {
            let registry = registry.clone();
            scope.spawn(move || {
                for n in 0..100 {
                    let id = format!("{worker}-{n}");
                    let guard = registry.register(&id, None);
                    if n % 2 == 0 {
                        registry.cancel(&id).expect("cancel own request");
                    }
                    drop(guard);
                }
            });
        }
    });

    assert!(registry.is_empty());
}

#[test]
fn register_for_chat_supersedes_the_chat_request() {
    let registry = ActiveRequests::new();
    let first = registry.register("first", Some("chat-1"));
    let other_chat = registry.register("other", Some("chat-2"));

    let (second, superseded) = registry.register_for_chat("second", "chat-1");

    assert_eq!(superseded.len(), 1);
    assert!(first.token().is_cancelled());
    assert!(!other_chat.token().is_cancelled());
    assert!(!second.token().is_cancelled());
    assert!(!registry.contains("first"));
    assert!(registry.contains("second"));
    assert_eq!(registry.len(), 2);
}

#[test]
fn superseded_completion_resolves_when_old_guard_drops() {
    let registry = ActiveRequests::new();
    let first = registry.register("first", Some("chat-1"));

    let (second, superseded) = registry.register_for_chat("second", "chat-1");
    let done = &superseded[0];
    assert!(!done.is_finished());

    drop(first);
    assert!(done.is_finished());
    assert!(registry.contains("second"));
    assert!(!second.completion().is_finished());
}

#[test]
fn register_for_idle_chat_supersedes_nothing() {
    let registry = ActiveRequests::new();

    let (_guard, superseded) = registry.register_for_chat("only", "chat-1");

    assert!(superseded.is_empty());
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn completion_can_be_awaited() {
    let registry = ActiveRequests::new();
    let first = registry.register("first", Some("chat-1"));
    let (_second, mut superseded) = registry.register_for_chat("second", "chat-1");
    let done = superseded.pop().expect("one superseded request");

    let waiter = tokio::spawn(async move { done.finished().await });
    drop(first);

    tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
        .await
        .expect("completion resolves")
        .expect("join");
}

#[test]
fn concurrent_registrations_on_one_chat_leave_one_live_request() {
    let registry = ActiveRequests::new();

    let guards = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let registry = registry.clone();
                scope.spawn(move || {
                    let (guard, _superseded) =
                        registry.register_for_chat(&format!("req-{worker}"), "chat-1");
                    guard
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker"))
            .collect::<Vec<_>>()
    });

    assert_eq!(registry.len(), 1);
    let live: Vec<_> = guards
        .iter()
        .filter(|g| !g.token().is_cancelled())
        .collect();
    assert_eq!(live.len(), 1);
    assert!(registry.contains(live[0].request_id()));
}
