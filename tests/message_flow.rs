mod common;

use common::{error_script, ok_script, TestStack, ASSISTANT};

/// A message without the trigger never reaches the agent; a triggered one
/// produces exactly one run and a prefixed reply.
#[tokio::test]
async fn trigger_filter_routes_only_addressed_messages() {
    let stack = TestStack::build(None).await;

    stack.store_inbound("m1", "hello there", "2026-02-01T10:00:00Z");
    stack.intake.poll_once().await.unwrap();
    assert_eq!(stack.run_count(), 0, "untriggered message must not run");

    stack.store_inbound("m2", "@Bhavi what's up?", "2026-02-01T10:00:01Z");
    stack.intake.poll_once().await.unwrap();
    assert_eq!(stack.run_count(), 1);

    let replies = stack.transport.sent_to("fam@g.us");
    assert_eq!(replies.len(), 1);
    assert!(
        replies[0].starts_with(&format!("{}: ", ASSISTANT)),
        "reply must carry the assistant prefix: {}",
        replies[0]
    );
    assert!(replies[0].contains("container reply"));

    // Both messages are consumed
    assert_eq!(
        stack.state.last_timestamp().await,
        "2026-02-01T10:00:01Z"
    );
}

/// Trigger embedded mid-word must not fire.
#[tokio::test]
async fn trigger_is_word_bounded() {
    let stack = TestStack::build(None).await;
    stack.store_inbound("m1", "@BhaviXYZ foo", "2026-02-01T10:00:00Z");
    stack.intake.poll_once().await.unwrap();
    assert_eq!(stack.run_count(), 0);
}

/// A failed container run keeps the high-water mark put and the same
/// message is retried on the next poll (at-least-once).
#[tokio::test]
async fn failed_run_is_retried_in_order() {
    let stack = TestStack::build(None).await;
    stack.set_runtime_script(&error_script(&stack.runs_log));

    stack.store_inbound("m1", "@Bhavi do the thing", "2026-02-01T10:00:00Z");
    stack.intake.poll_once().await.unwrap();
    assert_eq!(stack.run_count(), 1);
    // State did not advance past the failed message
    assert_eq!(stack.state.last_timestamp().await, "");
    // The chat got an error notice
    let replies = stack.transport.sent_to("fam@g.us");
    assert!(replies[0].starts_with(&format!("{}: Error:", ASSISTANT)));

    // Second poll retries the same message
    stack.intake.poll_once().await.unwrap();
    assert_eq!(stack.run_count(), 2);

    // Once the agent recovers, the message completes and state advances
    stack.set_runtime_script(&ok_script(&stack.runs_log, "recovered"));
    stack.intake.poll_once().await.unwrap();
    assert_eq!(stack.run_count(), 3);
    assert_eq!(
        stack.state.last_timestamp().await,
        "2026-02-01T10:00:00Z"
    );
}

/// A failure parks the whole batch: later messages wait behind the failing
/// one so per-chat ordering survives retries.
#[tokio::test]
async fn batch_stops_at_first_failure() {
    let stack = TestStack::build(None).await;
    stack.set_runtime_script(&error_script(&stack.runs_log));

    stack.store_inbound("m1", "@Bhavi first", "2026-02-01T10:00:00Z");
    stack.store_inbound("m2", "@Bhavi second", "2026-02-01T10:00:01Z");
    stack.intake.poll_once().await.unwrap();
    // Only the first message was attempted
    assert_eq!(stack.run_count(), 1);

    stack.set_runtime_script(&ok_script(&stack.runs_log, "ok"));
    stack.intake.poll_once().await.unwrap();
    // Both processed now, in order
    assert_eq!(stack.run_count(), 3);
    assert_eq!(
        stack.state.last_timestamp().await,
        "2026-02-01T10:00:01Z"
    );
}

/// Session ids returned by the agent are persisted and offered back.
#[tokio::test]
async fn session_rotates_across_runs() {
    let stack = TestStack::build(None).await;
    stack.store_inbound("m1", "@Bhavi hello", "2026-02-01T10:00:00Z");
    stack.intake.poll_once().await.unwrap();
    assert_eq!(
        stack.sessions.get("family").await.as_deref(),
        Some("sess-1")
    );
}

/// The assistant's own persisted replies never feed back into intake.
#[tokio::test]
async fn no_self_loop_on_replies() {
    let stack = TestStack::build(None).await;
    stack.store_inbound("m1", "@Bhavi hello", "2026-02-01T10:00:00Z");
    stack.intake.poll_once().await.unwrap();
    assert_eq!(stack.run_count(), 1);

    // The reply was stored as a message; further polls must not act on it
    stack.intake.poll_once().await.unwrap();
    stack.intake.poll_once().await.unwrap();
    assert_eq!(stack.run_count(), 1);
}
