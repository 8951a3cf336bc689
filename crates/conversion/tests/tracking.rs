//! End-to-end tracking tests against the in-memory bus.
//!
//! Covers the progress, completion, and error scenarios, subscription
//! uniqueness, terminal teardown, identifier switching, and progress
//! monotonicity.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bitzomax_bus::testing::MemoryBus;
use bitzomax_bus::Delivery;
use bitzomax_conversion::SessionState;
use bitzomax_core::naming::conversion_topic;

use common::{processing, settle, tracker_with, Call, Recorder};

// ---------------------------------------------------------------------------
// Test: a processing event reaches on_progress once
// ---------------------------------------------------------------------------

#[tokio::test]
async fn processing_event_reports_progress() {
    let bus = MemoryBus::new();
    let tracker = tracker_with(&bus);
    let recorder = Recorder::new();

    let handle = tracker.track("job-1", recorder.callbacks()).await;
    assert_eq!(handle.state(), SessionState::Tracking);

    let body = r#"{"percentComplete":50,"status":"processing","message":"halfway"}"#;
    assert_eq!(bus.publish("/topic/conversion/job-1", body), 1);
    settle().await;

    assert_eq!(recorder.calls(), vec![Call::Progress(50, "halfway".into())]);
}

// ---------------------------------------------------------------------------
// Test: completion reports 100 then the result file, and unsubscribes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn complete_event_finishes_session() {
    let bus = MemoryBus::new();
    let tracker = tracker_with(&bus);
    let recorder = Recorder::new();

    let handle = tracker.track("job-1", recorder.callbacks()).await;

    let body = r#"{"status":"complete","resultFile":"out.webm","message":"done"}"#;
    assert_eq!(bus.publish("/topic/conversion/job-1", body), 1);
    settle().await;

    assert_eq!(
        recorder.calls(),
        vec![
            Call::Progress(100, "done".into()),
            Call::Complete("out.webm".into()),
        ]
    );
    assert_eq!(handle.state(), SessionState::Completed);
    assert!(!tracker.manager().registry().contains("job-1"));
    assert!(bus.subscribed_topics().is_empty());
    assert!(!tracker.is_tracking("job-1"));
}

// ---------------------------------------------------------------------------
// Test: an error event reports once and stops delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn error_event_finishes_session() {
    let bus = MemoryBus::new();
    let tracker = tracker_with(&bus);
    let recorder = Recorder::new();

    let handle = tracker.track("job-1", recorder.callbacks()).await;
    assert_eq!(tracker.manager().registry().job_ids(), vec!["job-1"]);

    bus.publish(
        "/topic/conversion/job-1",
        r#"{"status":"error","message":"bad codec"}"#,
    );
    settle().await;

    assert_eq!(bus.publish("/topic/conversion/job-1", &processing(80, "late")), 0);
    settle().await;

    assert_eq!(recorder.calls(), vec![Call::Error("bad codec".into())]);
    assert_eq!(handle.state(), SessionState::Error);
}

// ---------------------------------------------------------------------------
// Test: late or duplicate deliveries after completion are ignored
// ---------------------------------------------------------------------------

#[tokio::test]
async fn late_delivery_after_completion_is_ignored() {
    let bus = MemoryBus::new();
    let tracker = tracker_with(&bus);
    let recorder = Recorder::new();

    tracker.track("job-1", recorder.callbacks()).await;
    let topic = conversion_topic("job-1");
    // First subscription on a fresh registry.
    let subscription_id = "sub-0";
    assert!(tracker.manager().registry().contains("job-1"));

    bus.publish(&topic, r#"{"status":"complete","resultFile":"a.webm"}"#);
    settle().await;

    // Frames already in flight under the old subscription id.
    assert!(bus.deliver_raw(subscription_id, &topic, &processing(20, "stale")));
    assert!(bus.deliver_raw(
        subscription_id,
        &topic,
        r#"{"status":"complete","resultFile":"a.webm"}"#
    ));
    settle().await;

    assert_eq!(
        recorder.calls(),
        vec![
            Call::Progress(100, "Conversion complete".into()),
            Call::Complete("a.webm".into()),
        ]
    );
}

// ---------------------------------------------------------------------------
// Test: re-subscribing the same job id keeps exactly one live subscription
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscribing_twice_leaves_one_live_subscription() {
    let bus = MemoryBus::new();
    let tracker = tracker_with(&bus);
    let registry = Arc::clone(tracker.manager().registry());
    assert!(tracker.manager().connect(None).await);

    let first = registry
        .subscribe("job-1", Arc::new(|_: &str| Delivery::Continue))
        .unwrap();
    let second = registry
        .subscribe("job-1", Arc::new(|_: &str| Delivery::Continue))
        .unwrap();

    assert!(!first.is_live());
    assert!(second.is_live());
    assert_eq!(registry.len(), 1);
    assert_eq!(bus.subscribed_topics(), vec![conversion_topic("job-1")]);
}

// ---------------------------------------------------------------------------
// Test: tracking the same job twice replaces the first session
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tracking_twice_replaces_first_session() {
    let bus = MemoryBus::new();
    let tracker = tracker_with(&bus);
    let first = Recorder::new();
    let second = Recorder::new();

    let first_handle = tracker.track("job-1", first.callbacks()).await;
    let second_handle = tracker.track("job-1", second.callbacks()).await;

    assert_eq!(first_handle.state(), SessionState::Cancelled);
    assert_eq!(second_handle.state(), SessionState::Tracking);

    assert_eq!(bus.publish("/topic/conversion/job-1", &processing(30, "x")), 1);
    settle().await;

    assert!(first.calls().is_empty());
    assert_eq!(second.calls(), vec![Call::Progress(30, "x".into())]);

    // Cancelling the stale handle must not kill the live session.
    first_handle.cancel();
    assert!(tracker.is_tracking("job-1"));
}

// ---------------------------------------------------------------------------
// Test: switching ids delivers on the new topic and not on the old one
// ---------------------------------------------------------------------------

#[tokio::test]
async fn switch_identifier_follows_server_id() {
    let bus = MemoryBus::new();
    let tracker = tracker_with(&bus);
    let recorder = Recorder::new();

    let handle = tracker.track("tmp-7", recorder.callbacks()).await;
    assert_eq!(tracker.manager().registry().job_ids(), vec!["tmp-7"]);

    tracker.switch_identifier("tmp-7", "srv-42").unwrap();
    assert_eq!(handle.job_id(), "srv-42");

    assert_eq!(bus.publish("/topic/conversion/srv-42", &processing(40, "real")), 1);
    settle().await;
    assert_eq!(recorder.calls(), vec![Call::Progress(40, "real".into())]);

    assert_eq!(bus.publish("/topic/conversion/tmp-7", &processing(90, "stale")), 0);
    // Even a frame already in flight under the old subscription id is dropped.
    assert!(bus.deliver_raw("sub-0", "/topic/conversion/tmp-7", &processing(90, "stale")));
    settle().await;

    assert_eq!(recorder.calls(), vec![Call::Progress(40, "real".into())]);
}

// ---------------------------------------------------------------------------
// Test: a switched session still completes and tears down
// ---------------------------------------------------------------------------

#[tokio::test]
async fn switched_session_completes() {
    let bus = MemoryBus::new();
    let tracker = tracker_with(&bus);
    let recorder = Recorder::new();

    let handle = tracker.track("tmp-7", recorder.callbacks()).await;
    tracker.switch_identifier("tmp-7", "srv-42").unwrap();

    bus.publish(
        "/topic/conversion/srv-42",
        r#"{"status":"complete","resultFile":"srv-42.webm","message":"done"}"#,
    );
    settle().await;

    assert_eq!(handle.state(), SessionState::Completed);
    assert_eq!(recorder.calls().last(), Some(&Call::Complete("srv-42.webm".into())));
    assert!(tracker.manager().registry().is_empty());
    assert!(tracker.active_jobs().is_empty());
}

// ---------------------------------------------------------------------------
// Test: progress never goes backwards within a session
// ---------------------------------------------------------------------------

#[tokio::test]
async fn progress_is_monotonic_across_switch() {
    let bus = MemoryBus::new();
    let tracker = tracker_with(&bus);
    let recorder = Recorder::new();

    tracker.track("tmp-1", recorder.callbacks()).await;
    for (percent, message) in [(10, "a"), (35, "b"), (20, "c")] {
        bus.publish("/topic/conversion/tmp-1", &processing(percent, message));
    }
    settle().await;

    tracker.switch_identifier("tmp-1", "srv-1").unwrap();
    for (percent, message) in [(5, "d"), (60, "e")] {
        bus.publish("/topic/conversion/srv-1", &processing(percent, message));
    }
    settle().await;

    let progress = recorder.progress();
    assert_eq!(progress, vec![10, 35, 35, 35, 60]);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
}

// ---------------------------------------------------------------------------
// Test: a new session for a new job starts from zero
// ---------------------------------------------------------------------------

#[tokio::test]
async fn new_session_restarts_progress() {
    let bus = MemoryBus::new();
    let tracker = tracker_with(&bus);
    let first = Recorder::new();
    let second = Recorder::new();

    let handle = tracker.track("job-a", first.callbacks()).await;
    bus.publish("/topic/conversion/job-a", &processing(70, "a"));
    settle().await;
    handle.cancel();

    tracker.track("job-b", second.callbacks()).await;
    bus.publish("/topic/conversion/job-b", &processing(5, "b"));
    settle().await;

    assert_eq!(first.progress(), vec![70]);
    assert_eq!(second.progress(), vec![5]);
}

// ---------------------------------------------------------------------------
// Test: malformed payloads are reported without ending the session
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_payload_is_not_terminal() {
    let bus = MemoryBus::new();
    let tracker = tracker_with(&bus);
    let recorder = Recorder::new();

    let handle = tracker.track("job-1", recorder.callbacks()).await;
    bus.publish("/topic/conversion/job-1", "not json");
    bus.publish("/topic/conversion/job-1", r#"{"status":"rewinding"}"#);
    bus.publish("/topic/conversion/job-1", r#"{"status":"complete","message":"done"}"#);
    bus.publish("/topic/conversion/job-1", &processing(55, "still going"));
    settle().await;

    let calls = recorder.calls();
    assert_eq!(calls.len(), 4);
    assert!(matches!(&calls[0], Call::Error(m) if m.starts_with("Error parsing server response")));
    assert!(matches!(&calls[1], Call::Error(m) if m.contains("rewinding")));
    assert!(matches!(&calls[2], Call::Error(_)));
    assert_eq!(calls[3], Call::Progress(55, "still going".into()));
    assert_eq!(handle.state(), SessionState::Tracking);
}

// ---------------------------------------------------------------------------
// Test: cancelled sessions ignore in-flight messages
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_ignores_in_flight_messages() {
    let bus = MemoryBus::new();
    let tracker = tracker_with(&bus);
    let recorder = Recorder::new();

    let handle = tracker.track("job-1", recorder.callbacks()).await;
    handle.cancel();

    assert!(bus.deliver_raw("sub-0", "/topic/conversion/job-1", &processing(10, "late")));
    assert_eq!(bus.publish("/topic/conversion/job-1", &processing(20, "later")), 0);
    settle().await;

    assert!(recorder.calls().is_empty());
    assert_eq!(handle.state(), SessionState::Cancelled);
}

// ---------------------------------------------------------------------------
// Test: tracking waits for an in-flight connection
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn concurrent_tracks_share_one_connection() {
    let bus = MemoryBus::new();
    bus.set_connect_delay(Some(Duration::from_millis(300)));
    let tracker = tracker_with(&bus);
    let a = Recorder::new();
    let b = Recorder::new();

    let (ha, hb) = tokio::join!(
        tracker.track("job-a", a.callbacks()),
        tracker.track("job-b", b.callbacks()),
    );

    assert_eq!(bus.connect_count(), 1);
    assert_eq!(ha.state(), SessionState::Tracking);
    assert_eq!(hb.state(), SessionState::Tracking);
    assert_eq!(tracker.active_jobs(), vec!["job-a", "job-b"]);
}

// ---------------------------------------------------------------------------
// Test: sessions keep receiving after the link is restored
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn tracking_survives_reconnect() {
    let bus = MemoryBus::new();
    let tracker = tracker_with(&bus);
    let recorder = Recorder::new();

    tracker.track("job-1", recorder.callbacks()).await;
    assert!(bus.drop_link());
    settle().await;
    assert!(!tracker.manager().is_connected());

    tokio::time::sleep(Duration::from_secs(3)).await;
    settle().await;
    assert!(tracker.manager().is_connected());

    assert_eq!(bus.publish("/topic/conversion/job-1", &processing(15, "back")), 1);
    settle().await;
    assert_eq!(recorder.calls(), vec![Call::Progress(15, "back".into())]);
}

// ---------------------------------------------------------------------------
// Test: disconnect is global across sessions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disconnect_drops_every_session_subscription() {
    let bus = MemoryBus::new();
    let tracker = tracker_with(&bus);
    let a = Recorder::new();
    let b = Recorder::new();

    let handle = tracker.track("job-a", a.callbacks()).await;
    tracker.track("job-b", b.callbacks()).await;

    tracker.manager().disconnect();

    assert!(!tracker.is_tracking("job-a"));
    assert!(!tracker.is_tracking("job-b"));
    assert!(tracker.active_jobs().is_empty());
    assert!(!handle.is_active());
    assert!(tracker.manager().registry().is_empty());
    assert!(!bus.has_link());

    // Reconnecting does not bring the dropped sessions back.
    assert!(tracker.manager().connect(None).await);
    assert!(bus.subscribed_topics().is_empty());
    assert!(tracker.active_jobs().is_empty());

    tracker.track("job-c", Recorder::new().callbacks()).await;
    assert_eq!(tracker.active_jobs(), vec!["job-c"]);
}

// ---------------------------------------------------------------------------
// Test: tracker disconnect cancels its sessions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tracker_disconnect_cancels_sessions() {
    let bus = MemoryBus::new();
    let tracker = tracker_with(&bus);
    let recorder = Recorder::new();

    let handle = tracker.track("job-a", recorder.callbacks()).await;
    tracker.disconnect();

    assert_eq!(handle.state(), SessionState::Cancelled);
    assert!(!handle.is_active());
    assert!(tracker.active_jobs().is_empty());
    assert!(!tracker.manager().is_connected());
    assert!(recorder.calls().is_empty());
}

// ---------------------------------------------------------------------------
// Test: cancel_all reaches sessions still waiting for the connection
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cancel_all_while_connecting() {
    let bus = MemoryBus::new();
    bus.set_connect_delay(Some(Duration::from_secs(1)));
    let tracker = tracker_with(&bus);
    let recorder = Recorder::new();

    let pending = {
        let tracker = tracker.clone();
        let callbacks = recorder.callbacks();
        tokio::spawn(async move { tracker.track("job-1", callbacks).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(tracker.manager().is_connecting());

    tracker.cancel_all();
    let handle = pending.await.unwrap();

    assert_eq!(handle.state(), SessionState::Cancelled);
    assert!(tracker.manager().is_connected());
    assert!(bus.subscribed_topics().is_empty());
    assert!(tracker.active_jobs().is_empty());
    assert!(recorder.calls().is_empty());
}
