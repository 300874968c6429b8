//! End-to-end engine tests against the simulated controller.

use std::sync::atomic::Ordering;
use std::time::Duration;

use grblink_core::demo::{DemoConfig, DemoController};
use grblink_core::jogtest::JogTestParams;
use grblink_core::link::{Link, LinkConfig, LinkEvent, LinkState};
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Wait for the first event matching the predicate, with a test-level
/// deadline so a hung session fails instead of blocking the suite.
async fn wait_for<F>(events: &mut broadcast::Receiver<LinkEvent>, mut pred: F) -> LinkEvent
where
    F: FnMut(&LinkEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event feed closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_ready(events: &mut broadcast::Receiver<LinkEvent>) {
    wait_for(events, |e| {
        matches!(e, LinkEvent::StateChanged(LinkState::Ready))
    })
    .await;
}

fn fast_config() -> LinkConfig {
    LinkConfig {
        heartbeat_interval: Duration::from_millis(20),
        jog_poll_interval: Duration::from_millis(10),
        connect_timeout: Duration::from_millis(500),
        ..LinkConfig::default()
    }
}

#[tokio::test]
async fn test_connect_validates_on_first_line() {
    let transport = DemoController::spawn(DemoConfig::default());
    let (link, mut events) = Link::connect(transport, fast_config());

    wait_ready(&mut events).await;
    let ready = wait_for(&mut events, |e| matches!(e, LinkEvent::SessionReady(_))).await;
    let LinkEvent::SessionReady(session) = ready else {
        unreachable!()
    };
    assert!(!session.id.is_nil());
    assert_eq!(link.state().await, LinkState::Ready);

    link.disconnect().await;
}

#[tokio::test]
async fn test_startup_events_survive_late_polling() {
    let transport = DemoController::spawn(DemoConfig::default());
    let (link, mut events) = Link::connect(transport, fast_config());

    // Let the session validate before this task ever polls the feed; the
    // receiver predates the session, so nothing is dropped.
    tokio::time::sleep(Duration::from_millis(50)).await;

    wait_for(&mut events, |e| {
        matches!(e, LinkEvent::StateChanged(LinkState::Connecting))
    })
    .await;
    wait_ready(&mut events).await;
    wait_for(&mut events, |e| matches!(e, LinkEvent::SessionReady(_))).await;

    link.disconnect().await;
}

#[tokio::test]
async fn test_banner_is_reported_unsolicited() {
    let transport = DemoController::spawn(DemoConfig::default());
    let (link, mut events) = Link::connect(transport, fast_config());

    let event = wait_for(&mut events, |e| matches!(e, LinkEvent::UnsolicitedLine(_))).await;
    let LinkEvent::UnsolicitedLine(text) = event else {
        unreachable!()
    };
    assert!(text.contains("GrblHAL"));

    link.disconnect().await;
}

#[tokio::test]
async fn test_mute_endpoint_fails_validation() {
    // A pipe with no one on the other end: opens fine, never speaks.
    let (client, _server) = tokio::io::duplex(64);
    let config = LinkConfig {
        connect_timeout: Duration::from_millis(100),
        ..fast_config()
    };
    let (_link, mut events) = Link::connect(client, config);

    let event = wait_for(&mut events, |e| matches!(e, LinkEvent::ConnectionError(_))).await;
    let LinkEvent::ConnectionError(reason) = event else {
        unreachable!()
    };
    assert!(reason.contains("connect timeout"), "reason: {reason}");
    wait_for(&mut events, |e| {
        matches!(e, LinkEvent::StateChanged(LinkState::Failed))
    })
    .await;
}

#[tokio::test]
async fn test_commands_rejected_while_connecting() {
    let (client, _server) = tokio::io::duplex(64);
    let (link, _events) = Link::connect(client, fast_config());
    let err = link.submit_command("G90").await.unwrap_err();
    assert!(matches!(
        err,
        grblink_core::protocol::LinkError::NotConnected
    ));
}

#[tokio::test]
async fn test_submitted_command_resolves_with_latency() {
    let transport = DemoController::spawn(DemoConfig::default());
    let (link, mut events) = Link::connect(transport, fast_config());
    wait_ready(&mut events).await;

    let id = link.submit_command("G90").await.unwrap();
    assert!(id > 0, "foreground commands use positive ids");

    let event = wait_for(&mut events, |e| {
        matches!(e, LinkEvent::CommandResolved { id: got, .. } if *got == id)
    })
    .await;
    let LinkEvent::CommandResolved { latency_ms, text, .. } = event else {
        unreachable!()
    };
    assert_eq!(text, "G90");
    assert!(latency_ms >= 0.0);

    link.disconnect().await;
}

#[tokio::test]
async fn test_invalid_jog_reports_command_failed() {
    let transport = DemoController::spawn(DemoConfig::default());
    let (link, mut events) = Link::connect(transport, fast_config());
    wait_ready(&mut events).await;

    // No X word: the demo controller rejects it like real firmware.
    let id = link.submit_command("$J=G91 G21 F500").await.unwrap();
    let event = wait_for(&mut events, |e| {
        matches!(e, LinkEvent::CommandFailed { id: got, .. } if *got == id)
    })
    .await;
    let LinkEvent::CommandFailed { code, .. } = event else {
        unreachable!()
    };
    assert_eq!(
        code,
        grblink_core::protocol::ErrorCode::Numeric(33)
    );

    link.disconnect().await;
}

#[tokio::test]
async fn test_heartbeat_feeds_status_and_metrics() {
    let transport = DemoController::spawn(DemoConfig::default());
    let (link, mut events) = Link::connect(transport, fast_config());

    // Several heartbeat rounds.
    for _ in 0..3 {
        wait_for(&mut events, |e| matches!(e, LinkEvent::Status(_))).await;
    }

    let snapshot = link.machine_state().await.unwrap().unwrap();
    assert_eq!(
        snapshot.state,
        grblink_core::protocol::MachineState::Idle
    );
    assert_eq!(snapshot.work_position, Some([0.0, 0.0, 0.0]));

    let metrics = link.current_metrics().await.unwrap();
    assert!(metrics.total_messages >= 3);
    assert!(metrics.average_latency_ms >= 0.0);

    link.disconnect().await;
}

#[tokio::test]
async fn test_jog_test_runs_to_deadline() {
    let transport = DemoController::spawn(DemoConfig {
        motion_time: Duration::from_millis(20),
        ..DemoConfig::default()
    });
    let (link, mut events) = Link::connect(transport, fast_config());
    wait_ready(&mut events).await;

    link.start_jog_test(JogTestParams {
        duration: Duration::from_millis(500),
        distance_mm: 2.0,
        feed_rate: 500.0,
    })
    .await
    .unwrap();

    // Starting again while running must fail.
    let err = link
        .start_jog_test(JogTestParams {
            duration: Duration::from_millis(500),
            distance_mm: 2.0,
            feed_rate: 500.0,
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        grblink_core::protocol::LinkError::JogTestAlreadyRunning
    ));

    let event = wait_for(&mut events, |e| matches!(e, LinkEvent::JogTestFinished(_))).await;
    let LinkEvent::JogTestFinished(report) = event else {
        unreachable!()
    };
    assert!(!report.cancelled);
    // 20 ms motion + 100 ms settle per cycle inside a 500 ms run: at least
    // two jogs complete.
    assert!(report.jog_count >= 2, "jog_count = {}", report.jog_count);
    assert!(!report.transitions.is_empty());
    assert!(report.average_jog_to_idle_ms > 0.0);
    assert!(report.max_jog_to_idle_ms >= report.average_jog_to_idle_ms);
    assert!(report.elapsed >= Duration::from_millis(500));

    link.disconnect().await;
}

#[tokio::test]
async fn test_jog_poller_replaces_heartbeat_until_finish() {
    let (transport, queries) = DemoController::spawn_counting(DemoConfig {
        motion_time: Duration::from_millis(20),
        ..DemoConfig::default()
    });
    // Heartbeat much faster than the jog poll, so heartbeat traffic leaking
    // into the run would be unmistakable in the query count.
    let config = LinkConfig {
        heartbeat_interval: Duration::from_millis(10),
        jog_poll_interval: Duration::from_millis(50),
        connect_timeout: Duration::from_millis(500),
        ..LinkConfig::default()
    };
    let (link, mut events) = Link::connect(transport, config);
    wait_ready(&mut events).await;

    link.start_jog_test(JogTestParams {
        duration: Duration::from_millis(300),
        distance_mm: 2.0,
        feed_rate: 500.0,
    })
    .await
    .unwrap();
    let at_start = queries.load(Ordering::Relaxed);

    wait_for(&mut events, |e| matches!(e, LinkEvent::JogTestFinished(_))).await;
    let during = queries.load(Ordering::Relaxed) - at_start;
    // 50 ms polling over a 300 ms run is ~6-7 queries; a 10 ms heartbeat
    // running alongside would have pushed this past 30.
    assert!((2..=12).contains(&during), "queries during run = {during}");

    // Heartbeat resumes once the run is over.
    let at_finish = queries.load(Ordering::Relaxed);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after = queries.load(Ordering::Relaxed);
    assert!(after > at_finish, "heartbeat did not resume after the run");

    link.disconnect().await;
}

#[tokio::test]
async fn test_stop_jog_test_reports_partial_cancelled() {
    let transport = DemoController::spawn(DemoConfig {
        motion_time: Duration::from_millis(20),
        ..DemoConfig::default()
    });
    let (link, mut events) = Link::connect(transport, fast_config());
    wait_ready(&mut events).await;

    link.start_jog_test(JogTestParams {
        duration: Duration::from_secs(60),
        distance_mm: 2.0,
        feed_rate: 500.0,
    })
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    link.stop_jog_test().await.unwrap();

    let event = wait_for(&mut events, |e| matches!(e, LinkEvent::JogTestFinished(_))).await;
    let LinkEvent::JogTestFinished(report) = event else {
        unreachable!()
    };
    assert!(report.cancelled);
    assert!(report.jog_count >= 1);

    // Stopping with nothing running is an error.
    let err = link.stop_jog_test().await.unwrap_err();
    assert!(matches!(
        err,
        grblink_core::protocol::LinkError::JogTestNotRunning
    ));

    link.disconnect().await;
}

#[tokio::test]
async fn test_remote_close_tears_down() {
    let (client, server) = tokio::io::duplex(256);
    let (link, mut events) = Link::connect(client, fast_config());

    // Speak one line so the link validates, then hang up.
    {
        use tokio::io::AsyncWriteExt;
        let mut server = server;
        server.write_all(b"Grbl 1.1h ['$' for help]\r\n").await.unwrap();
        wait_ready(&mut events).await;
        server.shutdown().await.unwrap();
        drop(server);
    }

    // Either the read half reports EOF or a heartbeat write hits the broken
    // pipe first; both end the session with an error and a clean teardown.
    wait_for(&mut events, |e| matches!(e, LinkEvent::ConnectionError(_))).await;
    wait_for(&mut events, |e| {
        matches!(e, LinkEvent::StateChanged(LinkState::Disconnected))
    })
    .await;

    // The handle degrades gracefully once the session is gone.
    assert_eq!(link.state().await, LinkState::Disconnected);
    assert!(link.submit_command("G90").await.is_err());
}

#[tokio::test]
async fn test_disconnect_is_clean_and_final() {
    let transport = DemoController::spawn(DemoConfig::default());
    let (link, mut events) = Link::connect(transport, fast_config());
    wait_ready(&mut events).await;

    link.disconnect().await;
    wait_for(&mut events, |e| {
        matches!(e, LinkEvent::StateChanged(LinkState::Disconnected))
    })
    .await;
    assert_eq!(link.state().await, LinkState::Disconnected);
}
