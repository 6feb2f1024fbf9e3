//! End-to-end stream behaviour of the engine against in-memory transports.
//! Every test runs on tokio's paused clock, so backoff delays are exact.

use std::sync::Arc;
use std::time::Duration;

use beach_tide::engine::SyncEngine;
use beach_tide::queue::MemoryQueueStore;
use beach_tide::transport::mock::{ConnectOutcome, MockConnector, MockSessionApi};
use beach_tide::{ConnectionState, StreamStatus, SyncConfig, SyncEvent};
use tokio::sync::broadcast;
use tokio::time::sleep;

struct Fixture {
    engine: SyncEngine,
    api: Arc<MockSessionApi>,
    connector: Arc<MockConnector>,
}

fn fixture() -> Fixture {
    let api = Arc::new(MockSessionApi::new());
    let connector = Arc::new(MockConnector::new());
    let config = SyncConfig::new("localhost:8080")
        .expect("config")
        .with_token(Some("secret".into()));
    let engine = SyncEngine::new(
        config,
        api.clone(),
        connector.clone(),
        Arc::new(MemoryQueueStore::new()),
    )
    .expect("engine");
    engine.start();
    Fixture {
        engine,
        api,
        connector,
    }
}

fn drain(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn transitions(events: &[SyncEvent], session: &str) -> Vec<ConnectionState> {
    events
        .iter()
        .filter_map(|event| match event {
            SyncEvent::StateChanged { session: s, state } if s == session => Some(*state),
            _ => None,
        })
        .collect()
}

async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

#[test_timeout::tokio_timeout_test(10, start_paused)]
async fn session_opened_offline_waits_for_connectivity() {
    let f = fixture();
    let mut rx = f.engine.subscribe();
    f.engine.open_session("s1");
    sleep(Duration::from_secs(120)).await;

    assert_eq!(f.engine.state("s1"), ConnectionState::Disconnected);
    assert_eq!(f.engine.status("s1"), StreamStatus::Offline);
    assert_eq!(f.connector.attempts("s1"), 0);
    assert!(transitions(&drain(&mut rx), "s1").is_empty());

    f.engine.set_online(true);
    let _server = f.connector.next_connection().await;
    settle().await;

    assert_eq!(
        transitions(&drain(&mut rx), "s1"),
        [ConnectionState::Connecting, ConnectionState::Connected]
    );
    assert_eq!(f.connector.attempts("s1"), 1);
    assert_eq!(f.connector.credentials(), [Some("secret".to_string())]);
    assert_eq!(f.engine.status("s1"), StreamStatus::Live);
    f.engine.shutdown();
}

#[test_timeout::tokio_timeout_test(10, start_paused)]
async fn backoff_follows_policy() {
    let f = fixture();
    f.connector.refuse_all("s1", true);
    f.engine.set_online(true);
    f.engine.open_session("s1");
    f.connector.wait_for_attempts("s1", 6).await;

    let times = f.connector.attempt_times("s1");
    let gaps: Vec<u128> = times
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).as_millis())
        .collect();
    let expected = [900u128, 1350, 2025, 3038, 4556];
    for (gap, want) in gaps.iter().zip(expected) {
        assert!(gap.abs_diff(want) <= 2, "gaps {gaps:?}, expected {expected:?}");
    }
    assert_eq!(f.engine.status("s1"), StreamStatus::Reconnecting);
    f.engine.shutdown();
}

#[test_timeout::tokio_timeout_test(10, start_paused)]
async fn at_most_one_attempt_in_flight() {
    let f = fixture();
    f.connector.script(
        "s1",
        &[
            ConnectOutcome::Hang,
            ConnectOutcome::Refuse,
            ConnectOutcome::Hang,
        ],
    );
    f.engine.set_online(true);
    for _ in 0..5 {
        f.engine.open_session("s1");
        f.engine.set_open_sessions(["s1"]);
        f.engine.set_online(true);
    }
    let _server = f.connector.next_connection().await;
    settle().await;
    f.engine.open_session("s1");
    settle().await;

    assert_eq!(f.connector.attempts("s1"), 4);
    assert_eq!(f.connector.max_in_flight("s1"), 1);
    assert_eq!(f.engine.state("s1"), ConnectionState::Connected);
    f.engine.shutdown();
}

#[test_timeout::tokio_timeout_test(10, start_paused)]
async fn hide_cancels_pending_retry_for_good() {
    let f = fixture();
    f.connector.refuse_all("s1", true);
    f.engine.set_online(true);
    f.engine.open_session("s1");
    f.connector.wait_for_attempts("s1", 2).await;
    settle().await;

    f.engine.hide_session("s1");
    let mut rx = f.engine.subscribe();
    let attempts = f.connector.attempts("s1");
    sleep(Duration::from_secs(600)).await;

    assert_eq!(f.connector.attempts("s1"), attempts);
    assert!(transitions(&drain(&mut rx), "s1").is_empty());
    assert_eq!(f.engine.state("s1"), ConnectionState::Disconnected);
    f.engine.shutdown();
}

#[test_timeout::tokio_timeout_test(10, start_paused)]
async fn going_offline_cancels_retries() {
    let f = fixture();
    f.connector.refuse_all("s1", true);
    f.engine.set_online(true);
    f.engine.open_session("s1");
    f.connector.wait_for_attempts("s1", 1).await;
    settle().await;

    f.engine.set_online(false);
    sleep(Duration::from_secs(600)).await;
    assert_eq!(f.connector.attempts("s1"), 1);
    assert_eq!(f.engine.status("s1"), StreamStatus::Offline);
    assert_eq!(f.engine.open_sessions(), ["s1"]);
    f.engine.shutdown();
}

#[test_timeout::tokio_timeout_test(10, start_paused)]
async fn reconnect_snapshot_repairs_buffer() {
    let f = fixture();
    f.engine.set_online(true);
    f.engine.open_session("s1");

    let mut first = f.connector.next_connection().await;
    first.send_snapshot("$ make\n");
    first.send_delta("building...");
    settle().await;
    assert_eq!(f.engine.buffer("s1").as_deref(), Some("$ make\nbuilding..."));

    first.disconnect();
    settle().await;
    assert_eq!(f.engine.state("s1"), ConnectionState::Reconnecting);

    let second = f.connector.next_connection().await;
    second.send_snapshot("$ make\nbuilding...done\n");
    second.send_delta("$ ");
    settle().await;
    assert_eq!(
        f.engine.buffer("s1").as_deref(),
        Some("$ make\nbuilding...done\n$ ")
    );
    assert_eq!(f.engine.state("s1"), ConnectionState::Connected);
    f.engine.shutdown();
}

#[test_timeout::tokio_timeout_test(10, start_paused)]
async fn server_closure_is_terminal_and_reported_once() {
    let f = fixture();
    f.engine.set_online(true);
    f.engine.open_session("s1");
    f.engine.open_session("s2");
    let mut rx = f.engine.subscribe();

    let mut servers = vec![
        f.connector.next_connection().await,
        f.connector.next_connection().await,
    ];
    servers.sort_by(|a, b| a.session.cmp(&b.session));
    servers[0].send_snapshot("one");
    servers[1].send_snapshot("two");
    settle().await;

    servers[0].send_closed();
    sleep(Duration::from_secs(300)).await;

    let events = drain(&mut rx);
    let closed: Vec<_> = events
        .iter()
        .filter(|event| matches!(event, SyncEvent::SessionClosed { .. }))
        .collect();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].session(), "s1");
    assert_eq!(f.connector.attempts("s1"), 1);
    assert_eq!(f.engine.open_sessions(), ["s2"]);
    assert!(f.engine.buffer("s1").is_none());
    assert_eq!(f.engine.buffer("s2").as_deref(), Some("two"));
    assert_eq!(f.engine.state("s2"), ConnectionState::Connected);
    f.engine.shutdown();
}

#[test_timeout::tokio_timeout_test(10, start_paused)]
async fn polling_covers_sessions_until_stream_is_live() {
    let f = fixture();
    f.connector.refuse_all("s1", true);
    f.api.set_tail("s1", "from poll");
    f.engine.set_online(true);
    f.engine.open_session("s1");
    sleep(Duration::from_millis(2_500)).await;

    assert_eq!(f.engine.buffer("s1").as_deref(), Some("from poll"));
    assert!(f.api.tail_calls("s1") >= 2);

    f.connector.refuse_all("s1", false);
    let server = f.connector.next_connection().await;
    server.send_snapshot("from stream");
    settle().await;
    let calls = f.api.tail_calls("s1");

    sleep(Duration::from_secs(20)).await;
    assert_eq!(f.api.tail_calls("s1"), calls);
    assert_eq!(f.engine.buffer("s1").as_deref(), Some("from stream"));
    f.engine.shutdown();
}

#[test_timeout::tokio_timeout_test(10, start_paused)]
async fn stalled_session_does_not_delay_others() {
    let f = fixture();
    f.connector.script("slow", &[ConnectOutcome::Hang]);
    f.engine.set_online(true);
    f.engine.set_open_sessions(["slow", "fast"]);

    let fast = f.connector.next_connection().await;
    assert_eq!(fast.session, "fast");
    fast.send_snapshot("ready");
    settle().await;
    assert_eq!(f.engine.buffer("fast").as_deref(), Some("ready"));
    assert_eq!(f.engine.state("slow"), ConnectionState::Connecting);
    f.engine.shutdown();
}

#[test_timeout::tokio_timeout_test(10, start_paused)]
async fn watch_rules_fire_on_new_output() {
    let f = fixture();
    let mut rx = f.engine.subscribe();
    let rule = f.engine.add_watch(Some("s1"), "error", true).expect("rule");
    f.engine.set_online(true);
    f.engine.open_session("s1");

    let server = f.connector.next_connection().await;
    server.send_snapshot("compiling\n");
    settle().await;
    server.send_delta("ERROR: missing semicolon\n");
    settle().await;
    server.send_delta("still running\n");
    settle().await;

    let matches: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            SyncEvent::WatchMatched { rule, .. } => Some(rule),
            _ => None,
        })
        .collect();
    assert_eq!(matches, [rule]);
    f.engine.shutdown();
}
