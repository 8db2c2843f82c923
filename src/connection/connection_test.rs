use super::*;
use crate::event::EventKind;
use crate::test_helpers::{ClientFrame, MemoryServer, MemoryTransport, eventually, wait_for};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Harness {
    manager: ConnectionManager,
    router: Arc<EventRouter>,
    telemetry: Arc<Telemetry>,
    transport: Arc<MemoryTransport>,
    server: MemoryServer,
}

fn harness() -> Harness {
    harness_with(&ConnectionConfig::default())
}

fn harness_with(config: &ConnectionConfig) -> Harness {
    let (transport, server) = MemoryTransport::new();
    let telemetry = Arc::new(Telemetry::new());
    let router = Arc::new(EventRouter::new(Arc::clone(&telemetry)));
    let manager = ConnectionManager::spawn(
        "board-1",
        "ws://memory/api/board/board-1/ws?token=t".to_owned(),
        config,
        transport.clone(),
        Arc::clone(&router),
        Arc::clone(&telemetry),
    );
    Harness {
        manager,
        router,
        telemetry,
        transport,
        server,
    }
}

fn seq_of(envelope: &Envelope) -> u64 {
    envelope.data["seq"].as_u64().expect("seq")
}

// =============================================================================
// STATE MACHINE
// =============================================================================

#[tokio::test(start_paused = true)]
async fn connect_reports_connecting_then_connected() {
    let mut h = harness();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _sub = {
        let seen = Arc::clone(&seen);
        h.manager
            .on_status_change(move |s| seen.lock().unwrap().push(*s))
    };

    h.manager.connect().unwrap();
    let _peer = h.server.accept().await;
    wait_for(&h.manager, ConnectionState::Connected).await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );
}

#[tokio::test(start_paused = true)]
async fn connect_is_idempotent_while_connected() {
    let mut h = harness();
    h.manager.connect().unwrap();
    let _peer = h.server.accept().await;
    wait_for(&h.manager, ConnectionState::Connected).await;

    let changes = Arc::new(AtomicUsize::new(0));
    let _sub = {
        let changes = Arc::clone(&changes);
        h.manager.on_status_change(move |_| {
            changes.fetch_add(1, Ordering::SeqCst);
        })
    };

    h.manager.connect().unwrap();
    h.manager.connect().unwrap();
    // A send round-trip proves the driver processed both connects.
    h.manager.send("task:updated", json!({"seq": 0})).await.unwrap();

    assert_eq!(h.transport.opens(), 1);
    assert_eq!(changes.load(Ordering::SeqCst), 0);
    assert_eq!(h.manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn unclean_close_retries_with_doubling_delays_then_errors() {
    let mut h = harness();
    h.manager.connect().unwrap();
    let peer = h.server.accept().await;
    wait_for(&h.manager, ConnectionState::Connected).await;

    h.transport.set_accept(false);
    let closed_at = Instant::now();
    drop(peer);
    wait_for(&h.manager, ConnectionState::Error).await;

    let opens = h.transport.open_times();
    assert_eq!(opens.len(), 6, "initial handshake plus five reconnect attempts");

    let mut delays = vec![opens[1] - closed_at];
    delays.extend(opens[1..].windows(2).map(|w| w[1] - w[0]));
    let expected: Vec<Duration> = [1, 2, 4, 8, 16].into_iter().map(Duration::from_secs).collect();
    assert_eq!(delays, expected);
    assert_eq!(h.telemetry.snapshot().reconnects, 5);
}

#[tokio::test(start_paused = true)]
async fn manual_connect_after_error_resets_attempt_counter() {
    let mut h = harness();
    h.transport.set_accept(false);
    h.manager.connect().unwrap();
    wait_for(&h.manager, ConnectionState::Error).await;
    assert_eq!(h.transport.opens(), 6);

    let restarted_at = Instant::now();
    h.manager.connect().unwrap();
    wait_for(&h.manager, ConnectionState::Reconnecting).await;
    wait_for(&h.manager, ConnectionState::Error).await;

    let opens = h.transport.open_times();
    assert_eq!(opens.len(), 12, "a fresh budget of five retries");
    assert_eq!(opens[6], restarted_at);
    assert_eq!(opens[7] - opens[6], Duration::from_secs(1));

    h.transport.set_accept(true);
    h.manager.connect().unwrap();
    let _peer = h.server.accept().await;
    wait_for(&h.manager, ConnectionState::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn successful_reconnect_resets_attempts() {
    let mut h = harness();
    h.manager.connect().unwrap();
    let peer = h.server.accept().await;
    wait_for(&h.manager, ConnectionState::Connected).await;

    h.transport.refuse_next(2);
    drop(peer);
    let peer = h.server.accept().await;
    wait_for(&h.manager, ConnectionState::Connected).await;
    assert_eq!(h.transport.opens(), 4);

    // A second outage starts again from the base delay.
    let closed_at = Instant::now();
    drop(peer);
    let _peer = h.server.accept().await;
    let opens = h.transport.open_times();
    assert_eq!(opens[4] - closed_at, Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn send_in_error_state_rejects_immediately() {
    let h = harness();
    h.transport.set_accept(false);
    h.manager.connect().unwrap();
    wait_for(&h.manager, ConnectionState::Error).await;

    let err = h
        .manager
        .send("task:updated", json!({"id": "T1"}))
        .await
        .expect_err("terminal state should reject");
    assert!(matches!(err, SyncError::ConnectionClosed));
}

#[tokio::test(start_paused = true)]
async fn queued_messages_are_dropped_when_attempts_run_out() {
    let h = harness();
    h.transport.set_accept(false);
    h.manager.send("task:updated", json!({"seq": 1})).await.unwrap();
    h.manager.send("task:updated", json!({"seq": 2})).await.unwrap();
    h.manager.connect().unwrap();
    wait_for(&h.manager, ConnectionState::Error).await;

    let snap = h.telemetry.snapshot();
    assert_eq!(snap.dropped, 2);
    assert_eq!(snap.queue_len, 0);
}

#[tokio::test(start_paused = true)]
async fn disconnect_sends_clean_close_and_lands_disconnected() {
    let mut h = harness();
    h.manager.connect().unwrap();
    let mut peer = h.server.accept().await;
    wait_for(&h.manager, ConnectionState::Connected).await;

    h.manager.disconnect().await.unwrap();

    assert_eq!(peer.close_code().await, Some(transport::CLOSE_NORMAL));
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.transport.opens(), 1, "clean close never reconnects");
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_backoff_cancels_reconnect() {
    let mut h = harness();
    h.manager.connect().unwrap();
    let peer = h.server.accept().await;
    wait_for(&h.manager, ConnectionState::Connected).await;

    drop(peer);
    wait_for(&h.manager, ConnectionState::Reconnecting).await;
    h.manager.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    assert_eq!(h.transport.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn server_normal_close_does_not_reconnect() {
    let mut h = harness();
    h.manager.connect().unwrap();
    let peer = h.server.accept().await;
    wait_for(&h.manager, ConnectionState::Connected).await;

    peer.close(transport::CLOSE_NORMAL);
    wait_for(&h.manager, ConnectionState::Disconnected).await;
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(h.transport.opens(), 1);
    assert_eq!(h.manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn server_abnormal_close_code_reconnects() {
    let mut h = harness();
    h.manager.connect().unwrap();
    let peer = h.server.accept().await;
    wait_for(&h.manager, ConnectionState::Connected).await;

    peer.close(1011);
    let _peer = h.server.accept().await;
    wait_for(&h.manager, ConnectionState::Connected).await;
    assert_eq!(h.transport.opens(), 2);
}

// =============================================================================
// OUTBOUND ORDERING
// =============================================================================

#[tokio::test(start_paused = true)]
async fn sends_over_rate_limit_arrive_in_order_one_window_apart() {
    let mut h = harness();
    h.manager.connect().unwrap();
    let mut peer = h.server.accept().await;
    wait_for(&h.manager, ConnectionState::Connected).await;

    let start = Instant::now();
    for seq in 0..120_u64 {
        h.manager
            .send("task:updated", json!({"seq": seq}))
            .await
            .unwrap();
    }

    let mut arrivals = Vec::new();
    for _ in 0..120 {
        let envelope = peer.next_envelope().await.expect("message");
        arrivals.push((seq_of(&envelope), Instant::now()));
    }

    let order: Vec<u64> = arrivals.iter().map(|(seq, _)| *seq).collect();
    assert_eq!(order, (0..120).collect::<Vec<_>>());
    assert!(arrivals[..50].iter().all(|(_, at)| *at == start));
    assert_eq!(arrivals[50].1, start + Duration::from_secs(1));
    assert_eq!(arrivals[100].1, start + Duration::from_secs(2));
    assert_eq!(h.telemetry.snapshot().queue_len, 0);
}

#[tokio::test(start_paused = true)]
async fn messages_sent_before_connect_flush_in_order() {
    let mut h = harness();
    for seq in 0..3_u64 {
        h.manager.send("task:updated", json!({"seq": seq})).await.unwrap();
    }
    assert_eq!(h.telemetry.snapshot().queue_len, 3);

    h.manager.connect().unwrap();
    let mut peer = h.server.accept().await;

    for expected in 0..3_u64 {
        assert_eq!(seq_of(&peer.next_envelope().await.unwrap()), expected);
    }
}

#[tokio::test(start_paused = true)]
async fn messages_sent_while_reconnecting_are_delivered_after_reconnect() {
    let mut h = harness();
    h.manager.connect().unwrap();
    let peer = h.server.accept().await;
    wait_for(&h.manager, ConnectionState::Connected).await;

    drop(peer);
    wait_for(&h.manager, ConnectionState::Reconnecting).await;
    h.manager.send("task:updated", json!({"seq": 1})).await.unwrap();
    h.manager.send("task:updated", json!({"seq": 2})).await.unwrap();

    let mut peer = h.server.accept().await;
    assert_eq!(seq_of(&peer.next_envelope().await.unwrap()), 1);
    assert_eq!(seq_of(&peer.next_envelope().await.unwrap()), 2);
}

#[tokio::test(start_paused = true)]
async fn protobuf_format_sends_binary_frames() {
    let config = ConnectionConfig {
        wire_format: WireFormat::Protobuf,
        ..ConnectionConfig::default()
    };
    let mut h = harness_with(&config);
    h.manager.connect().unwrap();
    let mut peer = h.server.accept().await;

    h.manager.send("column:created", json!({"id": "C1"})).await.unwrap();

    let Some(ClientFrame::Message(frames::WireMessage::Binary(bytes))) = peer.next_frame().await
    else {
        panic!("expected a binary frame");
    };
    let envelope = frames::decode_binary(&bytes).unwrap();
    assert_eq!(envelope.kind, "column:created");
}

// =============================================================================
// HEARTBEAT AND INBOUND
// =============================================================================

#[tokio::test(start_paused = true)]
async fn heartbeat_pong_records_round_trip() {
    let mut h = harness();
    h.manager.connect().unwrap();
    let mut peer = h.server.accept().await;
    wait_for(&h.manager, ConnectionState::Connected).await;

    let connected_at = Instant::now();
    let Some(ClientFrame::Message(message)) = peer.next_frame().await else {
        panic!("expected heartbeat");
    };
    assert_eq!(Instant::now() - connected_at, Duration::from_secs(30));
    let ping = frames::decode(&message).unwrap();
    assert_eq!(ping.kind, "ping");

    tokio::time::sleep(Duration::from_millis(40)).await;
    peer.push(&Envelope::new("pong", ping.data.clone()));

    let telemetry = Arc::clone(&h.telemetry);
    eventually(move || telemetry.snapshot().latency.count == 1).await;
    let latency = h.telemetry.snapshot().latency;
    assert!((latency.avg_ms - 40.0).abs() < 1e-6, "rtt was {}", latency.avg_ms);
}

#[tokio::test(start_paused = true)]
async fn inbound_ping_is_answered_with_pong() {
    let mut h = harness();
    h.manager.connect().unwrap();
    let mut peer = h.server.accept().await;

    peer.push(&Envelope::new("ping", json!({"seq": 9})));

    let pong = peer.next_envelope().await.unwrap();
    assert_eq!(pong.kind, "pong");
    assert_eq!(pong.data, json!({"seq": 9}));
}

#[tokio::test(start_paused = true)]
async fn inbound_events_reach_router_handlers() {
    let mut h = harness();
    let count = Arc::new(AtomicUsize::new(0));
    let _sub = {
        let count = Arc::clone(&count);
        h.router.on(EventKind::TaskCreated, move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };
    h.manager.connect().unwrap();
    let peer = h.server.accept().await;

    peer.push(&Envelope::new("task:created", json!({"id": "T1"})));
    peer.push_raw(frames::WireMessage::Text("garbage".to_owned()));
    peer.push(&Envelope::new("task:created", json!({"id": "T2"})));

    let seen = Arc::clone(&count);
    eventually(move || seen.load(Ordering::SeqCst) == 2).await;
    assert_eq!(h.telemetry.snapshot().invalid_inbound, 1);
    assert_eq!(h.manager.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn dropping_handle_stops_driver() {
    let mut h = harness();
    h.manager.connect().unwrap();
    let mut peer = h.server.accept().await;
    drop(h.manager);

    // The link is dropped with the driver, so the peer sees the stream end.
    assert_eq!(peer.next_frame().await, None);
}
