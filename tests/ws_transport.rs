//! End-to-end checks of the WebSocket transport against an in-process axum
//! board socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response;
use axum::routing::get;
use boardsync::event::BoardEvent;
use boardsync::{
    BoardSession, ConnectionState, EventKind, LocalUser, SessionDeps, SessionKey, SyncConfig,
};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

// =============================================================================
// TEST SERVER
// =============================================================================

enum ServerCmd {
    Send(Value),
    Close(u16),
}

#[derive(Debug)]
enum Seen {
    Text(Value),
    Closed(Option<u16>),
}

/// One accepted socket, as seen from the server side.
struct Conn {
    board_id: String,
    token: Option<String>,
    commands: mpsc::UnboundedSender<ServerCmd>,
    seen: mpsc::UnboundedReceiver<Seen>,
}

impl Conn {
    fn push(&self, kind: &str, data: Value) {
        let _ = self
            .commands
            .send(ServerCmd::Send(json!({ "type": kind, "data": data })));
    }

    fn close(&self, code: u16) {
        let _ = self.commands.send(ServerCmd::Close(code));
    }

    /// Next client frame that is not heartbeat traffic.
    async fn next(&mut self) -> Seen {
        loop {
            let seen = timeout(WAIT, self.seen.recv())
                .await
                .expect("timed out waiting for client frame")
                .expect("connection task ended");
            if let Seen::Text(value) = &seen {
                if value["type"] == "ping" || value["type"] == "pong" {
                    continue;
                }
            }
            return seen;
        }
    }
}

#[derive(Clone)]
struct ServerState {
    accepted: mpsc::UnboundedSender<Conn>,
}

struct TestServer {
    base_url: String,
    accepted: mpsc::UnboundedReceiver<Conn>,
}

impl TestServer {
    async fn start() -> Self {
        let (accepted_tx, accepted) = mpsc::unbounded_channel();
        let app = Router::new()
            .route("/api/board/{board_id}/ws", get(handle_ws))
            .with_state(ServerState {
                accepted: accepted_tx,
            });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            base_url: format!("http://{addr}"),
            accepted,
        }
    }

    async fn accept(&mut self) -> Conn {
        timeout(WAIT, self.accepted.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("server stopped")
    }
}

async fn handle_ws(
    State(state): State<ServerState>,
    Path(board_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params.get("token").cloned();
    ws.on_upgrade(move |socket| run_socket(socket, state, board_id, token))
}

async fn run_socket(mut socket: WebSocket, state: ServerState, board_id: String, token: Option<String>) {
    let (commands, mut command_rx) = mpsc::unbounded_channel();
    let (seen_tx, seen) = mpsc::unbounded_channel();
    let _ = state.accepted.send(Conn {
        board_id,
        token,
        commands,
        seen,
    });

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        let Ok(value) = serde_json::from_str::<Value>(text.as_str()) else { continue };
                        if value["type"] == "ping" {
                            let pong = json!({ "type": "pong", "data": value["data"].clone() });
                            let _ = socket.send(Message::Text(pong.to_string().into())).await;
                        }
                        let _ = seen_tx.send(Seen::Text(value));
                    }
                    Message::Close(frame) => {
                        let _ = seen_tx.send(Seen::Closed(frame.map(|f| f.code)));
                        break;
                    }
                    _ => {}
                }
            }
            Some(cmd) = command_rx.recv() => match cmd {
                ServerCmd::Send(value) => {
                    if socket.send(Message::Text(value.to_string().into())).await.is_err() {
                        break;
                    }
                }
                ServerCmd::Close(code) => {
                    let frame = CloseFrame { code, reason: "server closing".into() };
                    let _ = socket.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn config(base_url: &str) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.connection.base_url = base_url.to_owned();
    config.connection.reconnect_base_delay = Duration::from_millis(50);
    config.connection.heartbeat_interval = Duration::from_millis(100);
    config
}

fn open(server: &TestServer, board_id: &str, token: &str) -> Arc<BoardSession> {
    let deps = SessionDeps::http(&server.base_url, Some(token.to_owned())).unwrap();
    let session = BoardSession::open(
        SessionKey::new("s-1", board_id),
        token,
        LocalUser::new("me", "Local Me"),
        &config(&server.base_url),
        deps,
    )
    .unwrap();
    Arc::new(session)
}

async fn wait_for_state(mut rx: watch::Receiver<ConnectionState>, target: ConnectionState) {
    timeout(WAIT, async {
        loop {
            if *rx.borrow_and_update() == target {
                return;
            }
            if rx.changed().await.is_err() {
                panic!("connection driver stopped before reaching {target:?}");
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {target:?}"));
}

// =============================================================================
// TESTS
// =============================================================================

#[tokio::test]
async fn connects_with_token_and_routes_broadcasts() {
    let mut server = TestServer::start().await;
    let session = open(&server, "board-1", "tok-1");

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let _sub = session.subscribe(EventKind::TaskUpdated, move |event| {
        if let BoardEvent::TaskUpdated(p) = &event.event {
            let _ = events_tx.send(p.id.clone());
        }
    });

    session.connect().unwrap();
    let conn = server.accept().await;
    assert_eq!(conn.board_id, "board-1");
    assert_eq!(conn.token.as_deref(), Some("tok-1"));
    wait_for_state(session.watch_state(), ConnectionState::Connected).await;

    conn.push("task:updated", json!({ "id": "T1", "title": "Ship it" }));
    conn.push("task:updated", json!({ "title": "missing id" }));
    conn.push("task:updated", json!({ "id": "T2" }));

    let first = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    let second = timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert_eq!((first.as_str(), second.as_str()), ("T1", "T2"));
    assert_eq!(session.telemetry().invalid_inbound, 1);
}

#[tokio::test]
async fn outbound_messages_reach_the_server_in_order() {
    let mut server = TestServer::start().await;
    let session = open(&server, "board-1", "tok");
    session.connect().unwrap();
    let mut conn = server.accept().await;
    wait_for_state(session.watch_state(), ConnectionState::Connected).await;

    session.report_activity().await.unwrap();
    session.report_activity().await.unwrap();

    for _ in 0..2 {
        let Seen::Text(value) = conn.next().await else {
            panic!("expected a text frame");
        };
        assert_eq!(value["type"], "user:activity");
        assert_eq!(value["data"]["userId"], "me");
    }
}

#[tokio::test]
async fn heartbeat_pings_are_answered() {
    let mut server = TestServer::start().await;
    let session = open(&server, "board-1", "tok");
    session.connect().unwrap();
    let mut conn = server.accept().await;
    wait_for_state(session.watch_state(), ConnectionState::Connected).await;

    let ping = timeout(WAIT, async {
        loop {
            if let Some(Seen::Text(value)) = conn.seen.recv().await {
                if value["type"] == "ping" {
                    return value;
                }
            }
        }
    })
    .await
    .unwrap();
    assert!(ping["data"]["seq"].is_u64());
}

#[tokio::test]
async fn client_disconnect_sends_normal_close() {
    let mut server = TestServer::start().await;
    let session = open(&server, "board-1", "tok");
    session.connect().unwrap();
    let mut conn = server.accept().await;
    wait_for_state(session.watch_state(), ConnectionState::Connected).await;

    session.disconnect().await.unwrap();

    match conn.next().await {
        Seen::Closed(code) => assert_eq!(code, Some(1000)),
        other => panic!("expected close, got {other:?}"),
    }
    assert_eq!(session.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn server_normal_close_does_not_reconnect() {
    let mut server = TestServer::start().await;
    let session = open(&server, "board-1", "tok");
    session.connect().unwrap();
    let conn = server.accept().await;
    wait_for_state(session.watch_state(), ConnectionState::Connected).await;

    conn.close(1000);

    wait_for_state(session.watch_state(), ConnectionState::Disconnected).await;
    let again = timeout(Duration::from_millis(300), server.accepted.recv()).await;
    assert!(again.is_err(), "clean close must not reconnect");
}

#[tokio::test]
async fn server_abnormal_close_reconnects() {
    let mut server = TestServer::start().await;
    let session = open(&server, "board-1", "tok");
    session.connect().unwrap();
    let conn = server.accept().await;
    wait_for_state(session.watch_state(), ConnectionState::Connected).await;

    conn.close(1011);

    let reopened = server.accept().await;
    assert_eq!(reopened.token.as_deref(), Some("tok"));
    wait_for_state(session.watch_state(), ConnectionState::Connected).await;
}
