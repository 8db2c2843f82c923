use super::*;
use crate::connection::ConnectionState;
use crate::optimistic::RemoteResult;
use crate::store::{Mutation, RemoteStore};
use crate::test_helpers::{ClientFrame, MemoryServer, MemoryTransport, wait_for_state};
use async_trait::async_trait;

struct NoopStore;

#[async_trait]
impl RemoteStore for NoopStore {
    async fn execute(&self, _board_id: &str, _mutation: &Mutation) -> Result<RemoteResult, SyncError> {
        Ok(RemoteResult::done())
    }
}

fn registry() -> (SessionRegistry, Arc<MemoryTransport>, MemoryServer) {
    let (transport, server) = MemoryTransport::new();
    let deps = SessionDeps {
        transport: transport.clone(),
        store: Arc::new(NoopStore),
        directory: None,
    };
    (SessionRegistry::new(SyncConfig::default(), deps), transport, server)
}

fn me() -> LocalUser {
    LocalUser::new("me", "Local Me")
}

#[tokio::test]
async fn get_or_open_reuses_live_session() {
    let (registry, _transport, _server) = registry();
    let key = SessionKey::new("s-1", "board-1");

    let first = registry.get_or_open(&key, "tok", me()).unwrap();
    let second = registry.get_or_open(&key, "tok", me()).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(registry.len(), 1);
    assert!(registry.get(&key).is_some());
}

#[tokio::test]
async fn sessions_are_keyed_by_session_and_board() {
    let (registry, _transport, _server) = registry();

    let a = registry
        .get_or_open(&SessionKey::new("s-1", "board-1"), "tok", me())
        .unwrap();
    let b = registry
        .get_or_open(&SessionKey::new("s-2", "board-1"), "tok", me())
        .unwrap();
    let c = registry
        .get_or_open(&SessionKey::new("s-1", "board-2"), "tok", me())
        .unwrap();

    assert!(!Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(registry.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn close_disconnects_cleanly_and_forgets_session() {
    let (registry, _transport, mut server) = registry();
    let key = SessionKey::new("s-1", "board-1");
    let session = registry.get_or_open(&key, "tok", me()).unwrap();
    session.connect().unwrap();
    let mut peer = server.accept().await;
    wait_for_state(session.watch_state(), ConnectionState::Connected).await;

    assert!(registry.close(&key).await);

    assert_eq!(peer.next_frame().await, Some(ClientFrame::Close(1000)));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert!(registry.get(&key).is_none());
    assert!(!registry.close(&key).await, "second close is a no-op");
}

#[tokio::test]
async fn close_all_empties_registry() {
    let (registry, _transport, _server) = registry();
    for id in ["s-1", "s-2"] {
        let _ = registry
            .get_or_open(&SessionKey::new(id, "board-1"), "tok", me())
            .unwrap();
    }

    registry.close_all().await;

    assert!(registry.is_empty());
}

#[tokio::test]
async fn reopening_after_close_builds_a_fresh_session() {
    let (registry, _transport, _server) = registry();
    let key = SessionKey::new("s-1", "board-1");
    let first = registry.get_or_open(&key, "tok", me()).unwrap();

    registry.close(&key).await;
    let second = registry.get_or_open(&key, "tok", me()).unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
}
