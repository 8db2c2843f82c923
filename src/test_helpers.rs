//! In-memory transport and fixtures shared by unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use frames::{Envelope, WireFormat, WireMessage};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::connection::transport::{Link, LinkEvent, Transport};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::TransportError;

/// What the client side wrote to a memory link.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ClientFrame {
    Message(WireMessage),
    Close(u16),
}

struct TransportInner {
    script: VecDeque<bool>,
    accept: bool,
    opens: Vec<Instant>,
}

/// Transport whose handshakes are scripted and whose server side is a
/// [`MemoryServer`].
pub(crate) struct MemoryTransport {
    inner: Mutex<TransportInner>,
    peers: mpsc::UnboundedSender<MemoryPeer>,
}

impl MemoryTransport {
    pub(crate) fn new() -> (Arc<Self>, MemoryServer) {
        let (peers, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            inner: Mutex::new(TransportInner {
                script: VecDeque::new(),
                accept: true,
                opens: Vec::new(),
            }),
            peers,
        });
        (transport, MemoryServer { peers: rx })
    }

    /// Default outcome for handshakes with no scripted result.
    pub(crate) fn set_accept(&self, accept: bool) {
        self.inner.lock().unwrap().accept = accept;
    }

    /// Refuse the next `n` handshakes, then fall back to the default.
    pub(crate) fn refuse_next(&self, n: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.script.extend(std::iter::repeat_n(false, n));
    }

    pub(crate) fn opens(&self) -> usize {
        self.inner.lock().unwrap().opens.len()
    }

    pub(crate) fn open_times(&self) -> Vec<Instant> {
        self.inner.lock().unwrap().opens.clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, _url: &str) -> Result<Box<dyn Link>, TransportError> {
        let accept = {
            let mut inner = self.inner.lock().unwrap();
            inner.opens.push(Instant::now());
            let default = inner.accept;
            inner.script.pop_front().unwrap_or(default)
        };
        if !accept {
            return Err(TransportError::Connect("refused".to_owned()));
        }

        let (to_server, from_client) = mpsc::unbounded_channel();
        let (to_client, from_server) = mpsc::unbounded_channel();
        self.peers
            .send(MemoryPeer {
                from_client,
                to_client,
            })
            .map_err(|_| TransportError::Connect("server gone".to_owned()))?;
        Ok(Box::new(MemoryLink {
            to_server,
            from_server,
        }))
    }
}

struct MemoryLink {
    to_server: mpsc::UnboundedSender<ClientFrame>,
    from_server: mpsc::UnboundedReceiver<LinkEvent>,
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        self.to_server
            .send(ClientFrame::Message(message))
            .map_err(|_| TransportError::Send("peer gone".to_owned()))
    }

    async fn recv(&mut self) -> Result<LinkEvent, TransportError> {
        Ok(self.from_server.recv().await.unwrap_or(LinkEvent::Closed {
            code: None,
            reason: "peer dropped".to_owned(),
        }))
    }

    async fn close(&mut self, code: u16, _reason: &str) -> Result<(), TransportError> {
        self.to_server
            .send(ClientFrame::Close(code))
            .map_err(|_| TransportError::Send("peer gone".to_owned()))
    }
}

/// Accepts the server side of each successful handshake.
pub(crate) struct MemoryServer {
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryServer {
    pub(crate) async fn accept(&mut self) -> MemoryPeer {
        self.peers.recv().await.expect("transport dropped")
    }
}

/// Server end of one memory link. Dropping it is an unclean close.
pub(crate) struct MemoryPeer {
    from_client: mpsc::UnboundedReceiver<ClientFrame>,
    to_client: mpsc::UnboundedSender<LinkEvent>,
}

impl MemoryPeer {
    pub(crate) fn push(&self, envelope: &Envelope) {
        self.push_raw(frames::encode(envelope, WireFormat::Json));
    }

    pub(crate) fn push_raw(&self, message: WireMessage) {
        let _ = self.to_client.send(LinkEvent::Message(message));
    }

    pub(crate) fn close(&self, code: u16) {
        let _ = self.to_client.send(LinkEvent::Closed {
            code: Some(code),
            reason: String::new(),
        });
    }

    pub(crate) async fn next_frame(&mut self) -> Option<ClientFrame> {
        self.from_client.recv().await
    }

    /// Next decoded envelope, skipping heartbeat pings. `None` on close.
    pub(crate) async fn next_envelope(&mut self) -> Option<Envelope> {
        loop {
            match self.next_frame().await? {
                ClientFrame::Message(message) => {
                    let envelope = frames::decode(&message).expect("client sent invalid envelope");
                    if envelope.kind != "ping" {
                        return Some(envelope);
                    }
                }
                ClientFrame::Close(_) => return None,
            }
        }
    }

    /// Wait for the client's close frame and return its code.
    pub(crate) async fn close_code(&mut self) -> Option<u16> {
        loop {
            match self.next_frame().await? {
                ClientFrame::Close(code) => return Some(code),
                ClientFrame::Message(_) => {}
            }
        }
    }
}

/// Poll `check` every 10ms of (possibly paused) time until it holds.
pub(crate) async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Wait until `manager` reports `target`.
pub(crate) async fn wait_for(manager: &ConnectionManager, target: ConnectionState) {
    wait_for_state(manager.watch_state(), target).await;
}

/// Wait until the observed state is `target`.
pub(crate) async fn wait_for_state(mut rx: watch::Receiver<ConnectionState>, target: ConnectionState) {
    let result = tokio::time::timeout(
        std::time::Duration::from_secs(120),
        rx.wait_for(|s| *s == target),
    )
    .await
    .expect("timed out waiting for state");
    assert!(result.is_ok(), "driver stopped");
}
