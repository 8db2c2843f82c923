//! Socket abstraction for the connection driver.
//!
//! The driver only needs "open a link", "send a payload", "wait for the next
//! payload or close" and "close with a code". [`WsTransport`] provides that
//! on `tokio-tungstenite`; tests substitute an in-memory transport.

use async_trait::async_trait;
use frames::WireMessage;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::TransportError;

/// Close code for an intentional, clean shutdown.
pub const CLOSE_NORMAL: u16 = 1000;

/// Something that happened on an open link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Message(WireMessage),
    /// The peer closed (or the stream ended, with no code).
    Closed { code: Option<u16>, reason: String },
}

impl LinkEvent {
    /// Whether this close should not trigger reconnection.
    #[must_use]
    pub fn is_clean_close(&self) -> bool {
        matches!(self, Self::Closed { code: Some(CLOSE_NORMAL), .. })
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a link to `url`. Returning `Ok` is the handshake acknowledgement.
    async fn open(&self, url: &str) -> Result<Box<dyn Link>, TransportError>;
}

#[async_trait]
pub trait Link: Send {
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError>;

    /// Next payload or close. Errors are receive failures (unclean).
    async fn recv(&mut self) -> Result<LinkEvent, TransportError>;

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// Board socket URL: `ws(s)://host/api/board/{board_id}/ws?token=...`.
///
/// # Errors
///
/// Returns [`TransportError::InvalidBaseUrl`] unless `base_url` is an
/// `http` or `https` URL.
pub fn board_ws_url(base_url: &str, board_id: &str, token: &str) -> Result<String, TransportError> {
    let trimmed = base_url.trim().trim_end_matches('/');
    let mut url = reqwest::Url::parse(trimmed)
        .map_err(|_| TransportError::InvalidBaseUrl(base_url.to_owned()))?;
    let scheme = match url.scheme() {
        "http" => "ws",
        "https" => "wss",
        _ => return Err(TransportError::InvalidBaseUrl(base_url.to_owned())),
    };
    url.set_scheme(scheme)
        .map_err(|()| TransportError::InvalidBaseUrl(base_url.to_owned()))?;

    url.path_segments_mut()
        .map_err(|()| TransportError::InvalidBaseUrl(base_url.to_owned()))?
        .pop_if_empty()
        .extend(["api", "board", board_id, "ws"]);
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url.into())
}

// =============================================================================
// WEBSOCKET IMPLEMENTATION
// =============================================================================

#[derive(Clone, Copy, Debug, Default)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn Link>, TransportError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Box::new(WsLink { stream }))
    }
}

pub struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Link for WsLink {
    async fn send(&mut self, message: WireMessage) -> Result<(), TransportError> {
        let message = match message {
            WireMessage::Text(text) => Message::Text(text.into()),
            WireMessage::Binary(bytes) => Message::Binary(bytes.into()),
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Result<LinkEvent, TransportError> {
        loop {
            let Some(next) = self.stream.next().await else {
                return Ok(LinkEvent::Closed {
                    code: None,
                    reason: "stream ended".to_owned(),
                });
            };
            match next.map_err(|e| TransportError::Receive(e.to_string()))? {
                Message::Text(text) => {
                    return Ok(LinkEvent::Message(WireMessage::Text(text.as_str().to_owned())));
                }
                Message::Binary(bytes) => {
                    return Ok(LinkEvent::Message(WireMessage::Binary(bytes.to_vec())));
                }
                Message::Close(frame) => {
                    let (code, reason) = frame.map_or((None, String::new()), |f| {
                        (Some(u16::from(f.code)), f.reason.as_str().to_owned())
                    });
                    return Ok(LinkEvent::Closed { code, reason });
                }
                // Protocol-level ping/pong is answered by tungstenite itself.
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_owned().into(),
        };
        self.stream
            .close(Some(frame))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }
}
