//! Connection manager: one persistent socket per board session.
//!
//! ARCHITECTURE
//! ============
//! [`ConnectionManager`] is a cheap handle. The socket, timers, backoff
//! counter and outbound queue are owned by a single driver task and mutated
//! only there; the handle talks to it over a command channel and observes it
//! through a `watch` of [`ConnectionState`].
//!
//! ```text
//! disconnected --connect--> connecting --ack--> connected
//!                              ^                   | unclean close / send failure
//!                              | backoff elapsed   v
//!                              +------------- reconnecting
//! connecting/reconnecting --attempts exhausted--> error (until connect)
//! ```
//!
//! DESIGN
//! ======
//! - Outbound messages pass a sliding-window limiter. Over budget they wait
//!   in a FIFO that drains on a timer; a failed transmit goes back to the
//!   head, so submission order is preserved end to end.
//! - Heartbeat pings bypass the limiter and are never queued.
//! - The attempt counter resets on a successful handshake, on `disconnect`
//!   and on a manual `connect`.
//! - Dropping the handle aborts the driver.

mod backoff;
mod outbound;
pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use frames::{Envelope, WireFormat};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{ConnectionConfig, MAX_INTERVAL};
use crate::error::{SyncError, TransportError};
use crate::event::Control;
use crate::router::{EventRouter, Routed};
use crate::subscription::{HandlerSet, Subscription};
use crate::telemetry::Telemetry;
use backoff::ReconnectPolicy;
use outbound::{OutboundQueue, SlidingWindow};
use transport::{CLOSE_NORMAL, Link, LinkEvent, Transport};

/// Outstanding heartbeat pings kept for RTT matching.
const MAX_PENDING_PINGS: usize = 8;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl ConnectionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

enum Command {
    Connect,
    Disconnect {
        done: oneshot::Sender<()>,
    },
    Send {
        envelope: Envelope,
        ack: oneshot::Sender<Result<(), SyncError>>,
    },
}

// =============================================================================
// HANDLE
// =============================================================================

pub struct ConnectionManager {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    listeners: HandlerSet<ConnectionState>,
    driver: JoinHandle<()>,
}

impl ConnectionManager {
    /// Start the driver for `url`. Nothing is opened until [`Self::connect`].
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn spawn(
        board_id: &str,
        url: String,
        config: &ConnectionConfig,
        transport: Arc<dyn Transport>,
        router: Arc<EventRouter>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let listeners = HandlerSet::new();

        let driver = Driver {
            board_id: board_id.to_owned(),
            url,
            transport,
            router,
            telemetry,
            commands: command_rx,
            state_tx,
            listeners: listeners.clone(),
            policy: ReconnectPolicy {
                base_delay: config.reconnect_base_delay,
                max_attempts: config.max_reconnect_attempts,
            },
            heartbeat_interval: config.heartbeat_interval,
            handshake_timeout: config.handshake_timeout,
            wire_format: config.wire_format,
            limiter: SlidingWindow::new(config.message_rate_limit, config.rate_window),
            queue: OutboundQueue::default(),
            attempts: 0,
            ping_seq: 0,
            pending_pings: HashMap::new(),
        };

        Self {
            commands,
            state,
            listeners,
            driver: tokio::spawn(driver.run()),
        }
    }

    /// Open the connection. A no-op while connecting, connected or waiting
    /// to reconnect; from `error` it starts over with a fresh attempt counter.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::EngineStopped`] if the driver has exited.
    pub fn connect(&self) -> Result<(), SyncError> {
        self.commands
            .send(Command::Connect)
            .map_err(|_| SyncError::EngineStopped)
    }

    /// Close with a clean code, cancel timers, discard the outbound queue and
    /// reset the attempt counter. Resolves once the driver is idle.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::EngineStopped`] if the driver has exited.
    pub async fn disconnect(&self) -> Result<(), SyncError> {
        let (done, rx) = oneshot::channel();
        self.commands
            .send(Command::Disconnect { done })
            .map_err(|_| SyncError::EngineStopped)?;
        rx.await.map_err(|_| SyncError::EngineStopped)
    }

    /// Send `data` as a message of type `kind`.
    ///
    /// # Errors
    ///
    /// See [`Self::send_envelope`].
    pub async fn send(&self, kind: &str, data: Value) -> Result<(), SyncError> {
        self.send_envelope(Envelope::new(kind, data)).await
    }

    /// Resolves once the message is transmitted or queued behind the rate
    /// limit or a pending reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ConnectionClosed`] in the terminal error state and
    /// [`SyncError::EngineStopped`] if the driver has exited.
    pub async fn send_envelope(&self, envelope: Envelope) -> Result<(), SyncError> {
        if self.state() == ConnectionState::Error {
            return Err(SyncError::ConnectionClosed);
        }
        let (ack, rx) = oneshot::channel();
        self.commands
            .send(Command::Send { envelope, ack })
            .map_err(|_| SyncError::EngineStopped)?;
        rx.await.map_err(|_| SyncError::EngineStopped)?
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Called on every state transition, from the driver task.
    pub fn on_status_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.listeners.subscribe(handler)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

// =============================================================================
// DRIVER
// =============================================================================

enum Phase {
    Idle,
    Connecting,
    Connected(Box<dyn Link>),
    Backoff(Duration),
}

struct Driver {
    board_id: String,
    url: String,
    transport: Arc<dyn Transport>,
    router: Arc<EventRouter>,
    telemetry: Arc<Telemetry>,
    commands: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<ConnectionState>,
    listeners: HandlerSet<ConnectionState>,
    policy: ReconnectPolicy,
    heartbeat_interval: Duration,
    handshake_timeout: Duration,
    wire_format: WireFormat,
    limiter: SlidingWindow,
    queue: OutboundQueue,
    attempts: u32,
    ping_seq: u64,
    pending_pings: HashMap<u64, Instant>,
}

impl Driver {
    async fn run(mut self) {
        let mut phase = Phase::Idle;
        loop {
            let next = match phase {
                Phase::Idle => self.idle().await,
                Phase::Connecting => self.handshake().await,
                Phase::Connected(link) => self.pump(link).await,
                Phase::Backoff(delay) => self.backoff(delay).await,
            };
            // `None` means every handle is gone.
            let Some(next) = next else {
                debug!(board_id = %self.board_id, "connection driver stopped");
                return;
            };
            phase = next;
        }
    }

    async fn idle(&mut self) -> Option<Phase> {
        loop {
            match self.commands.recv().await? {
                Command::Connect => {
                    self.attempts = 0;
                    self.set_state(ConnectionState::Connecting);
                    return Some(Phase::Connecting);
                }
                Command::Disconnect { done } => {
                    self.reset();
                    let _ = done.send(());
                }
                Command::Send { envelope, ack } => {
                    let result = self.enqueue(envelope);
                    let _ = ack.send(result);
                }
            }
        }
    }

    async fn handshake(&mut self) -> Option<Phase> {
        let open = {
            let transport = Arc::clone(&self.transport);
            let url = self.url.clone();
            let limit = self.handshake_timeout;
            async move {
                match tokio::time::timeout(limit, transport.open(&url)).await {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::HandshakeTimeout(duration_ms(limit))),
                }
            }
        };
        tokio::pin!(open);

        loop {
            tokio::select! {
                result = &mut open => {
                    return Some(match result {
                        Ok(link) => {
                            self.attempts = 0;
                            self.set_state(ConnectionState::Connected);
                            Phase::Connected(link)
                        }
                        Err(e) => {
                            warn!(board_id = %self.board_id, error = %e, "handshake failed");
                            self.schedule_reconnect()
                        }
                    });
                }
                cmd = self.commands.recv() => match cmd? {
                    Command::Connect => {}
                    Command::Disconnect { done } => {
                        self.reset();
                        let _ = done.send(());
                        return Some(Phase::Idle);
                    }
                    Command::Send { envelope, ack } => {
                        let result = self.enqueue(envelope);
                        let _ = ack.send(result);
                    }
                },
            }
        }
    }

    async fn backoff(&mut self, delay: Duration) -> Option<Phase> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                () = &mut sleep => {
                    self.set_state(ConnectionState::Connecting);
                    return Some(Phase::Connecting);
                }
                cmd = self.commands.recv() => match cmd? {
                    Command::Connect => {}
                    Command::Disconnect { done } => {
                        self.reset();
                        let _ = done.send(());
                        return Some(Phase::Idle);
                    }
                    Command::Send { envelope, ack } => {
                        let result = self.enqueue(envelope);
                        let _ = ack.send(result);
                    }
                },
            }
        }
    }

    async fn pump(&mut self, mut link: Box<dyn Link>) -> Option<Phase> {
        self.pending_pings.clear();
        let period = self
            .heartbeat_interval
            .clamp(Duration::from_millis(1), MAX_INTERVAL);
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if let Err(e) = self.flush(link.as_mut()).await {
            warn!(board_id = %self.board_id, error = %e, "flush after connect failed");
            return Some(self.schedule_reconnect());
        }

        loop {
            let drain_at = self.drain_deadline();

            tokio::select! {
                event = link.recv() => match event {
                    Ok(LinkEvent::Message(message)) => {
                        if let Routed::Control(control) = self.router.dispatch_raw(&message) {
                            self.handle_control(link.as_mut(), control).await;
                        }
                    }
                    Ok(close) if close.is_clean_close() => {
                        info!(board_id = %self.board_id, "server closed connection cleanly");
                        self.attempts = 0;
                        self.set_state(ConnectionState::Disconnected);
                        return Some(Phase::Idle);
                    }
                    Ok(LinkEvent::Closed { code, reason }) => {
                        warn!(board_id = %self.board_id, ?code, %reason, "connection closed uncleanly");
                        return Some(self.schedule_reconnect());
                    }
                    Err(e) => {
                        warn!(board_id = %self.board_id, error = %e, "receive failed");
                        return Some(self.schedule_reconnect());
                    }
                },
                cmd = self.commands.recv() => match cmd? {
                    Command::Connect => {}
                    Command::Disconnect { done } => {
                        if let Err(e) = link.close(CLOSE_NORMAL, "client disconnect").await {
                            debug!(board_id = %self.board_id, error = %e, "close frame not delivered");
                        }
                        self.reset();
                        let _ = done.send(());
                        return Some(Phase::Idle);
                    }
                    Command::Send { envelope, ack } => {
                        self.queue.push_back(envelope);
                        let flushed = self.flush(link.as_mut()).await;
                        let _ = ack.send(Ok(()));
                        if let Err(e) = flushed {
                            warn!(board_id = %self.board_id, error = %e, "send failed");
                            return Some(self.schedule_reconnect());
                        }
                    }
                },
                _ = heartbeat.tick() => self.ping(link.as_mut()).await,
                () = sleep_until_opt(drain_at), if drain_at.is_some() => {
                    if let Err(e) = self.flush(link.as_mut()).await {
                        warn!(board_id = %self.board_id, error = %e, "send failed");
                        return Some(self.schedule_reconnect());
                    }
                }
            }
        }
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    fn enqueue(&mut self, envelope: Envelope) -> Result<(), SyncError> {
        if *self.state_tx.borrow() == ConnectionState::Error {
            return Err(SyncError::ConnectionClosed);
        }
        self.queue.push_back(envelope);
        self.sync_queue_telemetry();
        Ok(())
    }

    /// Transmit queued messages while send budget lasts.
    async fn flush(&mut self, link: &mut dyn Link) -> Result<(), TransportError> {
        while !self.queue.is_empty() {
            if !self.limiter.try_acquire_at(Instant::now()) {
                break;
            }
            let Some(envelope) = self.queue.pop_front() else {
                break;
            };
            let message = frames::encode(&envelope, self.wire_format);
            if let Err(e) = link.send(message).await {
                self.queue.push_front(envelope);
                self.sync_queue_telemetry();
                return Err(e);
            }
            self.telemetry.record_send();
        }
        self.sync_queue_telemetry();
        Ok(())
    }

    fn drain_deadline(&mut self) -> Option<Instant> {
        if self.queue.is_empty() {
            return None;
        }
        let now = Instant::now();
        Some(self.limiter.next_available_at(now).unwrap_or(now))
    }

    fn sync_queue_telemetry(&self) {
        self.telemetry.set_queue(self.queue.len(), self.queue.bytes());
    }

    // =========================================================================
    // HEARTBEAT
    // =========================================================================

    async fn ping(&mut self, link: &mut dyn Link) {
        self.ping_seq += 1;
        let seq = self.ping_seq;
        if self.pending_pings.len() >= MAX_PENDING_PINGS {
            self.pending_pings.clear();
        }
        self.pending_pings.insert(seq, Instant::now());

        let ping = Envelope::new("ping", json!({ "seq": seq }));
        if let Err(e) = link.send(frames::encode(&ping, self.wire_format)).await {
            // Liveness is judged by the close path, not by heartbeat sends.
            warn!(board_id = %self.board_id, error = %e, "heartbeat ping failed");
        }
    }

    async fn handle_control(&mut self, link: &mut dyn Link, control: Control) {
        match control {
            Control::Ping(data) => {
                let pong = Envelope::new("pong", data);
                if let Err(e) = link.send(frames::encode(&pong, self.wire_format)).await {
                    warn!(board_id = %self.board_id, error = %e, "pong reply failed");
                }
            }
            Control::Pong(data) => {
                let Some(seq) = data.get("seq").and_then(Value::as_u64) else {
                    debug!(board_id = %self.board_id, "pong without seq ignored");
                    return;
                };
                if let Some(sent_at) = self.pending_pings.remove(&seq) {
                    self.telemetry.record_latency(sent_at.elapsed());
                }
            }
        }
    }

    // =========================================================================
    // STATE
    // =========================================================================

    fn schedule_reconnect(&mut self) -> Phase {
        if self.policy.exhausted(self.attempts) {
            let dropped = self.queue.clear();
            self.telemetry.record_dropped(dropped);
            self.sync_queue_telemetry();
            warn!(
                board_id = %self.board_id,
                attempts = self.attempts,
                dropped,
                "reconnect attempts exhausted"
            );
            self.set_state(ConnectionState::Error);
            return Phase::Idle;
        }

        self.attempts += 1;
        let delay = self.policy.delay_for(self.attempts);
        self.telemetry.record_reconnect();
        info!(
            board_id = %self.board_id,
            attempt = self.attempts,
            delay_ms = duration_ms(delay),
            "scheduling reconnect"
        );
        self.set_state(ConnectionState::Reconnecting);
        Phase::Backoff(delay)
    }

    fn reset(&mut self) {
        self.attempts = 0;
        self.limiter.reset();
        self.pending_pings.clear();
        let dropped = self.queue.clear();
        if dropped > 0 {
            self.telemetry.record_dropped(dropped);
            debug!(board_id = %self.board_id, dropped, "discarded queued messages on disconnect");
        }
        self.sync_queue_telemetry();
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = *self.state_tx.borrow();
        if previous == next {
            return;
        }
        info!(board_id = %self.board_id, from = %previous, to = %next, "connection state changed");
        self.state_tx.send_replace(next);
        self.listeners.emit("connection:status", &next);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[path = "connection_test.rs"]
mod tests;
