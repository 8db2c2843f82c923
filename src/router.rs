//! Inbound message demultiplexer.
//!
//! DESIGN
//! ======
//! Raw socket payloads are decoded, shape-validated and typed in one place.
//! Anything that fails is logged, counted and discarded; handlers only ever
//! see a well-formed [`InboundEvent`]. Heartbeat traffic is returned to the
//! caller as [`Control`] instead of being fanned out.
//!
//! Interceptors run before fan-out and may suppress an event. The optimistic
//! coordinator is one: it drops stale broadcasts that would clobber a pending
//! local edit.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use frames::{Envelope, WireMessage};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ValidationError;
use crate::event::{BoardEvent, Control, EventKind, InboundEvent};
use crate::subscription::{HandlerSet, Subscription};
use crate::telemetry::Telemetry;

/// Hook that sees every typed event before subscribers do.
pub trait EventInterceptor: Send + Sync {
    /// Return `false` to drop the event.
    fn admit(&self, event: &InboundEvent) -> bool;
}

/// What happened to one inbound payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Routed {
    /// Delivered to this many handlers (zero when nobody listens).
    Delivered(usize),
    /// An interceptor dropped it.
    Suppressed,
    /// Failed validation and was discarded.
    Invalid,
    /// Heartbeat for the connection driver.
    Control(Control),
}

pub struct EventRouter {
    handlers: Mutex<HashMap<EventKind, HandlerSet<InboundEvent>>>,
    interceptors: Mutex<Vec<Arc<dyn EventInterceptor>>>,
    telemetry: Arc<Telemetry>,
}

impl EventRouter {
    #[must_use]
    pub fn new(telemetry: Arc<Telemetry>) -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            interceptors: Mutex::new(Vec::new()),
            telemetry,
        }
    }

    /// Register `handler` for one event type. Several handlers per type are
    /// allowed; each subscription removes only its own handler.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        let set = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .clone();
        set.subscribe(handler)
    }

    pub fn add_interceptor(&self, interceptor: Arc<dyn EventInterceptor>) {
        self.interceptors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(interceptor);
    }

    #[must_use]
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, HandlerSet::len)
    }

    /// Decode and route one socket payload.
    pub fn dispatch_raw(&self, message: &WireMessage) -> Routed {
        self.telemetry.record_inbound();
        match frames::decode(message) {
            Ok(envelope) => self.route(&envelope),
            Err(e) => self.reject(&ValidationError::from(e), None),
        }
    }

    /// Route an already-decoded envelope.
    pub fn dispatch(&self, envelope: &Envelope) -> Routed {
        self.telemetry.record_inbound();
        self.route(envelope)
    }

    fn route(&self, envelope: &Envelope) -> Routed {
        let event = match BoardEvent::from_envelope(envelope) {
            Ok(event) => event,
            Err(e) => return self.reject(&e, Some(&envelope.kind)),
        };

        match event {
            BoardEvent::Ping(data) => return Routed::Control(Control::Ping(data)),
            BoardEvent::Pong(data) => return Routed::Control(Control::Pong(data)),
            _ => {}
        }

        let inbound = InboundEvent {
            event,
            timestamp: envelope.timestamp,
            received_at: Instant::now(),
        };

        let interceptors: Vec<_> = self
            .interceptors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if !interceptors.iter().all(|i| i.admit(&inbound)) {
            debug!(event = %inbound.kind(), "inbound event suppressed");
            return Routed::Suppressed;
        }

        let kind = inbound.kind();
        let set = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .cloned();
        let delivered = set.map_or(0, |set| set.emit(kind.as_str(), &inbound));
        Routed::Delivered(delivered)
    }

    fn reject(&self, err: &ValidationError, kind: Option<&str>) -> Routed {
        self.telemetry.record_invalid();
        warn!(event = kind.unwrap_or("?"), error = %err, "dropping invalid inbound message");
        Routed::Invalid
    }
}

#[cfg(test)]
#[path = "router_test.rs"]
mod tests;
