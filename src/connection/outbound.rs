//! Outbound send budget and FIFO backlog.

use std::collections::VecDeque;
use std::time::Duration;

use frames::Envelope;
use tokio::time::Instant;

use crate::config::MAX_INTERVAL;
use crate::telemetry::prune_window;

/// Sliding-window send limiter: at most `limit` sends in any `window`.
#[derive(Debug)]
pub(crate) struct SlidingWindow {
    limit: usize,
    window: Duration,
    stamps: VecDeque<Instant>,
}

impl SlidingWindow {
    pub(crate) fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window: window.min(MAX_INTERVAL),
            stamps: VecDeque::new(),
        }
    }

    /// Record a send at `now` if budget allows.
    pub(crate) fn try_acquire_at(&mut self, now: Instant) -> bool {
        prune_window(&mut self.stamps, now, self.window);
        if self.stamps.len() >= self.limit {
            return false;
        }
        self.stamps.push_back(now);
        true
    }

    /// Earliest instant at which another send fits, `None` if one fits now.
    pub(crate) fn next_available_at(&mut self, now: Instant) -> Option<Instant> {
        prune_window(&mut self.stamps, now, self.window);
        if self.stamps.len() < self.limit {
            return None;
        }
        self.stamps.front().map(|oldest| *oldest + self.window)
    }

    pub(crate) fn reset(&mut self) {
        self.stamps.clear();
    }
}

/// Messages waiting for send budget or a connection, oldest first.
#[derive(Debug, Default)]
pub(crate) struct OutboundQueue {
    items: VecDeque<(Envelope, usize)>,
    bytes: usize,
}

impl OutboundQueue {
    pub(crate) fn push_back(&mut self, envelope: Envelope) {
        let size = envelope.approx_size();
        self.bytes += size;
        self.items.push_back((envelope, size));
    }

    /// Put a message back at the head after a failed transmit.
    pub(crate) fn push_front(&mut self, envelope: Envelope) {
        let size = envelope.approx_size();
        self.bytes += size;
        self.items.push_front((envelope, size));
    }

    pub(crate) fn pop_front(&mut self) -> Option<Envelope> {
        let (envelope, size) = self.items.pop_front()?;
        self.bytes -= size;
        Some(envelope)
    }

    /// Discard everything; returns how many messages were dropped.
    pub(crate) fn clear(&mut self) -> usize {
        let dropped = self.items.len();
        self.items.clear();
        self.bytes = 0;
        dropped
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }
}

#[cfg(test)]
#[path = "outbound_test.rs"]
mod tests;
