//! Rolling performance windows for one board session.
//!
//! Samples feed the health monitor only; nothing in the engine makes a
//! correctness decision from them.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

const SEND_WINDOW: Duration = Duration::from_secs(300);
const LATENCY_SAMPLES: usize = 100;

/// Latency summary in milliseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct LatencyMetrics {
    pub count: usize,
    pub min_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
}

impl LatencyMetrics {
    /// Build latency metrics from round-trip durations.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_durations<'a>(durations: impl IntoIterator<Item = &'a Duration>) -> Self {
        let mut ms = durations
            .into_iter()
            .map(|d| d.as_secs_f64() * 1_000.0)
            .collect::<Vec<_>>();
        if ms.is_empty() {
            return Self::default();
        }
        ms.sort_by(f64::total_cmp);

        let count = ms.len();
        Self {
            count,
            min_ms: ms[0],
            max_ms: ms[count - 1],
            avg_ms: ms.iter().sum::<f64>() / count as f64,
            p50_ms: percentile(&ms, 0.50),
            p95_ms: percentile(&ms, 0.95),
        }
    }
}

#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn percentile(sorted_values: &[f64], p: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }

    let index = ((sorted_values.len() - 1) as f64 * p).round() as usize;
    sorted_values[index.min(sorted_values.len() - 1)]
}

/// Point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct TelemetrySnapshot {
    /// Sends recorded in the trailing 60 seconds.
    pub sends_last_minute: usize,
    pub latency: LatencyMetrics,
    pub reconnects: u64,
    pub dropped: u64,
    pub inbound: u64,
    pub invalid_inbound: u64,
    pub outbound: u64,
    pub queue_len: usize,
    pub queued_bytes: usize,
    /// Bytes held by the sample windows themselves.
    pub window_bytes: usize,
}

#[derive(Default)]
struct Windows {
    sends: VecDeque<Instant>,
    latencies: VecDeque<Duration>,
    reconnects: u64,
    dropped: u64,
    inbound: u64,
    invalid_inbound: u64,
    outbound: u64,
    queue_len: usize,
    queued_bytes: usize,
}

/// Shared counters written by the connection driver and router.
#[derive(Default)]
pub struct Telemetry {
    inner: Mutex<Windows>,
}

impl Telemetry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut Windows) -> R) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut inner)
    }

    /// A message left this side of the socket.
    pub fn record_send(&self) {
        self.record_send_at(Instant::now());
    }

    pub(crate) fn record_send_at(&self, now: Instant) {
        self.with(|w| {
            prune_window(&mut w.sends, now, SEND_WINDOW);
            w.sends.push_back(now);
            w.outbound += 1;
        });
    }

    pub fn record_latency(&self, rtt: Duration) {
        self.with(|w| {
            if w.latencies.len() == LATENCY_SAMPLES {
                w.latencies.pop_front();
            }
            w.latencies.push_back(rtt);
        });
    }

    pub fn record_reconnect(&self) {
        self.with(|w| w.reconnects += 1);
    }

    pub fn record_dropped(&self, count: usize) {
        self.with(|w| w.dropped += count as u64);
    }

    pub fn record_inbound(&self) {
        self.with(|w| w.inbound += 1);
    }

    pub fn record_invalid(&self) {
        self.with(|w| w.invalid_inbound += 1);
    }

    pub fn set_queue(&self, len: usize, bytes: usize) {
        self.with(|w| {
            w.queue_len = len;
            w.queued_bytes = bytes;
        });
    }

    #[must_use]
    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.snapshot_at(Instant::now())
    }

    pub(crate) fn snapshot_at(&self, now: Instant) -> TelemetrySnapshot {
        self.with(|w| {
            prune_window(&mut w.sends, now, SEND_WINDOW);
            let minute_ago = now.checked_sub(Duration::from_secs(60));
            let sends_last_minute = match minute_ago {
                Some(cutoff) => w.sends.iter().filter(|t| **t > cutoff).count(),
                None => w.sends.len(),
            };
            let window_bytes = w.sends.len() * std::mem::size_of::<Instant>()
                + w.latencies.len() * std::mem::size_of::<Duration>();

            TelemetrySnapshot {
                sends_last_minute,
                latency: LatencyMetrics::from_durations(&w.latencies),
                reconnects: w.reconnects,
                dropped: w.dropped,
                inbound: w.inbound,
                invalid_inbound: w.invalid_inbound,
                outbound: w.outbound,
                queue_len: w.queue_len,
                queued_bytes: w.queued_bytes,
                window_bytes,
            }
        })
    }
}

/// Drop timestamps that fell out of `window`.
pub(crate) fn prune_window(deque: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = deque.front() {
        if now.duration_since(*front) >= window {
            deque.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
#[path = "telemetry_test.rs"]
mod tests;
