//! Session health monitor.
//!
//! DESIGN
//! ======
//! Every interval the monitor samples telemetry, connection state, pending
//! edits and presence into a [`HealthReport`] with a 0-100 score. The score
//! is diagnostic only: crossings into `degraded` or `unhealthy` are logged
//! and published, never acted on.
//!
//! Scoring lives in the pure [`health_score`] so the penalty table can be
//! tested without a running session.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::{HealthConfig, MAX_INTERVAL};
use crate::connection::ConnectionState;
use crate::optimistic::OptimisticCoordinator;
use crate::presence::PresenceTracker;
use crate::subscription::{HandlerSet, Subscription};
use crate::telemetry::{LatencyMetrics, Telemetry};

const MEMORY_LIMIT_BYTES: usize = 50 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    #[must_use]
    pub fn from_score(score: u8) -> Self {
        match score {
            0..30 => Self::Unhealthy,
            30..70 => Self::Degraded,
            _ => Self::Healthy,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Everything the score depends on.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HealthInputs {
    pub connected: bool,
    pub reconnects: u64,
    pub avg_latency_ms: f64,
    pub messages_per_second: f64,
    pub queue_len: usize,
    pub memory_bytes: usize,
}

/// Start at 100, subtract fixed penalties, clamp to `0..=100`.
#[must_use]
pub fn health_score(inputs: &HealthInputs) -> u8 {
    let mut score: i32 = 100;

    if !inputs.connected {
        score -= 50;
    }
    if inputs.reconnects > 5 {
        score -= 20;
    }

    score -= match inputs.avg_latency_ms {
        ms if ms > 500.0 => 30,
        ms if ms > 200.0 => 15,
        ms if ms > 100.0 => 5,
        _ => 0,
    };

    if inputs.messages_per_second > 10.0 {
        score -= 10;
    }

    score -= match inputs.queue_len {
        n if n > 5 => 20,
        n if n > 2 => 10,
        _ => 0,
    };

    if inputs.memory_bytes > MEMORY_LIMIT_BYTES {
        score -= 15;
    }

    u8::try_from(score.clamp(0, 100)).unwrap_or(0)
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HealthReport {
    pub score: u8,
    pub status: HealthStatus,
    pub state: ConnectionState,
    pub messages_per_second: f64,
    pub latency: LatencyMetrics,
    pub queue_len: usize,
    pub memory_bytes: usize,
    pub reconnects: u64,
    pub dropped: u64,
    pub pending_updates: usize,
    pub presence: usize,
}

/// What the monitor samples.
pub struct HealthSources {
    pub telemetry: Arc<Telemetry>,
    pub state: watch::Receiver<ConnectionState>,
    pub coordinator: OptimisticCoordinator,
    pub presence: Option<Arc<PresenceTracker>>,
}

impl HealthSources {
    #[must_use]
    pub fn sample(&self) -> HealthReport {
        self.sample_at(Instant::now())
    }

    #[allow(clippy::cast_precision_loss)]
    pub(crate) fn sample_at(&self, now: Instant) -> HealthReport {
        let telemetry = self.telemetry.snapshot_at(now);
        let state = *self.state.borrow();
        let (presence, presence_bytes) = self
            .presence
            .as_ref()
            .map_or((0, 0), |p| (p.len(), p.approx_bytes()));

        let memory_bytes = telemetry.queued_bytes
            + telemetry.window_bytes
            + self.coordinator.approx_bytes()
            + presence_bytes;
        let messages_per_second = telemetry.sends_last_minute as f64 / 60.0;

        let score = health_score(&HealthInputs {
            connected: state == ConnectionState::Connected,
            reconnects: telemetry.reconnects,
            avg_latency_ms: telemetry.latency.avg_ms,
            messages_per_second,
            queue_len: telemetry.queue_len,
            memory_bytes,
        });

        HealthReport {
            score,
            status: HealthStatus::from_score(score),
            state,
            messages_per_second,
            latency: telemetry.latency,
            queue_len: telemetry.queue_len,
            memory_bytes,
            reconnects: telemetry.reconnects,
            dropped: telemetry.dropped,
            pending_updates: self.coordinator.pending_count(),
            presence,
        }
    }
}

// =============================================================================
// MONITOR
// =============================================================================

pub struct HealthMonitor {
    latest: watch::Receiver<HealthReport>,
    listeners: HandlerSet<HealthReport>,
    task: JoinHandle<()>,
}

impl HealthMonitor {
    /// Sample now, then every `config.interval`. Must be called inside a
    /// tokio runtime.
    #[must_use]
    pub fn spawn(board_id: &str, config: &HealthConfig, sources: HealthSources) -> Self {
        let period = config.interval.clamp(Duration::from_millis(1), MAX_INTERVAL);
        let initial = sources.sample();
        let (tx, latest) = watch::channel(initial.clone());
        let listeners = HandlerSet::new();

        let task = {
            let listeners = listeners.clone();
            let board_id = board_id.to_owned();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                let mut last = initial.status;

                loop {
                    ticker.tick().await;
                    let report = sources.sample();
                    log_crossing(&board_id, last, &report);
                    last = report.status;
                    tx.send_replace(report.clone());
                    listeners.emit("health", &report);
                }
            })
        };

        Self {
            latest,
            listeners,
            task,
        }
    }

    #[must_use]
    pub fn latest(&self) -> HealthReport {
        self.latest.borrow().clone()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<HealthReport> {
        self.latest.clone()
    }

    /// Called with every periodic report.
    pub fn on_report<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&HealthReport) + Send + Sync + 'static,
    {
        self.listeners.subscribe(handler)
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn log_crossing(board_id: &str, previous: HealthStatus, report: &HealthReport) {
    if previous == report.status {
        return;
    }
    let score = report.score;
    let state = report.state.as_str();
    match report.status {
        HealthStatus::Unhealthy => {
            error!(board_id, score, state, queue_len = report.queue_len, "session unhealthy");
        }
        HealthStatus::Degraded if previous < HealthStatus::Degraded => {
            warn!(board_id, score, state, queue_len = report.queue_len, "session degraded");
        }
        _ => {
            info!(board_id, score, state, from = previous.as_str(), "session health recovered");
        }
    }
}

#[cfg(test)]
#[path = "health_test.rs"]
mod tests;
