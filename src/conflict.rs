//! Conflict resolution between a pending local edit and an inbound
//! authoritative event for the same resource.

use std::time::Duration;

use serde::Serialize;

use crate::config::OptimisticConfig;
use crate::optimistic::OperationKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// The inbound event stands; the pending edit is cleared.
    Accept,
    /// The inbound event is dropped; the pending edit stays.
    Reject,
    /// Reserved for field-level reconciliation.
    Merge,
}

/// Decides a conflict from the pending edit's kind and age alone.
pub trait ConflictPolicy: Send + Sync {
    fn resolve(&self, kind: OperationKind, elapsed: Duration) -> Resolution;
}

/// Age thresholds per operation kind. Creates and deletes always accept.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThresholdPolicy {
    pub update_window: Duration,
    pub move_window: Duration,
}

impl Default for ThresholdPolicy {
    fn default() -> Self {
        Self::from(&OptimisticConfig::default())
    }
}

impl From<&OptimisticConfig> for ThresholdPolicy {
    fn from(config: &OptimisticConfig) -> Self {
        Self {
            update_window: config.update_conflict_window,
            move_window: config.move_conflict_window,
        }
    }
}

impl ConflictPolicy for ThresholdPolicy {
    fn resolve(&self, kind: OperationKind, elapsed: Duration) -> Resolution {
        let window = match kind {
            OperationKind::Create | OperationKind::Delete => return Resolution::Accept,
            OperationKind::Update => self.update_window,
            OperationKind::Move => self.move_window,
        };
        if elapsed > window {
            Resolution::Accept
        } else {
            Resolution::Reject
        }
    }
}
