//! Optimistic update coordinator.
//!
//! DESIGN
//! ======
//! An edit is applied locally before the server confirms it. The
//! coordinator records it as a [`PendingUpdate`], runs the remote call under
//! a safety timeout and either returns the canonical result or rolls the
//! local change back and returns the error. Once the local change is applied
//! the remote call and its timer run on a coordinator-owned task, so a caller
//! that drops its future still gets exactly one rollback on failure.
//!
//! Only one edit per `(resource_id, kind)` is in flight at a time; a second
//! one waits for the first to settle before applying locally.
//!
//! Inbound broadcasts for a resource with a pending edit are resolved by a
//! [`ConflictPolicy`]: `reject` drops the broadcast, `accept` lets it stand
//! and clears the pending record. The first matching record in submission
//! order decides.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio::time::error::Elapsed;
use tracing::{debug, info, warn};

use crate::config::OptimisticConfig;
use crate::conflict::{ConflictPolicy, Resolution, ThresholdPolicy};
use crate::error::SyncError;
use crate::event::{BoardEvent, InboundEvent};
use crate::router::EventInterceptor;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Move,
}

impl OperationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Move => "move",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "move" => Ok(Self::Move),
            other => Err(format!("unknown operation kind: {other}")),
        }
    }
}

/// What the persistence API reported for one mutation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RemoteResult {
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Success without a body, as returned for deletes.
    #[must_use]
    pub fn done() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    #[must_use]
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Deletes only need the flag; everything else also needs canonical data.
    #[must_use]
    pub fn is_success(&self, kind: OperationKind) -> bool {
        match kind {
            OperationKind::Delete => self.success,
            _ => self.success && self.data.is_some(),
        }
    }
}

/// An in-flight optimistic edit awaiting confirmation.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingUpdate {
    pub operation_id: String,
    pub resource_id: String,
    pub kind: OperationKind,
    /// Local state before the edit, kept for the caller's rollback.
    pub snapshot: Option<Value>,
    pub submitted_at: Instant,
}

type LocalFn = Box<dyn FnOnce() + Send>;

/// One optimistic edit: identity plus the local apply and undo steps.
pub struct OptimisticUpdate {
    operation_id: String,
    resource_id: String,
    kind: OperationKind,
    snapshot: Option<Value>,
    apply_local: Option<LocalFn>,
    rollback: Option<LocalFn>,
}

impl OptimisticUpdate {
    pub fn new(
        operation_id: impl Into<String>,
        resource_id: impl Into<String>,
        kind: OperationKind,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            resource_id: resource_id.into(),
            kind,
            snapshot: None,
            apply_local: None,
            rollback: None,
        }
    }

    #[must_use]
    pub fn snapshot(mut self, snapshot: Value) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Runs synchronously once the edit is registered.
    #[must_use]
    pub fn apply_local(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.apply_local = Some(Box::new(f));
        self
    }

    /// Runs at most once, when the remote call fails or times out.
    #[must_use]
    pub fn on_rollback(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.rollback = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }
}

/// Result of checking an inbound event against pending edits.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConflictOutcome {
    NoConflict,
    Resolved {
        operation_id: String,
        resolution: Resolution,
    },
}

impl ConflictOutcome {
    /// Whether the inbound event should reach subscribers.
    #[must_use]
    pub fn admits(&self) -> bool {
        !matches!(
            self,
            Self::Resolved {
                resolution: Resolution::Reject,
                ..
            }
        )
    }
}

/// Turn the remote outcome into the caller's result, rolling back on error.
fn reconcile(
    outcome: Result<Result<RemoteResult, SyncError>, Elapsed>,
    timeout: Duration,
    operation_id: &str,
    resource_id: &str,
    kind: OperationKind,
    rollback: Option<LocalFn>,
) -> Result<Option<Value>, SyncError> {
    let error = match outcome {
        Ok(Ok(result)) if result.is_success(kind) => {
            debug!(%operation_id, %resource_id, %kind, "optimistic update confirmed");
            return Ok(match kind {
                OperationKind::Delete => None,
                _ => result.data,
            });
        }
        Ok(Ok(result)) => SyncError::RemoteRejection {
            operation_id: operation_id.to_owned(),
            message: result
                .error
                .unwrap_or_else(|| "server rejected the change".to_owned()),
        },
        Ok(Err(e)) => e,
        Err(_) => SyncError::Timeout {
            operation_id: operation_id.to_owned(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        },
    };

    warn!(%operation_id, %resource_id, %kind, error = %error, "rolling back optimistic update");
    if let Some(rollback) = rollback {
        rollback();
    }
    Err(error)
}

// =============================================================================
// COORDINATOR
// =============================================================================

type SlotKey = (String, OperationKind);

struct Inner {
    pending: Mutex<Vec<PendingUpdate>>,
    slots: Mutex<HashMap<SlotKey, Arc<Semaphore>>>,
    policy: Arc<dyn ConflictPolicy>,
    timeout: Duration,
}

#[derive(Clone)]
pub struct OptimisticCoordinator {
    inner: Arc<Inner>,
}

impl OptimisticCoordinator {
    #[must_use]
    pub fn new(config: &OptimisticConfig) -> Self {
        Self::with_policy(config, Arc::new(ThresholdPolicy::from(config)))
    }

    #[must_use]
    pub fn with_policy(config: &OptimisticConfig, policy: Arc<dyn ConflictPolicy>) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(Vec::new()),
                slots: Mutex::new(HashMap::new()),
                policy,
                timeout: config.timeout,
            }),
        }
    }

    /// Apply `update` locally, run `remote` and reconcile.
    ///
    /// Returns the canonical data on success (`None` for deletes).
    ///
    /// # Errors
    ///
    /// - [`SyncError::DuplicateOperation`] if the operation id is already pending.
    /// - [`SyncError::RemoteRejection`] if the server reported failure.
    /// - [`SyncError::Timeout`] if `remote` did not settle in time.
    /// - Any error `remote` itself returns.
    ///
    /// The rollback runs exactly once for every error after registration.
    /// Dropping the returned future does not cancel the remote call or the
    /// safety timer; the edit still settles and rolls back on failure.
    pub async fn apply<F, Fut>(
        &self,
        update: OptimisticUpdate,
        remote: F,
    ) -> Result<Option<Value>, SyncError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<RemoteResult, SyncError>> + Send + 'static,
    {
        let OptimisticUpdate {
            operation_id,
            resource_id,
            kind,
            snapshot,
            apply_local,
            rollback,
        } = update;

        if self.is_pending(&operation_id) {
            return Err(SyncError::DuplicateOperation(operation_id));
        }

        let slot = self.acquire_slot(&resource_id, kind).await?;
        let registration = self.register(PendingUpdate {
            operation_id: operation_id.clone(),
            resource_id: resource_id.clone(),
            kind,
            snapshot,
            submitted_at: Instant::now(),
        })?;

        if let Some(apply_local) = apply_local {
            apply_local();
        }

        // Settles on its own task; dropping the caller does not cancel it.
        let timeout = self.inner.timeout;
        let settle = tokio::spawn(async move {
            let _slot = slot;
            let outcome = tokio::time::timeout(timeout, remote()).await;
            drop(registration);
            reconcile(outcome, timeout, &operation_id, &resource_id, kind, rollback)
        });
        settle.await.map_err(|e| {
            warn!(error = %e, "optimistic settle task failed");
            SyncError::EngineStopped
        })?
    }

    /// Resolve an inbound event against pending edits.
    pub fn handle_realtime_update(&self, event: &BoardEvent) -> ConflictOutcome {
        self.handle_realtime_update_at(event, Instant::now())
    }

    pub(crate) fn handle_realtime_update_at(
        &self,
        event: &BoardEvent,
        now: Instant,
    ) -> ConflictOutcome {
        let Some(resource_id) = event.resource_id() else {
            return ConflictOutcome::NoConflict;
        };

        let mut pending = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(index) = pending.iter().position(|p| p.resource_id == resource_id) else {
            return ConflictOutcome::NoConflict;
        };

        let entry = &pending[index];
        let elapsed = now.saturating_duration_since(entry.submitted_at);
        let resolution = self.inner.policy.resolve(entry.kind, elapsed);
        let operation_id = entry.operation_id.clone();
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);

        match resolution {
            Resolution::Reject => {
                debug!(
                    %operation_id,
                    resource_id,
                    event = %event.kind(),
                    elapsed_ms,
                    "conflict rejected inbound event"
                );
            }
            // TODO(field-merge): reconcile individual fields once merge
            // semantics exist; until then merge behaves like accept.
            Resolution::Accept | Resolution::Merge => {
                pending.remove(index);
                info!(
                    %operation_id,
                    resource_id,
                    event = %event.kind(),
                    elapsed_ms,
                    ?resolution,
                    "conflict accepted inbound event"
                );
            }
        }

        ConflictOutcome::Resolved {
            operation_id,
            resolution,
        }
    }

    #[must_use]
    pub fn is_pending(&self, operation_id: &str) -> bool {
        self.lock_pending()
            .iter()
            .any(|p| p.operation_id == operation_id)
    }

    #[must_use]
    pub fn pending(&self) -> Vec<PendingUpdate> {
        self.lock_pending().clone()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Rough bytes held by pending records.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        self.lock_pending()
            .iter()
            .map(|p| {
                std::mem::size_of::<PendingUpdate>()
                    + p.operation_id.len()
                    + p.resource_id.len()
                    + p.snapshot.as_ref().map_or(0, |s| s.to_string().len())
            })
            .sum()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Vec<PendingUpdate>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, update: PendingUpdate) -> Result<Registration, SyncError> {
        let mut pending = self.lock_pending();
        if pending.iter().any(|p| p.operation_id == update.operation_id) {
            return Err(SyncError::DuplicateOperation(update.operation_id));
        }
        let operation_id = update.operation_id.clone();
        pending.push(update);
        Ok(Registration {
            coordinator: self.clone(),
            operation_id,
        })
    }

    fn clear(&self, operation_id: &str) {
        self.lock_pending().retain(|p| p.operation_id != operation_id);
    }

    async fn acquire_slot(
        &self,
        resource_id: &str,
        kind: OperationKind,
    ) -> Result<SlotGuard, SyncError> {
        let key = (resource_id.to_owned(), kind);
        let semaphore = {
            let mut slots = self
                .inner
                .slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(
                slots
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Semaphore::new(1))),
            )
        };
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| SyncError::EngineStopped)?;
        Ok(SlotGuard {
            coordinator: self.clone(),
            key,
            permit: Some(permit),
        })
    }
}

impl EventInterceptor for OptimisticCoordinator {
    fn admit(&self, event: &InboundEvent) -> bool {
        self.handle_realtime_update_at(&event.event, event.received_at)
            .admits()
    }
}

/// Removes the pending record however the settle task exits.
struct Registration {
    coordinator: OptimisticCoordinator,
    operation_id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.coordinator.clear(&self.operation_id);
    }
}

/// Holds the per-resource slot; drops the semaphore once nobody waits on it.
struct SlotGuard {
    coordinator: OptimisticCoordinator,
    key: SlotKey,
    permit: Option<OwnedSemaphorePermit>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        drop(self.permit.take());
        let mut slots = self
            .coordinator
            .inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slots
            .get(&self.key)
            .is_some_and(|s| Arc::strong_count(s) == 1)
        {
            slots.remove(&self.key);
        }
    }
}

#[cfg(test)]
#[path = "optimistic_test.rs"]
mod tests;
