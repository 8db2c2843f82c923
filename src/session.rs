//! Board session: the presentation-layer entry point.
//!
//! ARCHITECTURE
//! ============
//! One [`BoardSession`] per `(session_id, board_id)` owns a connection
//! manager, the event router feeding it, the optimistic coordinator (also
//! installed as a router interceptor), the presence tracker and the health
//! monitor. Views subscribe to typed events and submit edits; everything else
//! is internal wiring.
//!
//! Dropping the session stops its driver and monitor tasks. Call
//! [`BoardSession::disconnect`] first for a clean close.

use std::fmt;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::info;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::connection::transport::{Transport, WsTransport, board_ws_url};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{SyncError, TransportError};
use crate::event::{EventKind, InboundEvent};
use crate::health::{HealthMonitor, HealthReport, HealthSources};
use crate::optimistic::{OperationKind, OptimisticCoordinator, OptimisticUpdate, PendingUpdate};
use crate::presence::lookup::{HttpUserDirectory, UserDirectory, UserLookup};
use crate::presence::{LocalUser, PresenceEntry, PresenceTracker};
use crate::router::EventRouter;
use crate::store::{HttpStore, Mutation, RemoteStore, ResourceKind};
use crate::subscription::Subscription;
use crate::telemetry::{Telemetry, TelemetrySnapshot};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub session_id: String,
    pub board_id: String,
}

impl SessionKey {
    pub fn new(session_id: impl Into<String>, board_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            board_id: board_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.board_id)
    }
}

/// External collaborators a session talks to.
#[derive(Clone)]
pub struct SessionDeps {
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn RemoteStore>,
    /// Without a directory, presence keeps only what join events carry.
    pub directory: Option<Arc<dyn UserDirectory>>,
}

impl SessionDeps {
    /// WebSocket transport plus HTTP store and directory against `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidBaseUrl`] for a non-http(s) base and
    /// [`SyncError::Http`] if an HTTP client cannot be built.
    pub fn http(base_url: &str, token: Option<String>) -> Result<Self, SyncError> {
        let store = HttpStore::new(base_url, token.clone())?;
        let directory = HttpUserDirectory::new(base_url, token)
            .map_err(|e| TransportError::InvalidBaseUrl(e.to_string()))?;
        Ok(Self {
            transport: Arc::new(WsTransport),
            store: Arc::new(store),
            directory: Some(Arc::new(directory)),
        })
    }
}

type LocalFn = Box<dyn FnOnce() + Send>;

/// An edit submitted from the presentation layer.
pub struct Edit {
    operation_id: String,
    mutation: Mutation,
    snapshot: Option<Value>,
    apply_local: Option<LocalFn>,
    rollback: Option<LocalFn>,
}

impl Edit {
    /// A new edit with a generated operation id.
    pub fn new(
        resource: ResourceKind,
        resource_id: impl Into<String>,
        kind: OperationKind,
        payload: Value,
    ) -> Self {
        Self {
            operation_id: Uuid::new_v4().to_string(),
            mutation: Mutation::new(resource, resource_id, kind, payload),
            snapshot: None,
            apply_local: None,
            rollback: None,
        }
    }

    #[must_use]
    pub fn with_operation_id(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = operation_id.into();
        self
    }

    #[must_use]
    pub fn snapshot(mut self, snapshot: Value) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    #[must_use]
    pub fn apply_local(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.apply_local = Some(Box::new(f));
        self
    }

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

// =============================================================================
// SESSION
// =============================================================================

pub struct BoardSession {
    key: SessionKey,
    local_user_id: String,
    connection: ConnectionManager,
    router: Arc<EventRouter>,
    coordinator: OptimisticCoordinator,
    presence: Arc<PresenceTracker>,
    health: HealthMonitor,
    telemetry: Arc<Telemetry>,
    store: Arc<dyn RemoteStore>,
}

impl BoardSession {
    /// Wire up a session. Nothing is opened until [`Self::connect`].
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidBaseUrl`] if the configured base URL
    /// cannot be turned into a socket URL.
    pub fn open(
        key: SessionKey,
        credential: &str,
        local: LocalUser,
        config: &SyncConfig,
        deps: SessionDeps,
    ) -> Result<Self, SyncError> {
        let url = board_ws_url(&config.connection.base_url, &key.board_id, credential)?;

        let telemetry = Arc::new(Telemetry::new());
        let router = Arc::new(EventRouter::new(Arc::clone(&telemetry)));
        let coordinator = OptimisticCoordinator::new(&config.optimistic);
        router.add_interceptor(Arc::new(coordinator.clone()));

        let connection = ConnectionManager::spawn(
            &key.board_id,
            url,
            &config.connection,
            deps.transport,
            Arc::clone(&router),
            Arc::clone(&telemetry),
        );

        let lookup = deps
            .directory
            .map(|directory| Arc::new(UserLookup::new(directory, &config.presence)));
        let local_user_id = local.user_id.clone();
        let presence = Arc::new(PresenceTracker::attach(
            &key.board_id,
            local,
            &router,
            &connection,
            lookup,
        ));

        let health = HealthMonitor::spawn(
            &key.board_id,
            &config.health,
            HealthSources {
                telemetry: Arc::clone(&telemetry),
                state: connection.watch_state(),
                coordinator: coordinator.clone(),
                presence: Some(Arc::clone(&presence)),
            },
        );

        info!(session_id = %key.session_id, board_id = %key.board_id, "board session opened");
        Ok(Self {
            key,
            local_user_id,
            connection,
            router,
            coordinator,
            presence,
            health,
            telemetry,
            store: deps.store,
        })
    }

    #[must_use]
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// # Errors
    ///
    /// Returns [`SyncError::EngineStopped`] if the connection driver exited.
    pub fn connect(&self) -> Result<(), SyncError> {
        self.connection.connect()
    }

    /// Close cleanly. Presence is cleared; pending edits settle on their own.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::EngineStopped`] if the connection driver exited.
    pub async fn disconnect(&self) -> Result<(), SyncError> {
        self.connection.disconnect().await
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub fn on_status_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.connection.on_status_change(handler)
    }

    /// Receive every admitted event of `kind`, in arrival order.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> Subscription
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        self.router.on(kind, handler)
    }

    /// Apply `edit` optimistically and persist it.
    ///
    /// Resolves to the canonical object (`None` for deletes).
    ///
    /// # Errors
    ///
    /// Any [`SyncError`] from [`OptimisticCoordinator::apply`]; the local
    /// change has been rolled back by then. Use
    /// [`crate::ErrorCode::user_message`] for the notification text.
    pub async fn submit_edit(&self, edit: Edit) -> Result<Option<Value>, SyncError> {
        let Edit {
            operation_id,
            mutation,
            snapshot,
            apply_local,
            rollback,
        } = edit;

        let mut update =
            OptimisticUpdate::new(operation_id, mutation.resource_id.clone(), mutation.kind);
        if let Some(snapshot) = snapshot {
            update = update.snapshot(snapshot);
        }
        if let Some(apply_local) = apply_local {
            update = update.apply_local(apply_local);
        }
        if let Some(rollback) = rollback {
            update = update.on_rollback(rollback);
        }

        let store = Arc::clone(&self.store);
        let board_id = self.key.board_id.clone();
        self.coordinator
            .apply(update, move || async move {
                store.execute(&board_id, &mutation).await
            })
            .await
    }

    /// Mark the local user active and tell the board.
    ///
    /// # Errors
    ///
    /// See [`ConnectionManager::send_envelope`].
    pub async fn report_activity(&self) -> Result<(), SyncError> {
        self.presence.touch_self();
        self.connection
            .send(
                EventKind::UserActivity.as_str(),
                json!({ "userId": self.local_user_id, "at": frames::now_ms() }),
            )
            .await
    }

    #[must_use]
    pub fn presence(&self) -> Vec<PresenceEntry> {
        self.presence.snapshot()
    }

    pub fn on_presence_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Vec<PresenceEntry>) + Send + Sync + 'static,
    {
        self.presence.on_change(handler)
    }

    #[must_use]
    pub fn latest_health(&self) -> HealthReport {
        self.health.latest()
    }

    pub fn on_health<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&HealthReport) + Send + Sync + 'static,
    {
        self.health.on_report(handler)
    }

    #[must_use]
    pub fn pending_updates(&self) -> Vec<PendingUpdate> {
        self.coordinator.pending()
    }

    #[must_use]
    pub fn telemetry(&self) -> TelemetrySnapshot {
        self.telemetry.snapshot()
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
