//! Real-time synchronization engine for collaborative boards.
//!
//! A [`BoardSession`] keeps one client converged on the shared state of a
//! board: it holds the board socket open, routes typed broadcast events to
//! subscribers, applies local edits optimistically and reconciles them with
//! the persistence API, tracks who else is viewing the board and scores the
//! session's health.
//!
//! ## Module layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`connection`] | Socket state machine, backoff, heartbeat, rate-limited outbound queue |
//! | [`router`] | Inbound validation and per-type fan-out |
//! | [`event`] | Typed board events |
//! | [`optimistic`] | Pending edits, rollback, conflict suppression |
//! | [`conflict`] | Per-operation conflict policy |
//! | [`presence`] | Presence set and user attribute lookup |
//! | [`health`] | Periodic health score |
//! | [`store`] | Persistence API adapter |
//! | [`session`] | Presentation-layer facade |
//! | [`registry`] | Sessions keyed by `(session_id, board_id)` |
//! | [`telemetry`] | Rolling performance windows |
//! | [`config`] | Defaults and `BOARDSYNC_*` overrides |
//! | [`error`] | Error taxonomy and codes |

pub mod config;
pub mod conflict;
pub mod connection;
pub mod error;
pub mod event;
pub mod health;
pub mod optimistic;
pub mod presence;
pub mod registry;
pub mod router;
pub mod session;
pub mod store;
pub mod subscription;
pub mod telemetry;

#[cfg(test)]
mod test_helpers;

pub use config::SyncConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{ErrorCode, SyncError};
pub use event::{BoardEvent, EventKind, InboundEvent};
pub use health::{HealthReport, HealthStatus};
pub use optimistic::{OperationKind, OptimisticCoordinator, RemoteResult};
pub use presence::{LocalUser, PresenceEntry};
pub use registry::SessionRegistry;
pub use session::{BoardSession, Edit, SessionDeps, SessionKey};
pub use store::ResourceKind;
pub use subscription::Subscription;
