//! Typed board events.
//!
//! DESIGN
//! ======
//! The wire carries `{ type, data }` with an untyped payload. Each known
//! `type` maps to one [`BoardEvent`] variant with its own payload struct, so
//! subscribers match on shape instead of probing JSON. Payload structs keep
//! unknown attributes in a flattened `fields` map: the server owns the schema
//! and the engine only needs ids to route and resolve conflicts.
//!
//! Ids arrive as strings from some producers and integers from others; both
//! are normalized to `String`. camelCase aliases are accepted everywhere;
//! when a payload carries several keys for one field the most specific wins
//! (`toColumnId` over `columnId`, `user_id` over `userId` over `id`).

use std::fmt;

use frames::Envelope;
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::error::ValidationError;

// =============================================================================
// EVENT KIND
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Ping,
    Pong,
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
    TaskMoved,
    ColumnCreated,
    ColumnUpdated,
    ColumnDeleted,
    BoardUpdated,
    UserJoined,
    UserLeft,
    UserActivity,
}

impl EventKind {
    pub const ALL: [Self; 13] = [
        Self::Ping,
        Self::Pong,
        Self::TaskCreated,
        Self::TaskUpdated,
        Self::TaskDeleted,
        Self::TaskMoved,
        Self::ColumnCreated,
        Self::ColumnUpdated,
        Self::ColumnDeleted,
        Self::BoardUpdated,
        Self::UserJoined,
        Self::UserLeft,
        Self::UserActivity,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::TaskCreated => "task:created",
            Self::TaskUpdated => "task:updated",
            Self::TaskDeleted => "task:deleted",
            Self::TaskMoved => "task:moved",
            Self::ColumnCreated => "column:created",
            Self::ColumnUpdated => "column:updated",
            Self::ColumnDeleted => "column:deleted",
            Self::BoardUpdated => "board:updated",
            Self::UserJoined => "user:joined",
            Self::UserLeft => "user:left",
            Self::UserActivity => "user:activity",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// Heartbeat traffic handled by the connection itself.
    #[must_use]
    pub fn is_control(self) -> bool {
        matches!(self, Self::Ping | Self::Pong)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// PAYLOADS
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(
        default,
        alias = "columnId",
        deserialize_with = "de_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub column_id: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskMovedPayload {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(alias = "columnId", alias = "toColumnId", deserialize_with = "de_id")]
    pub column_id: String,
    #[serde(
        default,
        alias = "fromColumnId",
        deserialize_with = "de_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub from_column_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedPayload {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnPayload {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoardPayload {
    #[serde(
        default,
        deserialize_with = "de_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// A user announcing itself on the board. Attributes other than the id are
/// optional; missing ones are resolved through the user directory.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPayload {
    #[serde(alias = "userId", alias = "id", deserialize_with = "de_id")]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, alias = "avatarUrl", skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl UserPayload {
    /// Whether the payload already carries everything presence displays.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.name.as_deref().is_some_and(|n| !n.trim().is_empty())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    #[serde(alias = "userId", alias = "id", deserialize_with = "de_id")]
    pub user_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserActivityPayload {
    #[serde(alias = "userId", alias = "id", deserialize_with = "de_id")]
    pub user_id: String,
    /// Producer-side activity time in epoch milliseconds, if sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<i64>,
}

// =============================================================================
// BOARD EVENT
// =============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum BoardEvent {
    Ping(Value),
    Pong(Value),
    TaskCreated(TaskPayload),
    TaskUpdated(TaskPayload),
    TaskDeleted(DeletedPayload),
    TaskMoved(TaskMovedPayload),
    ColumnCreated(ColumnPayload),
    ColumnUpdated(ColumnPayload),
    ColumnDeleted(DeletedPayload),
    BoardUpdated(BoardPayload),
    UserJoined(UserPayload),
    UserLeft(UserRef),
    UserActivity(UserActivityPayload),
}

impl BoardEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Ping(_) => EventKind::Ping,
            Self::Pong(_) => EventKind::Pong,
            Self::TaskCreated(_) => EventKind::TaskCreated,
            Self::TaskUpdated(_) => EventKind::TaskUpdated,
            Self::TaskDeleted(_) => EventKind::TaskDeleted,
            Self::TaskMoved(_) => EventKind::TaskMoved,
            Self::ColumnCreated(_) => EventKind::ColumnCreated,
            Self::ColumnUpdated(_) => EventKind::ColumnUpdated,
            Self::ColumnDeleted(_) => EventKind::ColumnDeleted,
            Self::BoardUpdated(_) => EventKind::BoardUpdated,
            Self::UserJoined(_) => EventKind::UserJoined,
            Self::UserLeft(_) => EventKind::UserLeft,
            Self::UserActivity(_) => EventKind::UserActivity,
        }
    }

    /// Id of the task, column or board this event mutates. `None` for
    /// heartbeat and presence traffic.
    #[must_use]
    pub fn resource_id(&self) -> Option<&str> {
        match self {
            Self::TaskCreated(p) | Self::TaskUpdated(p) => Some(&p.id),
            Self::TaskMoved(p) => Some(&p.id),
            Self::TaskDeleted(p) | Self::ColumnDeleted(p) => Some(&p.id),
            Self::ColumnCreated(p) | Self::ColumnUpdated(p) => Some(&p.id),
            Self::BoardUpdated(p) => p.id.as_deref(),
            Self::Ping(_)
            | Self::Pong(_)
            | Self::UserJoined(_)
            | Self::UserLeft(_)
            | Self::UserActivity(_) => None,
        }
    }

    /// Parse a validated envelope into its typed form.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::UnknownType`] for types outside the board
    /// protocol and [`ValidationError::Payload`] when `data` does not match
    /// the type's shape.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, ValidationError> {
        let Some(kind) = EventKind::parse(&envelope.kind) else {
            return Err(ValidationError::UnknownType(envelope.kind.clone()));
        };
        let data = &envelope.data;

        let event = match kind {
            EventKind::Ping => Self::Ping(data.clone()),
            EventKind::Pong => Self::Pong(data.clone()),
            EventKind::TaskCreated => Self::TaskCreated(payload(kind, data)?),
            EventKind::TaskUpdated => Self::TaskUpdated(payload(kind, data)?),
            EventKind::TaskDeleted => Self::TaskDeleted(payload(kind, data)?),
            EventKind::TaskMoved => Self::TaskMoved(payload(kind, data)?),
            EventKind::ColumnCreated => Self::ColumnCreated(payload(kind, data)?),
            EventKind::ColumnUpdated => Self::ColumnUpdated(payload(kind, data)?),
            EventKind::ColumnDeleted => Self::ColumnDeleted(payload(kind, data)?),
            EventKind::BoardUpdated => Self::BoardUpdated(payload(kind, data)?),
            EventKind::UserJoined => Self::UserJoined(payload(kind, data)?),
            EventKind::UserLeft => Self::UserLeft(payload(kind, data)?),
            EventKind::UserActivity => Self::UserActivity(payload(kind, data)?),
        };
        Ok(event)
    }

    /// Encode back into a wire envelope stamped with the current time.
    #[must_use]
    pub fn to_envelope(&self) -> Envelope {
        let data = match self {
            Self::Ping(v) | Self::Pong(v) => v.clone(),
            Self::TaskCreated(p) | Self::TaskUpdated(p) => to_value(p),
            Self::TaskMoved(p) => to_value(p),
            Self::TaskDeleted(p) | Self::ColumnDeleted(p) => to_value(p),
            Self::ColumnCreated(p) | Self::ColumnUpdated(p) => to_value(p),
            Self::BoardUpdated(p) => to_value(p),
            Self::UserJoined(p) => to_value(p),
            Self::UserLeft(p) => to_value(p),
            Self::UserActivity(p) => to_value(p),
        };
        Envelope::new(self.kind().as_str(), data)
    }
}

fn payload<T: serde::de::DeserializeOwned>(
    kind: EventKind,
    data: &Value,
) -> Result<T, ValidationError> {
    let folds = key_folds(kind);
    let result = match data {
        Value::Object(map) if needs_folding(map, folds) => {
            let mut map = map.clone();
            for (field, keys) in folds {
                fold_keys(&mut map, field, keys);
            }
            T::deserialize(Value::Object(map))
        }
        _ => T::deserialize(data),
    };
    result.map_err(|source| ValidationError::Payload {
        kind: kind.as_str(),
        source,
    })
}

type KeyFold = (&'static str, &'static [&'static str]);

const USER_FOLDS: &[KeyFold] = &[
    ("user_id", &["user_id", "userId", "id"]),
    ("avatar_url", &["avatar_url", "avatarUrl"]),
];
const TASK_FOLDS: &[KeyFold] = &[("column_id", &["column_id", "columnId"])];
const TASK_MOVED_FOLDS: &[KeyFold] = &[
    ("column_id", &["toColumnId", "column_id", "columnId"]),
    ("from_column_id", &["from_column_id", "fromColumnId"]),
];

/// Wire keys that name the same field, most specific first.
fn key_folds(kind: EventKind) -> &'static [KeyFold] {
    match kind {
        EventKind::TaskCreated | EventKind::TaskUpdated => TASK_FOLDS,
        EventKind::TaskMoved => TASK_MOVED_FOLDS,
        EventKind::UserJoined | EventKind::UserLeft | EventKind::UserActivity => USER_FOLDS,
        _ => &[],
    }
}

fn needs_folding(map: &Map<String, Value>, folds: &[KeyFold]) -> bool {
    folds
        .iter()
        .any(|(_, keys)| keys.iter().filter(|k| map.contains_key(**k)).count() > 1)
}

/// Keep the first non-null key of `keys` under `field` and drop the rest.
fn fold_keys(map: &mut Map<String, Value>, field: &str, keys: &[&str]) {
    let mut chosen = None;
    for key in keys {
        if let Some(value) = map.remove(*key) {
            if chosen.is_none() && !value.is_null() {
                chosen = Some(value);
            }
        }
    }
    if let Some(value) = chosen {
        map.insert(field.to_owned(), value);
    }
}

fn to_value<T: Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

/// A routed event with its wire timestamp and local arrival time.
#[derive(Clone, Debug)]
pub struct InboundEvent {
    pub event: BoardEvent,
    pub timestamp: Option<i64>,
    pub received_at: Instant,
}

impl InboundEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}

/// Heartbeat traffic handed back to the connection driver.
#[derive(Clone, Debug, PartialEq)]
pub enum Control {
    Ping(Value),
    Pong(Value),
}

// =============================================================================
// ID DESERIALIZATION
// =============================================================================

fn id_from_value<E: de::Error>(value: Value) -> Result<String, E> {
    match value {
        Value::String(s) if !s.is_empty() => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(E::custom(format!(
            "expected non-empty string or number id, got {other}"
        ))),
    }
}

fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    id_from_value(Value::deserialize(deserializer)?)
}

fn de_opt_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        other => id_from_value(other).map(Some),
    }
}

#[cfg(test)]
#[path = "event_test.rs"]
mod tests;
