//! Error taxonomy for the sync engine.
//!
//! ERROR HANDLING
//! ==============
//! Only [`SyncError`] ever reaches callers. Transport failures are absorbed
//! by the reconnection policy and show up as connection-state changes;
//! validation failures are logged and the message is dropped. Conflict
//! outcomes are decisions, not errors, and live in [`crate::conflict`].

use frames::CodecError;

/// Grepable error code, retryable flag and a message suitable for a
/// non-technical notification.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }

    fn user_message(&self) -> String {
        self.to_string()
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("handshake timed out after {0}ms")]
    HandshakeTimeout(u64),
    #[error("invalid base url: {0}")]
    InvalidBaseUrl(String),
}

impl ErrorCode for TransportError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidBaseUrl(_) => "E_INVALID_BASE_URL",
            Self::HandshakeTimeout(_) => "E_HANDSHAKE_TIMEOUT",
            _ => "E_TRANSPORT",
        }
    }

    fn retryable(&self) -> bool {
        !matches!(self, Self::InvalidBaseUrl(_))
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error(transparent)]
    Envelope(#[from] CodecError),
    #[error("unknown event type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {source}")]
    Payload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl ErrorCode for ValidationError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Envelope(_) => "E_INVALID_ENVELOPE",
            Self::UnknownType(_) => "E_UNKNOWN_TYPE",
            Self::Payload { .. } => "E_INVALID_PAYLOAD",
        }
    }
}

// =============================================================================
// CALLER-FACING
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("connection is closed after exhausting reconnect attempts")]
    ConnectionClosed,
    #[error("sync engine is no longer running")]
    EngineStopped,
    #[error("operation {operation_id} rejected: {message}")]
    RemoteRejection { operation_id: String, message: String },
    #[error("operation {operation_id} timed out after {timeout_ms}ms")]
    Timeout { operation_id: String, timeout_ms: u64 },
    #[error("operation {0} is already pending")]
    DuplicateOperation(String),
    #[error("persistence request failed: {0}")]
    Http(#[from] reqwest::Error),
}

impl ErrorCode for SyncError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Transport(e) => e.error_code(),
            Self::ConnectionClosed => "E_CONNECTION_CLOSED",
            Self::EngineStopped => "E_ENGINE_STOPPED",
            Self::RemoteRejection { .. } => "E_REMOTE_REJECTED",
            Self::Timeout { .. } => "E_TIMEOUT",
            Self::DuplicateOperation(_) => "E_DUPLICATE_OPERATION",
            Self::Http(_) => "E_HTTP",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Transport(e) => e.retryable(),
            Self::ConnectionClosed | Self::Timeout { .. } | Self::Http(_) => true,
            Self::EngineStopped | Self::RemoteRejection { .. } | Self::DuplicateOperation(_) => {
                false
            }
        }
    }

    fn user_message(&self) -> String {
        match self {
            Self::RemoteRejection { message, .. } => {
                format!("Your change could not be saved: {message}")
            }
            Self::Timeout { .. } => {
                "Your change could not be saved in time and was reverted.".to_owned()
            }
            Self::Http(_) => "Your change could not be saved. Check your connection.".to_owned(),
            Self::ConnectionClosed | Self::Transport(_) => {
                "Lost connection to the board. Reconnect to continue.".to_owned()
            }
            Self::DuplicateOperation(_) => "This change is already being saved.".to_owned(),
            Self::EngineStopped => "The board session has ended.".to_owned(),
        }
    }
}

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;
