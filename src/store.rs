//! Persistence API consumed by optimistic edits.
//!
//! The engine imposes no schema on mutation payloads; it only needs to know
//! which collection a resource lives in and whether the server accepted the
//! change. [`HttpStore`] speaks the board REST API. A 2xx body is either a
//! `{ success, data, error }` result or the canonical object itself.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{SyncError, TransportError};
use crate::optimistic::{OperationKind, RemoteResult};

const REQUEST_TIMEOUT_SECS: u64 = 20;
const CONNECT_TIMEOUT_SECS: u64 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Task,
    Column,
    Board,
}

impl ResourceKind {
    /// REST collection under a board, `None` for the board itself.
    #[must_use]
    pub fn collection(self) -> Option<&'static str> {
        match self {
            Self::Task => Some("tasks"),
            Self::Column => Some("columns"),
            Self::Board => None,
        }
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "task" | "tasks" => Ok(Self::Task),
            "column" | "columns" => Ok(Self::Column),
            "board" => Ok(Self::Board),
            other => Err(format!("unknown resource kind: {other}")),
        }
    }
}

/// One change sent to the persistence API.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Mutation {
    pub resource: ResourceKind,
    pub resource_id: String,
    pub kind: OperationKind,
    pub payload: Value,
}

impl Mutation {
    pub fn new(
        resource: ResourceKind,
        resource_id: impl Into<String>,
        kind: OperationKind,
        payload: Value,
    ) -> Self {
        Self {
            resource,
            resource_id: resource_id.into(),
            kind,
            payload,
        }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Run `mutation` against `board_id`.
    ///
    /// A server-side refusal is `Ok` with `success == false`; `Err` is
    /// reserved for requests that never produced a response.
    async fn execute(&self, board_id: &str, mutation: &Mutation)
    -> Result<RemoteResult, SyncError>;
}

// =============================================================================
// HTTP
// =============================================================================

pub struct HttpStore {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpStore {
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidBaseUrl`] if `base_url` is not an
    /// absolute http(s) URL, or [`SyncError::Http`] if the client cannot be
    /// built.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, SyncError> {
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| TransportError::InvalidBaseUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() || !matches!(base_url.scheme(), "http" | "https") {
            return Err(TransportError::InvalidBaseUrl(base_url.to_string()).into());
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    /// Method and URL for `mutation` on `board_id`.
    pub(crate) fn endpoint(&self, board_id: &str, mutation: &Mutation) -> (Method, Url) {
        let mut url = self.base_url.clone();
        let mut segments: Vec<&str> = vec!["api", "board"];

        let method = match mutation.resource.collection() {
            Some(collection) => {
                segments.extend([board_id, collection]);
                match mutation.kind {
                    OperationKind::Create => Method::POST,
                    OperationKind::Update => {
                        segments.push(&mutation.resource_id);
                        Method::PATCH
                    }
                    OperationKind::Delete => {
                        segments.push(&mutation.resource_id);
                        Method::DELETE
                    }
                    OperationKind::Move => {
                        segments.extend([mutation.resource_id.as_str(), "move"]);
                        Method::POST
                    }
                }
            }
            None => match mutation.kind {
                OperationKind::Create => Method::POST,
                OperationKind::Update | OperationKind::Move => {
                    segments.push(board_id);
                    Method::PATCH
                }
                OperationKind::Delete => {
                    segments.push(board_id);
                    Method::DELETE
                }
            },
        };

        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        (method, url)
    }
}

#[async_trait]
impl RemoteStore for HttpStore {
    async fn execute(
        &self,
        board_id: &str,
        mutation: &Mutation,
    ) -> Result<RemoteResult, SyncError> {
        let (method, url) = self.endpoint(board_id, mutation);
        debug!(%method, %url, resource_id = %mutation.resource_id, "persistence request");

        let mut request = self.http.request(method, url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if mutation.kind != OperationKind::Delete {
            request = request.json(&mutation.payload);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let message = error_text(&body).unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            warn!(
                status = status.as_u16(),
                resource_id = %mutation.resource_id,
                kind = %mutation.kind,
                error = %message,
                "persistence request rejected"
            );
            return Ok(RemoteResult::rejected(message));
        }

        Ok(parse_success_body(&body))
    }
}

/// Interpret a 2xx body: an explicit result envelope, a bare canonical
/// object, or nothing.
fn parse_success_body(body: &str) -> RemoteResult {
    if body.trim().is_empty() {
        return RemoteResult::done();
    }
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return RemoteResult::done();
    };
    if value.get("success").is_some_and(Value::is_boolean) {
        if let Ok(result) = serde_json::from_value::<RemoteResult>(value.clone()) {
            return result;
        }
    }
    RemoteResult::ok(value)
}

fn error_text(body: &str) -> Option<String> {
    let value = serde_json::from_str::<Value>(body).ok()?;
    ["error", "message"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .filter(|s| !s.trim().is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
#[path = "store_test.rs"]
mod tests;
