//! Session registry keyed by `(session_id, board_id)`.
//!
//! A board view mounts with [`SessionRegistry::get_or_open`] and unmounts
//! with [`SessionRegistry::close`]. There is no ambient per-board singleton:
//! two sessions on the same board are two independent connections.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::presence::LocalUser;
use crate::session::{BoardSession, SessionDeps, SessionKey};

pub struct SessionRegistry {
    config: SyncConfig,
    deps: SessionDeps,
    sessions: Mutex<HashMap<SessionKey, Arc<BoardSession>>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new(config: SyncConfig, deps: SessionDeps) -> Self {
        Self {
            config,
            deps,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The live session for `key`, opening one if needed. A newly opened
    /// session is not connected yet.
    ///
    /// # Errors
    ///
    /// See [`BoardSession::open`].
    pub fn get_or_open(
        &self,
        key: &SessionKey,
        credential: &str,
        local: LocalUser,
    ) -> Result<Arc<BoardSession>, SyncError> {
        let mut sessions = self.lock();
        if let Some(session) = sessions.get(key) {
            return Ok(Arc::clone(session));
        }
        let session = Arc::new(BoardSession::open(
            key.clone(),
            credential,
            local,
            &self.config,
            self.deps.clone(),
        )?);
        sessions.insert(key.clone(), Arc::clone(&session));
        Ok(session)
    }

    #[must_use]
    pub fn get(&self, key: &SessionKey) -> Option<Arc<BoardSession>> {
        self.lock().get(key).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove `key` and close its connection cleanly. Returns whether a
    /// session was registered.
    pub async fn close(&self, key: &SessionKey) -> bool {
        let Some(session) = self.lock().remove(key) else {
            return false;
        };
        shutdown(&session).await;
        true
    }

    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.lock().drain().map(|(_, s)| s).collect();
        for session in &sessions {
            shutdown(session).await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionKey, Arc<BoardSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn shutdown(session: &BoardSession) {
    match session.disconnect().await {
        Ok(()) => info!(session = %session.key(), "board session closed"),
        Err(e) => warn!(session = %session.key(), error = %e, "board session close failed"),
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
