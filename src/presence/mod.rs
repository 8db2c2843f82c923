//! Presence tracker: who is viewing the board right now.
//!
//! DESIGN
//! ======
//! Presence lives exactly as long as the connection. The local user is
//! inserted the moment the connection starts opening, so self-presence never
//! waits on the network. Remote users arrive via `user:joined`, leave via
//! `user:left` and refresh via `user:activity`. Disconnect and the terminal
//! error state clear everything and abort outstanding lookups.
//!
//! A join whose payload lacks display attributes and misses the lookup cache
//! is held back while a background [`UserLookup`] resolves it, so listeners
//! never see a nameless entry. When the lookup returns the user is inserted
//! with the resolved attributes, or with only what the join carried if the
//! lookup failed. A `user:left` that arrives first cancels the insert.

pub mod lookup;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::Serialize;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionManager, ConnectionState};
use crate::event::{BoardEvent, EventKind, InboundEvent, UserPayload};
use crate::router::EventRouter;
use crate::subscription::{HandlerSet, Subscription};
use lookup::{UserLookup, UserProfile};

/// Identity of the user running this session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LocalUser {
    pub user_id: String,
    pub name: String,
    pub avatar_url: Option<String>,
    pub color: Option<String>,
}

impl LocalUser {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            avatar_url: None,
            color: None,
        }
    }
}

/// One user on the board. Times are epoch milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PresenceEntry {
    pub user_id: String,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub color: Option<String>,
    pub joined_at: i64,
    pub last_activity_at: i64,
    pub is_self: bool,
}

impl PresenceEntry {
    fn from_local(user: &LocalUser, now: i64) -> Self {
        Self {
            user_id: user.user_id.clone(),
            name: Some(user.name.clone()),
            avatar_url: user.avatar_url.clone(),
            color: user.color.clone(),
            joined_at: now,
            last_activity_at: now,
            is_self: true,
        }
    }

    fn from_join(payload: &UserPayload, at: i64) -> Self {
        Self {
            user_id: payload.user_id.clone(),
            name: None,
            avatar_url: None,
            color: None,
            joined_at: at,
            last_activity_at: at,
            is_self: false,
        }
    }

    /// Overwrite attributes the payload actually carries.
    fn absorb(&mut self, payload: &UserPayload) {
        if let Some(name) = payload.name.as_ref().filter(|n| !n.trim().is_empty()) {
            self.name = Some(name.clone());
        }
        if payload.avatar_url.is_some() {
            self.avatar_url.clone_from(&payload.avatar_url);
        }
        if payload.color.is_some() {
            self.color.clone_from(&payload.color);
        }
    }

    /// Fill gaps from a directory profile without clobbering join data.
    fn fill(&mut self, profile: &UserProfile) {
        if self.name.is_none() {
            self.name = Some(profile.name.clone());
        }
        if self.avatar_url.is_none() {
            self.avatar_url.clone_from(&profile.avatar_url);
        }
        if self.color.is_none() {
            self.color.clone_from(&profile.color);
        }
    }

    fn is_complete(&self) -> bool {
        self.name.is_some()
    }

    fn approx_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.user_id.len()
            + self.name.as_ref().map_or(0, String::len)
            + self.avatar_url.as_ref().map_or(0, String::len)
            + self.color.as_ref().map_or(0, String::len)
    }
}

// =============================================================================
// TRACKER
// =============================================================================

struct Shared {
    board_id: String,
    local: LocalUser,
    entries: Mutex<BTreeMap<String, PresenceEntry>>,
    /// Joins waiting on a directory lookup. Lock after `entries`.
    joining: Mutex<BTreeMap<String, PresenceEntry>>,
    lookups: Mutex<Vec<AbortHandle>>,
    lookup: Option<Arc<UserLookup>>,
    listeners: HandlerSet<Vec<PresenceEntry>>,
}

enum JoinOutcome {
    /// Newly visible.
    Inserted,
    /// Already visible; attributes or activity changed.
    Updated,
    /// Held back; a lookup must be started.
    Resolve,
    /// Held back behind a lookup already running.
    Waiting,
}

pub struct PresenceTracker {
    shared: Arc<Shared>,
    _subscriptions: Vec<Subscription>,
}

impl PresenceTracker {
    /// Track presence for `board_id` from `router` events and `connection`
    /// state. Without `lookup`, joins keep only the attributes they carry.
    #[must_use]
    pub fn attach(
        board_id: &str,
        local: LocalUser,
        router: &EventRouter,
        connection: &ConnectionManager,
        lookup: Option<Arc<UserLookup>>,
    ) -> Self {
        let shared = Arc::new(Shared {
            board_id: board_id.to_owned(),
            local,
            entries: Mutex::new(BTreeMap::new()),
            joining: Mutex::new(BTreeMap::new()),
            lookups: Mutex::new(Vec::new()),
            lookup,
            listeners: HandlerSet::new(),
        });

        let mut subscriptions = Vec::with_capacity(4);
        for kind in [EventKind::UserJoined, EventKind::UserLeft, EventKind::UserActivity] {
            let weak = Arc::downgrade(&shared);
            subscriptions.push(router.on(kind, move |event| {
                if let Some(shared) = weak.upgrade() {
                    Shared::on_event(&shared, event);
                }
            }));
        }
        let weak: Weak<Shared> = Arc::downgrade(&shared);
        subscriptions.push(connection.on_status_change(move |state| {
            if let Some(shared) = weak.upgrade() {
                shared.on_state(*state);
            }
        }));

        Self {
            shared,
            _subscriptions: subscriptions,
        }
    }

    /// Current entries ordered by user id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        self.shared.snapshot()
    }

    #[must_use]
    pub fn get(&self, user_id: &str) -> Option<PresenceEntry> {
        self.shared.lock_entries().get(user_id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock_entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Called with the full entry list after every change.
    pub fn on_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Vec<PresenceEntry>) + Send + Sync + 'static,
    {
        self.shared.listeners.subscribe(handler)
    }

    /// Bump the local user's activity time, as after a local interaction.
    pub fn touch_self(&self) {
        let user_id = self.shared.local.user_id.clone();
        self.shared.touch(&user_id, frames::now_ms());
    }

    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        self.shared
            .lock_entries()
            .values()
            .map(PresenceEntry::approx_bytes)
            .sum()
    }
}

impl Drop for PresenceTracker {
    fn drop(&mut self) {
        self.shared.abort_lookups();
    }
}

impl Shared {
    fn lock_entries(&self) -> MutexGuard<'_, BTreeMap<String, PresenceEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_joining(&self) -> MutexGuard<'_, BTreeMap<String, PresenceEntry>> {
        self.joining.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Vec<PresenceEntry> {
        self.lock_entries().values().cloned().collect()
    }

    fn notify(&self) {
        let entries = self.snapshot();
        self.listeners.emit("presence", &entries);
    }

    fn on_state(&self, state: ConnectionState) {
        match state {
            ConnectionState::Connecting => {
                let inserted = {
                    let mut entries = self.lock_entries();
                    let absent = !entries.contains_key(&self.local.user_id);
                    if absent {
                        entries.insert(
                            self.local.user_id.clone(),
                            PresenceEntry::from_local(&self.local, frames::now_ms()),
                        );
                    }
                    absent
                };
                if inserted {
                    debug!(board_id = %self.board_id, user_id = %self.local.user_id, "self presence added");
                    self.notify();
                }
            }
            ConnectionState::Disconnected | ConnectionState::Error => self.clear(),
            ConnectionState::Connected | ConnectionState::Reconnecting => {}
        }
    }

    fn on_event(shared: &Arc<Self>, inbound: &InboundEvent) {
        let at = inbound.timestamp.unwrap_or_else(frames::now_ms);
        match &inbound.event {
            BoardEvent::UserJoined(payload) => Self::join(shared, payload, at),
            BoardEvent::UserLeft(user) => shared.leave(&user.user_id),
            BoardEvent::UserActivity(activity) => {
                shared.touch(&activity.user_id, activity.at.unwrap_or(at));
            }
            _ => {}
        }
    }

    fn join(shared: &Arc<Self>, payload: &UserPayload, at: i64) {
        let user_id = &payload.user_id;
        let is_self = *user_id == shared.local.user_id;
        let outcome = {
            let mut entries = shared.lock_entries();
            let mut joining = shared.lock_joining();
            let resolving = joining.contains_key(user_id);

            match entries.get_mut(user_id).or_else(|| joining.get_mut(user_id)) {
                Some(entry) => {
                    entry.is_self |= is_self;
                    entry.absorb(payload);
                    entry.last_activity_at = entry.last_activity_at.max(at);
                }
                None => {
                    let mut entry = PresenceEntry::from_join(payload, at);
                    entry.is_self = is_self;
                    entry.absorb(payload);
                    joining.insert(user_id.clone(), entry);
                }
            }

            match joining.remove(user_id) {
                None => JoinOutcome::Updated,
                Some(mut entry) => {
                    let cached = shared
                        .lookup
                        .as_ref()
                        .filter(|_| !is_self && !entry.is_complete())
                        .map(|lookup| lookup.cached(user_id));
                    match cached {
                        Some(None) => {
                            joining.insert(user_id.clone(), entry);
                            if resolving {
                                JoinOutcome::Waiting
                            } else {
                                JoinOutcome::Resolve
                            }
                        }
                        Some(Some(profile)) => {
                            entry.fill(&profile);
                            entries.insert(user_id.clone(), entry);
                            JoinOutcome::Inserted
                        }
                        None => {
                            entries.insert(user_id.clone(), entry);
                            JoinOutcome::Inserted
                        }
                    }
                }
            }
        };

        match outcome {
            JoinOutcome::Inserted => {
                info!(board_id = %shared.board_id, %user_id, "user joined");
                shared.notify();
            }
            JoinOutcome::Updated => shared.notify(),
            JoinOutcome::Resolve => {
                debug!(board_id = %shared.board_id, %user_id, "resolving user attributes before join");
                Self::spawn_lookup(shared, user_id.clone());
            }
            JoinOutcome::Waiting => {}
        }
    }

    fn spawn_lookup(shared: &Arc<Self>, user_id: String) {
        let Some(lookup) = shared.lookup.clone() else {
            return;
        };
        let weak = Arc::downgrade(shared);
        let handle = tokio::spawn(async move {
            let result = lookup.resolve(&user_id).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if let Err(e) = &result {
                warn!(board_id = %shared.board_id, %user_id, error = %e, "presence lookup failed; keeping join attributes");
            }
            {
                let mut entries = shared.lock_entries();
                let Some(mut entry) = shared.lock_joining().remove(&user_id) else {
                    return;
                };
                if let Ok(profile) = &result {
                    entry.fill(profile);
                }
                entries.insert(user_id.clone(), entry);
            }
            info!(board_id = %shared.board_id, %user_id, "user joined");
            shared.notify();
        });

        let mut lookups = shared.lookups.lock().unwrap_or_else(PoisonError::into_inner);
        lookups.retain(|h| !h.is_finished());
        lookups.push(handle.abort_handle());
    }

    fn leave(&self, user_id: &str) {
        if user_id == self.local.user_id {
            debug!(board_id = %self.board_id, user_id, "ignoring leave for local user");
            return;
        }
        let (removed, was_joining) = {
            let mut entries = self.lock_entries();
            let removed = entries.remove(user_id).is_some();
            (removed, self.lock_joining().remove(user_id).is_some())
        };
        if was_joining {
            debug!(board_id = %self.board_id, user_id, "user left before attributes resolved");
        }
        if removed {
            info!(board_id = %self.board_id, user_id, "user left");
            self.notify();
        }
    }

    fn touch(&self, user_id: &str, at: i64) {
        let touched = {
            let mut entries = self.lock_entries();
            match entries.get_mut(user_id) {
                Some(entry) if at > entry.last_activity_at => {
                    entry.last_activity_at = at;
                    true
                }
                Some(_) => false,
                None => {
                    if let Some(entry) = self.lock_joining().get_mut(user_id) {
                        entry.last_activity_at = entry.last_activity_at.max(at);
                    }
                    false
                }
            }
        };
        if touched {
            self.notify();
        }
    }

    fn clear(&self) {
        self.abort_lookups();
        let cleared = {
            let mut entries = self.lock_entries();
            self.lock_joining().clear();
            let had = !entries.is_empty();
            entries.clear();
            had
        };
        if cleared {
            debug!(board_id = %self.board_id, "presence cleared");
            self.notify();
        }
    }

    fn abort_lookups(&self) {
        for handle in self
            .lookups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
