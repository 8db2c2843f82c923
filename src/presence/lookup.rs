//! User attribute lookup for presence.
//!
//! DESIGN
//! ======
//! Join events often carry only a user id. [`UserLookup`] resolves the rest
//! from a [`UserDirectory`] under three limits:
//!
//! - a semaphore caps concurrent directory requests;
//! - an LRU cache holds results, each expiring after a fixed TTL;
//! - a [`CircuitBreaker`] stops calling a failing directory for a cooldown.
//!
//! A "not found" answer is a definite result, not a directory failure, and
//! does not count toward the breaker.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::PresenceConfig;
use crate::error::ErrorCode;

const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(alias = "userId", alias = "id")]
    pub user_id: String,
    pub name: String,
    #[serde(default, alias = "avatarUrl", skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum LookupError {
    #[error("user {0} not found")]
    NotFound(String),
    #[error("user directory returned HTTP {0}")]
    Status(u16),
    #[error("user directory request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid user directory url: {0}")]
    InvalidBaseUrl(String),
    #[error("user lookups suspended after repeated failures")]
    CircuitOpen,
    #[error("user lookup is shutting down")]
    Closed,
}

impl ErrorCode for LookupError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "E_USER_NOT_FOUND",
            Self::Status(_) | Self::Http(_) => "E_USER_DIRECTORY",
            Self::InvalidBaseUrl(_) => "E_INVALID_BASE_URL",
            Self::CircuitOpen => "E_CIRCUIT_OPEN",
            Self::Closed => "E_ENGINE_STOPPED",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Status(_) | Self::Http(_) | Self::CircuitOpen)
    }
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn fetch(&self, user_id: &str) -> Result<UserProfile, LookupError>;
}

/// `GET /api/users/{id}` on the board API.
pub struct HttpUserDirectory {
    http: reqwest::Client,
    base_url: Url,
    token: Option<String>,
}

impl HttpUserDirectory {
    /// # Errors
    ///
    /// Returns [`LookupError::InvalidBaseUrl`] for a non-http(s) base and
    /// [`LookupError::Http`] if the client cannot be built.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, LookupError> {
        let parsed = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| LookupError::InvalidBaseUrl(format!("{base_url}: {e}")))?;
        if parsed.cannot_be_a_base() || !matches!(parsed.scheme(), "http" | "https") {
            return Err(LookupError::InvalidBaseUrl(base_url.to_owned()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            base_url: parsed,
            token,
        })
    }

    fn user_url(&self, user_id: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(["api", "users", user_id]);
        }
        url
    }
}

#[async_trait]
impl UserDirectory for HttpUserDirectory {
    async fn fetch(&self, user_id: &str) -> Result<UserProfile, LookupError> {
        let mut request = self.http.get(self.user_url(user_id));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(LookupError::NotFound(user_id.to_owned())),
            status if !status.is_success() => Err(LookupError::Status(status.as_u16())),
            _ => Ok(response.json::<UserProfile>().await?),
        }
    }
}

// =============================================================================
// CIRCUIT BREAKER
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Consecutive-failure breaker. Open rejects calls until the cooldown has
/// passed, then half-open lets calls through: the first failure reopens it,
/// the first success closes it.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            failures: 0,
            opened_at: None,
        }
    }

    #[must_use]
    pub fn state_at(&self, now: Instant) -> BreakerState {
        match self.opened_at {
            None => BreakerState::Closed,
            Some(at) if now.saturating_duration_since(at) >= self.cooldown => {
                BreakerState::HalfOpen
            }
            Some(_) => BreakerState::Open,
        }
    }

    /// Whether a call may proceed at `now`.
    #[must_use]
    pub fn allows_at(&self, now: Instant) -> bool {
        self.state_at(now) != BreakerState::Open
    }

    pub fn record_success(&mut self) {
        if self.opened_at.take().is_some() {
            info!("user lookup circuit closed");
        }
        self.failures = 0;
    }

    pub fn record_failure_at(&mut self, now: Instant) {
        match self.state_at(now) {
            BreakerState::HalfOpen => {
                self.opened_at = Some(now);
                warn!(
                    cooldown_secs = self.cooldown.as_secs(),
                    "user lookup trial request failed; circuit reopened"
                );
            }
            BreakerState::Closed => {
                self.failures += 1;
                if self.failures >= self.threshold {
                    self.opened_at = Some(now);
                    warn!(
                        failures = self.failures,
                        cooldown_secs = self.cooldown.as_secs(),
                        "user lookup circuit opened"
                    );
                }
            }
            BreakerState::Open => {}
        }
    }
}

// =============================================================================
// LOOKUP
// =============================================================================

struct Cached {
    profile: UserProfile,
    fetched_at: Instant,
}

pub struct UserLookup {
    directory: Arc<dyn UserDirectory>,
    cache: Mutex<LruCache<String, Cached>>,
    permits: Semaphore,
    breaker: Mutex<CircuitBreaker>,
    ttl: Duration,
}

impl UserLookup {
    #[must_use]
    pub fn new(directory: Arc<dyn UserDirectory>, config: &PresenceConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            directory,
            cache: Mutex::new(LruCache::new(capacity)),
            permits: Semaphore::new(config.max_concurrent_lookups.max(1)),
            breaker: Mutex::new(CircuitBreaker::new(
                config.breaker_threshold,
                config.breaker_cooldown,
            )),
            ttl: config.cache_ttl,
        }
    }

    /// Resolve `user_id`, from cache when fresh.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::CircuitOpen`] while the breaker is open, or the
    /// directory's error.
    pub async fn resolve(&self, user_id: &str) -> Result<UserProfile, LookupError> {
        if let Some(profile) = self.cached(user_id) {
            return Ok(profile);
        }

        let _permit = self.permits.acquire().await.map_err(|_| LookupError::Closed)?;

        // Another lookup may have filled the cache while this one waited.
        if let Some(profile) = self.cached(user_id) {
            return Ok(profile);
        }
        if !self.lock_breaker().allows_at(Instant::now()) {
            return Err(LookupError::CircuitOpen);
        }

        match self.directory.fetch(user_id).await {
            Ok(profile) => {
                self.lock_breaker().record_success();
                self.lock_cache().put(
                    user_id.to_owned(),
                    Cached {
                        profile: profile.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                Ok(profile)
            }
            Err(e @ LookupError::NotFound(_)) => {
                self.lock_breaker().record_success();
                Err(e)
            }
            Err(e) => {
                warn!(user_id, error = %e, "user lookup failed");
                self.lock_breaker().record_failure_at(Instant::now());
                Err(e)
            }
        }
    }

    /// Fresh cached profile, if any. Expired entries are evicted.
    #[must_use]
    pub fn cached(&self, user_id: &str) -> Option<UserProfile> {
        self.cached_at(user_id, Instant::now())
    }

    pub(crate) fn cached_at(&self, user_id: &str, now: Instant) -> Option<UserProfile> {
        let mut cache = self.lock_cache();
        let fresh = cache
            .get(user_id)
            .map(|c| now.saturating_duration_since(c.fetched_at) < self.ttl)?;
        if fresh {
            cache.get(user_id).map(|c| c.profile.clone())
        } else {
            cache.pop(user_id);
            None
        }
    }

    #[must_use]
    pub fn breaker_state(&self) -> BreakerState {
        self.lock_breaker().state_at(Instant::now())
    }

    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.lock_cache().len()
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, LruCache<String, Cached>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_breaker(&self) -> std::sync::MutexGuard<'_, CircuitBreaker> {
        self.breaker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "lookup_test.rs"]
mod tests;
