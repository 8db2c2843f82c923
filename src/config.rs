//! Runtime configuration for the sync engine.
//!
//! Every knob has a compiled-in default and an optional `BOARDSYNC_*`
//! environment override. Unparsable values fall back to the default rather
//! than failing startup.

use std::str::FromStr;
use std::time::Duration;

use frames::WireFormat;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:3000";

const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1000;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MESSAGE_RATE_LIMIT: usize = 50;
const DEFAULT_RATE_WINDOW_MS: u64 = 1000;

const DEFAULT_OPTIMISTIC_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_UPDATE_CONFLICT_WINDOW_MS: u64 = 2000;
const DEFAULT_MOVE_CONFLICT_WINDOW_MS: u64 = 1000;

const DEFAULT_LOOKUP_MAX_CONCURRENT: usize = 10;
const DEFAULT_LOOKUP_CACHE_TTL_SECS: u64 = 3600;
const DEFAULT_LOOKUP_CACHE_CAPACITY: usize = 512;
const DEFAULT_LOOKUP_BREAKER_THRESHOLD: u32 = 3;
const DEFAULT_LOOKUP_BREAKER_COOLDOWN_SECS: u64 = 300;

const DEFAULT_HEALTH_INTERVAL_MS: u64 = 2000;

/// Upper bound for every configured interval, window and timeout.
pub const MAX_INTERVAL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Read a millisecond duration, clamped to [`MAX_INTERVAL`].
pub(crate) fn env_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(key, default_ms)).min(MAX_INTERVAL)
}

/// Read a duration in seconds, clamped to [`MAX_INTERVAL`].
pub(crate) fn env_secs(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(env_parse(key, default_secs)).min(MAX_INTERVAL)
}

/// Read `key` from the environment and parse it, falling back to `default`.
pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

// =============================================================================
// CONNECTION
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// HTTP(S) base of the board API; the socket URL is derived from it.
    pub base_url: String,
    /// Encoding for frames this side sends.
    pub wire_format: WireFormat,
    pub max_reconnect_attempts: u32,
    /// First backoff delay; attempt `n` waits `base * 2^(n-1)`.
    pub reconnect_base_delay: Duration,
    pub heartbeat_interval: Duration,
    pub handshake_timeout: Duration,
    /// Maximum sends per `rate_window`.
    pub message_rate_limit: usize,
    pub rate_window: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_owned(),
            wire_format: WireFormat::Json,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_DELAY_MS),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            message_rate_limit: DEFAULT_MESSAGE_RATE_LIMIT,
            rate_window: Duration::from_millis(DEFAULT_RATE_WINDOW_MS),
        }
    }
}

impl ConnectionConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let base_url = std::env::var("BOARDSYNC_BASE_URL")
            .ok()
            .map(|v| v.trim().trim_end_matches('/').to_owned())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());
        let wire_format = std::env::var("BOARDSYNC_WIRE_FORMAT")
            .ok()
            .and_then(|v| v.parse::<WireFormat>().ok())
            .unwrap_or_default();

        Self {
            base_url,
            wire_format,
            max_reconnect_attempts: env_parse(
                "BOARDSYNC_MAX_RECONNECT_ATTEMPTS",
                DEFAULT_MAX_RECONNECT_ATTEMPTS,
            ),
            reconnect_base_delay: env_millis(
                "BOARDSYNC_RECONNECT_BASE_DELAY_MS",
                DEFAULT_RECONNECT_BASE_DELAY_MS,
            ),
            heartbeat_interval: env_millis(
                "BOARDSYNC_HEARTBEAT_INTERVAL_MS",
                DEFAULT_HEARTBEAT_INTERVAL_MS,
            ),
            handshake_timeout: env_millis(
                "BOARDSYNC_HANDSHAKE_TIMEOUT_MS",
                DEFAULT_HANDSHAKE_TIMEOUT_MS,
            ),
            message_rate_limit: env_parse("BOARDSYNC_MESSAGE_RATE_LIMIT", DEFAULT_MESSAGE_RATE_LIMIT)
                .max(1),
            rate_window: env_millis("BOARDSYNC_RATE_WINDOW_MS", DEFAULT_RATE_WINDOW_MS)
                .max(Duration::from_millis(1)),
        }
    }
}

// =============================================================================
// OPTIMISTIC UPDATES
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OptimisticConfig {
    /// Safety timer after which a hung remote call is rolled back.
    pub timeout: Duration,
    /// An inbound update younger than this loses to the pending local edit.
    pub update_conflict_window: Duration,
    pub move_conflict_window: Duration,
}

impl Default for OptimisticConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_OPTIMISTIC_TIMEOUT_MS),
            update_conflict_window: Duration::from_millis(DEFAULT_UPDATE_CONFLICT_WINDOW_MS),
            move_conflict_window: Duration::from_millis(DEFAULT_MOVE_CONFLICT_WINDOW_MS),
        }
    }
}

impl OptimisticConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            timeout: env_millis("BOARDSYNC_OPTIMISTIC_TIMEOUT_MS", DEFAULT_OPTIMISTIC_TIMEOUT_MS),
            update_conflict_window: env_millis(
                "BOARDSYNC_UPDATE_CONFLICT_WINDOW_MS",
                DEFAULT_UPDATE_CONFLICT_WINDOW_MS,
            ),
            move_conflict_window: env_millis(
                "BOARDSYNC_MOVE_CONFLICT_WINDOW_MS",
                DEFAULT_MOVE_CONFLICT_WINDOW_MS,
            ),
        }
    }
}

// =============================================================================
// PRESENCE LOOKUP
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PresenceConfig {
    pub max_concurrent_lookups: usize,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    /// Consecutive failures before the lookup breaker opens.
    pub breaker_threshold: u32,
    /// Time an open breaker waits before letting one trial request through.
    pub breaker_cooldown: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_lookups: DEFAULT_LOOKUP_MAX_CONCURRENT,
            cache_ttl: Duration::from_secs(DEFAULT_LOOKUP_CACHE_TTL_SECS),
            cache_capacity: DEFAULT_LOOKUP_CACHE_CAPACITY,
            breaker_threshold: DEFAULT_LOOKUP_BREAKER_THRESHOLD,
            breaker_cooldown: Duration::from_secs(DEFAULT_LOOKUP_BREAKER_COOLDOWN_SECS),
        }
    }
}

impl PresenceConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            max_concurrent_lookups: env_parse(
                "BOARDSYNC_LOOKUP_MAX_CONCURRENT",
                DEFAULT_LOOKUP_MAX_CONCURRENT,
            )
            .max(1),
            cache_ttl: env_secs("BOARDSYNC_LOOKUP_CACHE_TTL_SECS", DEFAULT_LOOKUP_CACHE_TTL_SECS),
            cache_capacity: env_parse(
                "BOARDSYNC_LOOKUP_CACHE_CAPACITY",
                DEFAULT_LOOKUP_CACHE_CAPACITY,
            )
            .max(1),
            breaker_threshold: env_parse(
                "BOARDSYNC_LOOKUP_BREAKER_THRESHOLD",
                DEFAULT_LOOKUP_BREAKER_THRESHOLD,
            )
            .max(1),
            breaker_cooldown: env_secs(
                "BOARDSYNC_LOOKUP_BREAKER_COOLDOWN_SECS",
                DEFAULT_LOOKUP_BREAKER_COOLDOWN_SECS,
            ),
        }
    }
}

// =============================================================================
// HEALTH
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HealthConfig {
    pub interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_HEALTH_INTERVAL_MS),
        }
    }
}

impl HealthConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            interval: env_millis("BOARDSYNC_HEALTH_INTERVAL_MS", DEFAULT_HEALTH_INTERVAL_MS)
                .max(Duration::from_millis(1)),
        }
    }
}

// =============================================================================
// AGGREGATE
// =============================================================================

/// Everything a [`crate::BoardSession`] needs to run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncConfig {
    pub connection: ConnectionConfig,
    pub optimistic: OptimisticConfig,
    pub presence: PresenceConfig,
    pub health: HealthConfig,
}

impl SyncConfig {
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            connection: ConnectionConfig::from_env(),
            optimistic: OptimisticConfig::from_env(),
            presence: PresenceConfig::from_env(),
            health: HealthConfig::from_env(),
        }
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
