use super::*;

#[test]
fn defaults_match_documented_constants() {
    let cfg = SyncConfig::default();
    assert_eq!(cfg.connection.max_reconnect_attempts, 5);
    assert_eq!(cfg.connection.reconnect_base_delay, Duration::from_secs(1));
    assert_eq!(cfg.connection.heartbeat_interval, Duration::from_secs(30));
    assert_eq!(cfg.connection.message_rate_limit, 50);
    assert_eq!(cfg.connection.rate_window, Duration::from_secs(1));
    assert_eq!(cfg.connection.wire_format, WireFormat::Json);
    assert_eq!(cfg.optimistic.timeout, Duration::from_secs(30));
    assert_eq!(cfg.optimistic.update_conflict_window, Duration::from_secs(2));
    assert_eq!(cfg.optimistic.move_conflict_window, Duration::from_secs(1));
    assert_eq!(cfg.presence.max_concurrent_lookups, 10);
    assert_eq!(cfg.presence.cache_ttl, Duration::from_secs(3600));
    assert_eq!(cfg.presence.breaker_threshold, 3);
    assert_eq!(cfg.presence.breaker_cooldown, Duration::from_secs(300));
    assert_eq!(cfg.health.interval, Duration::from_secs(2));
}

#[test]
fn env_parse_reads_valid_value() {
    unsafe { std::env::set_var("BOARDSYNC_TEST_ENV_PARSE_VALID", " 42 ") };
    assert_eq!(env_parse("BOARDSYNC_TEST_ENV_PARSE_VALID", 7_u32), 42);
    unsafe { std::env::remove_var("BOARDSYNC_TEST_ENV_PARSE_VALID") };
}

#[test]
fn env_parse_falls_back_on_garbage() {
    unsafe { std::env::set_var("BOARDSYNC_TEST_ENV_PARSE_GARBAGE", "lots") };
    assert_eq!(env_parse("BOARDSYNC_TEST_ENV_PARSE_GARBAGE", 7_u32), 7);
    unsafe { std::env::remove_var("BOARDSYNC_TEST_ENV_PARSE_GARBAGE") };
}

#[test]
fn env_parse_falls_back_when_missing() {
    assert_eq!(env_parse("BOARDSYNC_TEST_ENV_PARSE_MISSING", 1.5_f64), 1.5);
}

#[test]
fn optimistic_from_env_reads_overrides() {
    unsafe { std::env::set_var("BOARDSYNC_MOVE_CONFLICT_WINDOW_MS", "250") };
    let cfg = OptimisticConfig::from_env();
    unsafe { std::env::remove_var("BOARDSYNC_MOVE_CONFLICT_WINDOW_MS") };

    assert_eq!(cfg.move_conflict_window, Duration::from_millis(250));
    assert_eq!(cfg.update_conflict_window, Duration::from_secs(2));
}

#[test]
fn presence_from_env_clamps_zero_concurrency() {
    unsafe { std::env::set_var("BOARDSYNC_LOOKUP_MAX_CONCURRENT", "0") };
    let cfg = PresenceConfig::from_env();
    unsafe { std::env::remove_var("BOARDSYNC_LOOKUP_MAX_CONCURRENT") };

    assert_eq!(cfg.max_concurrent_lookups, 1);
}

#[test]
fn env_millis_clamps_to_max_interval() {
    unsafe { std::env::set_var("BOARDSYNC_TEST_ENV_MILLIS_HUGE", u64::MAX.to_string()) };
    let huge = env_millis("BOARDSYNC_TEST_ENV_MILLIS_HUGE", 10);
    unsafe { std::env::remove_var("BOARDSYNC_TEST_ENV_MILLIS_HUGE") };

    assert_eq!(huge, MAX_INTERVAL);
    assert_eq!(env_millis("BOARDSYNC_TEST_ENV_MILLIS_MISSING", 10), Duration::from_millis(10));
}

#[test]
fn connection_and_health_from_env_clamp_extreme_intervals() {
    unsafe {
        std::env::set_var("BOARDSYNC_HEARTBEAT_INTERVAL_MS", u64::MAX.to_string());
        std::env::set_var("BOARDSYNC_RATE_WINDOW_MS", u64::MAX.to_string());
        std::env::set_var("BOARDSYNC_HEALTH_INTERVAL_MS", u64::MAX.to_string());
    }
    let connection = ConnectionConfig::from_env();
    let health = HealthConfig::from_env();
    unsafe {
        std::env::remove_var("BOARDSYNC_HEARTBEAT_INTERVAL_MS");
        std::env::remove_var("BOARDSYNC_RATE_WINDOW_MS");
        std::env::remove_var("BOARDSYNC_HEALTH_INTERVAL_MS");
    }

    assert_eq!(connection.heartbeat_interval, MAX_INTERVAL);
    assert_eq!(connection.rate_window, MAX_INTERVAL);
    assert_eq!(health.interval, MAX_INTERVAL);
}
