use std::time::Duration;

/// Exponential reconnect schedule: attempt `n` (1-based) waits
/// `base_delay * 2^(n-1)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub(crate) fn delay_for(self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1_u32 << exp)
    }

    pub(crate) fn exhausted(self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
