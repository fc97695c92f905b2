use std::time::Duration;

/// Hard ceiling on any single reconnect delay, whatever `max_delay` says.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Reconnect scheduling parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Scheduling stops once the attempt counter exceeds this.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            max_attempts: 20,
        }
    }
}

impl BackoffConfig {
    /// `min(max_delay, base_delay * 2^(attempt - 1))` for a 1-based attempt,
    /// never above [`MAX_RECONNECT_DELAY`].
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let cap = self.max_delay.min(MAX_RECONNECT_DELAY);
        let shift = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        self.base_delay.checked_mul(factor).unwrap_or(cap).min(cap)
    }
}

/// Attempt counter plus delay schedule for one connection.
///
/// Once exhausted it stays exhausted until [`ReconnectPolicy::reset`], which
/// happens on a successful open or a manual connect.
#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    config: BackoffConfig,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts > self.config.max_attempts
    }

    /// Count one more attempt and return how long to wait before it, or
    /// `None` when the attempt ceiling has been passed.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.is_exhausted() {
            return None;
        }
        self.attempts += 1;
        if self.is_exhausted() {
            return None;
        }
        Some(self.config.delay_for_attempt(self.attempts))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
