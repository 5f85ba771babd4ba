//! Configuration for the [`Engine`](crate::engine::Engine).
//!
//! Everything has a working default; the polling defaults (5 s interval,
//! 30 attempts) give a summary job two and a half minutes to finish.
//!
//! ```ignore
//! let config = EngineConfig::default()
//!     .with_poll_interval(Duration::from_secs(2))
//!     .with_max_poll_attempts(60)
//!     .with_prefetch_on_select(false);
//! ```

use std::time::Duration;

/// Default delay between summary job polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default number of polls before a running job is declared exhausted.
pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 30;

/// Fixed-interval, bounded polling policy for summary jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Delay before each poll, including the first.
    pub interval: Duration,
    /// Polls allowed while the job reports `running`. The poll that reaches
    /// this count and still sees `running` moves the record to `error`.
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
        }
    }
}

impl PollConfig {
    /// Worst-case time from job creation to exhaustion.
    pub fn deadline(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Summary polling policy.
    pub poll: PollConfig,
    /// Spawn a background item re-fetch after a list's bindings change.
    /// Default: `true`.
    pub refresh_on_mutation: bool,
    /// Warm the item cache when a list becomes active. Default: `true`.
    pub prefetch_on_select: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            refresh_on_mutation: true,
            prefetch_on_select: true,
        }
    }
}

impl EngineConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll.interval = interval;
        self
    }

    pub fn with_max_poll_attempts(mut self, attempts: u32) -> Self {
        self.poll.max_attempts = attempts.max(1);
        self
    }

    pub fn with_refresh_on_mutation(mut self, enabled: bool) -> Self {
        self.refresh_on_mutation = enabled;
        self
    }

    pub fn with_prefetch_on_select(mut self, enabled: bool) -> Self {
        self.prefetch_on_select = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_poll_for_two_and_a_half_minutes() {
        let config = EngineConfig::default();
        assert_eq!(config.poll.interval, Duration::from_secs(5));
        assert_eq!(config.poll.max_attempts, 30);
        assert_eq!(config.poll.deadline(), Duration::from_secs(150));
        assert!(config.refresh_on_mutation);
        assert!(config.prefetch_on_select);
    }

    #[test]
    fn builder_overrides() {
        let config = EngineConfig::default()
            .with_poll_interval(Duration::from_millis(250))
            .with_max_poll_attempts(4)
            .with_refresh_on_mutation(false)
            .with_prefetch_on_select(false);
        assert_eq!(config.poll.deadline(), Duration::from_secs(1));
        assert!(!config.refresh_on_mutation);
        assert!(!config.prefetch_on_select);
    }

    #[test]
    fn zero_attempts_clamped_to_one() {
        let config = EngineConfig::default().with_max_poll_attempts(0);
        assert_eq!(config.poll.max_attempts, 1);
    }
}
