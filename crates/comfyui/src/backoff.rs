//! Exponential-backoff throttle for re-opening the ComfyUI push channel.
//!
//! The tracker reconnects lazily: only when a submission finds the
//! channel down. After a failed attempt, [`ReconnectBackoff`] refuses
//! further attempts until the current delay has elapsed, and each
//! consecutive failure grows the delay up to [`ReconnectConfig::max_delay`].

use std::time::{Duration, Instant};

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay imposed after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Gate deciding whether a reconnect attempt may run now.
#[derive(Debug)]
pub struct ReconnectBackoff {
    config: ReconnectConfig,
    failures: u32,
    delay: Duration,
    retry_at: Option<Instant>,
}

impl ReconnectBackoff {
    pub fn new(config: ReconnectConfig) -> Self {
        let delay = config.initial_delay;
        Self {
            config,
            failures: 0,
            delay,
            retry_at: None,
        }
    }

    /// `Ok` if an attempt may run at `now`, otherwise the remaining wait.
    pub fn check(&self, now: Instant) -> Result<(), Duration> {
        match self.retry_at {
            Some(at) if at > now => Err(at - now),
            _ => Ok(()),
        }
    }

    /// Record a failed attempt and push the next allowed attempt out.
    pub fn record_failure(&mut self, now: Instant) {
        if self.failures > 0 {
            self.delay = next_delay(self.delay, &self.config);
        }
        self.failures += 1;
        self.retry_at = Some(now + self.delay);
    }

    /// Forget past failures after a successful connect.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.delay = self.config.initial_delay;
        self.retry_at = None;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}
