//! Restart backoff for the tunnel process

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Attempts before the delay stops growing and stays at the maximum
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(300),
            multiplier: 1.2,
            max_attempts: 1000,
        }
    }
}

/// Exponential backoff state. Inspectable without sleeping; the caller
/// decides how to wait.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    current_backoff: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Delay before the next attempt; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);

        if self.exhausted() {
            return self.config.max_backoff;
        }

        let delay = self.current_backoff;
        let next =
            Duration::from_secs_f64(self.current_backoff.as_secs_f64() * self.config.multiplier);
        self.current_backoff = next.min(self.config.max_backoff);
        delay
    }

    /// Call once a process has stayed up for the stable period
    pub fn reset(&mut self) {
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Past the attempt budget. Retries continue at the maximum delay.
    pub fn exhausted(&self) -> bool {
        self.attempt > self.config.max_attempts
    }
}
