// ============================================================================
// SECTION 19: RETRY BACKOFF & JITTER
// ============================================================================
// Exponential backoff for output retries, plus the jitter helper shared by
// the scheduler and the flush loops.
// ============================================================================

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use crate::config::RetryConfig;

/// Random delay in `[0, max]`. Zero when `max` is zero.
pub fn random_jitter(max: Duration) -> Duration {
    if max.is_zero() {
        return Duration::ZERO;
    }
    let nanos = rand::thread_rng().gen_range(0..=max.as_nanos().min(u64::MAX as u128) as u64);
    Duration::from_nanos(nanos)
}

/// Retry gate of one output.
///
/// Each failure pushes the next eligible write time out by the current delay
/// and grows the delay geometrically up to `max`. A success resets it.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
    attempts: u32,
    next_eligible: Option<Instant>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: multiplier.max(1.0),
            current: initial,
            attempts: 0,
            next_eligible: None,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.initial_backoff,
            config.max_backoff,
            config.backoff_multiplier,
        )
    }

    /// Whether a write may be attempted at `now`.
    pub fn should_allow(&self, now: Instant) -> bool {
        self.next_eligible.map_or(true, |t| now >= t)
    }

    /// Time left in the current backoff window
    pub fn remaining(&self, now: Instant) -> Duration {
        self.next_eligible
            .map(|t| t.saturating_duration_since(now))
            .unwrap_or_default()
    }

    /// Record a retryable failure; returns the delay now in force.
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        let delay = self.current;
        self.next_eligible = Some(now + delay);
        self.attempts = self.attempts.saturating_add(1);

        let grown = self.current.as_secs_f64() * self.multiplier;
        self.current = Duration::try_from_secs_f64(grown)
            .unwrap_or(self.max)
            .min(self.max);
        delay
    }

    pub fn record_success(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
        self.next_eligible = None;
    }

    /// Forget the failure count but keep the current delay and window.
    pub fn reset_attempts(&mut self) {
        self.attempts = 0;
    }

    /// Consecutive failures since the last success
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn current_delay(&self) -> Duration {
        self.current
    }
}
