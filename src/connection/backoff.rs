//! Delays observed between failed connection attempts.
use rand::Rng;
use serde::Deserialize;
use std::time::Duration;

/// How the delay grows between consecutive reconnection attempts.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// The delay doubles after every failed attempt.
    #[default]
    Exponential,
    /// The delay follows the Fibonacci sequence, scaled by the initial delay.
    Fibonacci,
}

/// Reconnection policy applied by [`ConnectionManager`](super::ConnectionManager).
///
/// Every field has a default, so an empty configuration section is valid.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// How many times a failed connection attempt is retried before giving up.
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound for the delay between two attempts, in milliseconds.
    pub max_delay_ms: u64,
    /// Extra random delay added to each retry, as a fraction of the computed delay.
    ///
    /// Values outside of `0.0..=1.0` are clamped.
    pub randomisation_factor: f64,
    pub strategy: BackoffStrategy,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: None,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            randomisation_factor: 0.25,
            strategy: BackoffStrategy::default(),
        }
    }
}

impl ReconnectPolicy {
    /// Give up after `max_retries` failed retries.
    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries: Some(max_retries),
            ..self
        }
    }

    pub fn with_delays(self, initial: Duration, max: Duration) -> Self {
        Self {
            initial_delay_ms: duration_to_millis(initial),
            max_delay_ms: duration_to_millis(max),
            ..self
        }
    }

    pub fn with_randomisation_factor(self, randomisation_factor: f64) -> Self {
        Self {
            randomisation_factor,
            ..self
        }
    }

    pub fn with_strategy(self, strategy: BackoffStrategy) -> Self {
        Self { strategy, ..self }
    }

    pub(crate) fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            attempt: 0,
        }
    }
}

fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// The state of one reconnection loop.
#[derive(Debug)]
pub(crate) struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    /// The delay to wait before the next retry, or `None` if the retry budget is exhausted.
    ///
    /// The returned attempt number starts from 1.
    pub(crate) fn next(&mut self) -> Option<(u32, Duration)> {
        if let Some(max_retries) = self.policy.max_retries {
            if self.attempt >= max_retries {
                return None;
            }
        }
        self.attempt = self.attempt.saturating_add(1);
        let base = base_delay(&self.policy, self.attempt);
        Some((self.attempt, jitter(&self.policy, base)))
    }

    /// How many retries have been handed out so far.
    pub(crate) fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// The un-randomised delay before retry number `attempt` (1-based).
fn base_delay(policy: &ReconnectPolicy, attempt: u32) -> u64 {
    let initial = policy.initial_delay_ms;
    let multiplier = match policy.strategy {
        // Capped at 2^30 to prevent overflow
        BackoffStrategy::Exponential => 2_u64.pow(attempt.saturating_sub(1).min(30)),
        BackoffStrategy::Fibonacci => fibonacci(attempt),
    };
    initial.saturating_mul(multiplier).min(policy.max_delay_ms)
}

/// 1, 1, 2, 3, 5, ...
fn fibonacci(n: u32) -> u64 {
    let (mut current, mut next) = (1_u64, 1_u64);
    for _ in 1..n {
        let sum = current.saturating_add(next);
        current = next;
        next = sum;
    }
    current
}

fn jitter(policy: &ReconnectPolicy, base_ms: u64) -> Duration {
    let factor = policy.randomisation_factor.clamp(0.0, 1.0);
    if factor == 0.0 || base_ms == 0 {
        return Duration::from_millis(base_ms);
    }
    let extra = (base_ms as f64 * factor * rand::thread_rng().gen::<f64>()) as u64;
    Duration::from_millis(base_ms.saturating_add(extra).min(policy.max_delay_ms))
}
