//! Retry backoff.
//!
//! A unit whose executable asks for a retry waits `next_delay(..)` before it
//! becomes eligible again. The base delay is floored at [`MIN_BACKOFF`] when
//! the unit is built and every computed delay is capped at [`MAX_BACKOFF`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest base delay a unit can carry.
pub const MIN_BACKOFF: Duration = Duration::from_secs(10);

/// Upper bound on any single backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60 * 60);

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// `base * attempt`
    Linear,
    /// `base * 2^(attempt - 1)`
    #[default]
    Exponential,
}

impl std::fmt::Display for BackoffPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackoffPolicy::Linear => "linear",
            BackoffPolicy::Exponential => "exponential",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for BackoffPolicy {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "linear" => Ok(BackoffPolicy::Linear),
            "exponential" => Ok(BackoffPolicy::Exponential),
            _ => Err(crate::error::Error::Corrupt(format!(
                "unknown backoff policy: {s}"
            ))),
        }
    }
}

/// Retry shape of a single unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub policy: BackoffPolicy,
    pub delay: Duration,
}

impl Backoff {
    /// Build a backoff, raising `delay` to the floor if it is below it.
    pub fn new(policy: BackoffPolicy, delay: Duration) -> Self {
        Self {
            policy,
            delay: delay.clamp(MIN_BACKOFF, MAX_BACKOFF),
        }
    }

    pub fn linear(delay: Duration) -> Self {
        Self::new(BackoffPolicy::Linear, delay)
    }

    pub fn exponential(delay: Duration) -> Self {
        Self::new(BackoffPolicy::Exponential, delay)
    }

    /// Delay before the retry that follows `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        next_delay(self.policy, self.delay, attempt)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffPolicy::Exponential, MIN_BACKOFF)
    }
}

/// Delay before the next attempt, given the number of attempts made so far.
///
/// `attempt` is 1-based; zero is treated as one.
pub fn next_delay(policy: BackoffPolicy, base: Duration, attempt: u32) -> Duration {
    let attempt = attempt.max(1);
    let delay = match policy {
        BackoffPolicy::Linear => base.saturating_mul(attempt),
        BackoffPolicy::Exponential => {
            // 2^31 seconds is already far past the cap.
            let shift = (attempt - 1).min(31);
            base.saturating_mul(1u32 << shift)
        }
    };
    delay.min(MAX_BACKOFF)
}
