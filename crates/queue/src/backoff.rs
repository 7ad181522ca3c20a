//! Delay between a failed attempt and the next one.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed { delay: Duration },
    /// `base * n` before the n-th retry, capped at `max`.
    Linear { base: Duration, max: Duration },
    /// `base * factor^(n-1)` before the n-th retry, capped at `max`.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            factor: 2.0,
            max: Duration::from_secs(60),
        }
    }
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self::Exponential {
            base,
            factor: 2.0,
            max,
        }
    }

    /// Delay before retry number `retry` (1 for the first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        let n = retry.max(1);
        match *self {
            Self::Fixed { delay } => delay,
            Self::Linear { base, max } => base.saturating_mul(n).min(max),
            Self::Exponential { base, factor, max } => {
                let millis = base.as_millis() as f64 * factor.powi(n as i32 - 1);
                if !millis.is_finite() || millis >= max.as_millis() as f64 {
                    max
                } else {
                    Duration::from_millis(millis as u64)
                }
            }
        }
    }
}
