//! Backoff for completion callback delivery.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Single attempt.
    None,

    Fixed {
        max_retries: u32,
        delay: Duration,
    },

    /// Delay doubles after every failed attempt, capped at `max_delay`.
    Exponential {
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Exponential {
            max_retries: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn exponential(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self::Exponential {
            max_retries,
            initial_delay,
            max_delay,
        }
    }

    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self::Fixed { max_retries, delay }
    }

    /// Delay before retry number `retry` (1-indexed), or `None` once retries are exhausted.
    pub fn delay_for_retry(&self, retry: u32) -> Option<Duration> {
        match self {
            Self::None => None,
            Self::Fixed { max_retries, delay } => (retry <= *max_retries).then_some(*delay),
            Self::Exponential {
                max_retries,
                initial_delay,
                max_delay,
            } => {
                if retry == 0 || retry > *max_retries {
                    return None;
                }
                let factor = 2u32.saturating_pow(retry - 1);
                Some(initial_delay.saturating_mul(factor).min(*max_delay))
            }
        }
    }

    pub fn max_retries(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Fixed { max_retries, .. } | Self::Exponential { max_retries, .. } => {
                *max_retries
            }
        }
    }
}
