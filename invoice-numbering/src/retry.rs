//! Bounded retries with jittered backoff for lost compare-and-swap races.

use rand::Rng;
use serde::Deserialize;
use std::{num::NonZeroU32, time::Duration};

/// Configuration for retrying lost compare-and-swap races.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RetryConfig {
    #[serde(default = "max_attempts_default")]
    pub max_attempts: NonZeroU32,

    #[serde(default = "min_backoff_default", with = "humantime_serde")]
    pub min_backoff: Duration,

    #[serde(default = "max_backoff_default", with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl RetryConfig {
    /// Change the `max_attempts`.
    pub fn with_max_attempts(self, max_attempts: NonZeroU32) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }

    /// Change the `min_backoff` and `max_backoff`.
    pub fn with_backoff(self, min_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            min_backoff,
            max_backoff,
            ..self
        }
    }

    /// A uniformly distributed delay between `min_backoff` and `max_backoff`, inclusive.
    pub fn backoff(&self) -> Duration {
        if self.max_backoff <= self.min_backoff {
            return self.min_backoff;
        }

        rand::thread_rng().gen_range(self.min_backoff..=self.max_backoff)
    }
}

impl Default for RetryConfig {
    /// 5 attempts with a backoff between 10ms and 50ms.
    fn default() -> Self {
        Self {
            max_attempts: max_attempts_default(),
            min_backoff: min_backoff_default(),
            max_backoff: max_backoff_default(),
        }
    }
}

const fn max_attempts_default() -> NonZeroU32 {
    match NonZeroU32::new(5) {
        Some(n) => n,
        None => NonZeroU32::MIN,
    }
}

const fn min_backoff_default() -> Duration {
    Duration::from_millis(10)
}

const fn max_backoff_default() -> Duration {
    Duration::from_millis(50)
}
