use std::time::Duration;

use serde::{Deserialize, Serialize};

use voyage_core::config::RetryConfig;

/// Per-node retry budget with linear backoff.
///
/// The delay before retry `n` (1-based) is `base_delay_ms * n`, capped at
/// `max_delay_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms: u64::MAX,
        }
    }

    /// No retries at all: the first retryable failure ends the run.
    pub fn none() -> Self {
        Self::new(0, 0)
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
        }
    }

    pub fn with_max_delay(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// Whether retry number `retry` (1-based) is still within budget.
    pub fn allows(&self, retry: u32) -> bool {
        retry <= self.max_retries
    }

    /// Delay applied before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let ms = self
            .base_delay_ms
            .saturating_mul(u64::from(retry))
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}
