//! Per-key requeue backoff.

use std::collections::BTreeMap;
use std::time::Duration;

/// Exponential backoff tracked per object key.
///
/// The delay doubles with each consecutive failure, starting at `base` and
/// capped at `max`. A success clears the key.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,

    /// Consecutive failures per key.
    failures: BTreeMap<String, u32>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn record_failure(&mut self, key: &str) -> Duration {
        let count = self.failures.entry(key.to_string()).or_insert(0);
        let delay = self
            .base
            .checked_mul(2u32.saturating_pow(*count))
            .unwrap_or(self.max)
            .min(self.max);
        *count = count.saturating_add(1);
        delay
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    /// Clear failure tracking for a key (on success).
    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(30))
    }
}
