//! Per-key exponential requeue backoff.

use std::collections::BTreeMap;
use std::time::Duration;

/// Tracks consecutive failures per key and derives the next requeue delay.
///
/// The delay doubles with each failure, starting at `base` and capped at
/// `max`. A successful pass calls [`RequeueBackoff::forget`].
#[derive(Debug, Clone)]
pub struct RequeueBackoff {
    base: Duration,
    max: Duration,

    /// Tracked failures: key -> consecutive failure count.
    failures: BTreeMap<String, u32>,
}

impl RequeueBackoff {
    /// Create a new backoff tracker.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for `key` and return how long to wait before retrying.
    pub fn record_failure(&mut self, key: &str) -> Duration {
        let count = self.failures.entry(key.to_string()).or_insert(0);
        let exp = (*count).min(31);
        *count = count.saturating_add(1);

        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Number of failures recorded for `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    /// Clear failure tracking for `key` (on success).
    pub fn forget(&mut self, key: &str) {
        self.failures.remove(key);
    }
}

impl Default for RequeueBackoff {
    fn default() -> Self {
        Self::new(crate::DEFAULT_BASE_BACKOFF, crate::DEFAULT_MAX_BACKOFF)
    }
}
