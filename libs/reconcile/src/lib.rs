//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge desired state to observed state. Key concepts:
//!
//! - **Desired state**: What the system should look like (from the job spec).
//! - **Observed state**: What the cluster reports, delivered asynchronously.
//! - **Expectations**: Side effects issued but not yet observed. A pass only
//!   runs business logic for a key once its expectations are satisfied.
//!
//! # Invariants
//!
//! - Expectations gate reconciliation; they never drive the diff
//! - Decisions are deterministic given the same inputs
//! - Scale-down always removes the highest ordinals first

mod backoff;
mod expectations;

use std::time::Duration;

pub use backoff::RequeueBackoff;
pub use expectations::{ExpectationCounts, Expectations};

/// Select scale-down victims from a set of ordinal-indexed candidates.
///
/// Candidates are sorted by descending ordinal and the first `excess` are
/// returned, so low ordinals ("primary" replicas) always survive. Ties keep
/// their input order.
pub fn select_for_scale_down<T, F>(candidates: Vec<T>, excess: usize, get_ordinal: F) -> Vec<T>
where
    F: Fn(&T) -> i32,
{
    let mut with_ordinal: Vec<_> = candidates
        .into_iter()
        .map(|c| {
            let o = get_ordinal(&c);
            (o, c)
        })
        .collect();

    with_ordinal.sort_by(|(a, _), (b, _)| b.cmp(a));
    with_ordinal
        .into_iter()
        .take(excess)
        .map(|(_, c)| c)
        .collect()
}

/// Default periodic resync interval.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Default age after which unsatisfied expectations are considered expired.
pub const DEFAULT_EXPECTATIONS_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default initial requeue delay after a failed pass.
pub const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(5);

/// Default ceiling for the requeue delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(1000);
