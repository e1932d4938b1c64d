//! Expectation tracking for asynchronously observed side effects.
//!
//! The cluster delivers change notifications some time after a create or
//! delete call returns, and may replay the controller's own actions. Each
//! key records how many creations and deletions it is still waiting to see.
//! While any are outstanding the reconciler must not act on that key again,
//! otherwise it would recompute the same diff from a stale observation and
//! issue duplicate calls.
//!
//! Entries live in a sharded concurrent map. Updates to one key never block
//! another key.

use std::fmt::Debug;
use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

/// Outstanding operation counts for one key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpectationCounts {
    /// Creations issued but not yet observed.
    pub adds: u64,

    /// Deletions issued but not yet observed.
    pub deletes: u64,
}

impl ExpectationCounts {
    /// Returns true when nothing is outstanding.
    pub fn fulfilled(&self) -> bool {
        self.adds == 0 && self.deletes == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    counts: ExpectationCounts,
    set_at: Instant,
}

/// Keyed expectation tracker.
#[derive(Debug)]
pub struct Expectations<K>
where
    K: Eq + Hash,
{
    entries: DashMap<K, Entry>,
    timeout: Duration,
}

impl<K> Expectations<K>
where
    K: Eq + Hash + Clone + Debug,
{
    /// Create a tracker whose entries expire after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            timeout,
        }
    }

    /// Set the number of creations about to be issued for `key`.
    ///
    /// Overwrites any previous add count. Must be called before the calls
    /// are issued.
    pub fn expect_creations(&self, key: &K, adds: u64) {
        let mut entry = self.entry(key);
        entry.counts.adds = adds;
        entry.set_at = Instant::now();
        debug!(key = ?key, adds, "Expecting creations");
    }

    /// Set the number of deletions about to be issued for `key`.
    pub fn expect_deletions(&self, key: &K, deletes: u64) {
        let mut entry = self.entry(key);
        entry.counts.deletes = deletes;
        entry.set_at = Instant::now();
        debug!(key = ?key, deletes, "Expecting deletions");
    }

    /// Add to the outstanding counts for `key`.
    pub fn raise_expectations(&self, key: &K, adds: u64, deletes: u64) {
        let mut entry = self.entry(key);
        entry.counts.adds += adds;
        entry.counts.deletes += deletes;
        entry.set_at = Instant::now();
        debug!(
            key = ?key,
            adds = entry.counts.adds,
            deletes = entry.counts.deletes,
            "Raised expectations"
        );
    }

    /// Record that one expected creation was observed (or will never be).
    pub fn creation_observed(&self, key: &K) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.counts.adds = entry.counts.adds.saturating_sub(1);
        }
    }

    /// Record that one expected deletion was observed (or will never be).
    pub fn deletion_observed(&self, key: &K) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.counts.deletes = entry.counts.deletes.saturating_sub(1);
        }
    }

    /// Returns true if reconciliation may act on `key`.
    ///
    /// A key with no recorded expectations is satisfied (cold start). An
    /// entry older than the timeout is treated as satisfied so that a lost
    /// notification cannot wedge the key.
    pub fn satisfied(&self, key: &K) -> bool {
        let Some(entry) = self.entries.get(key) else {
            return true;
        };

        if entry.counts.fulfilled() {
            return true;
        }

        if entry.set_at.elapsed() > self.timeout {
            warn!(
                key = ?key,
                adds = entry.counts.adds,
                deletes = entry.counts.deletes,
                "Expectations expired"
            );
            return true;
        }

        false
    }

    /// Current outstanding counts for `key`, if any were recorded.
    pub fn get(&self, key: &K) -> Option<ExpectationCounts> {
        self.entries.get(key).map(|e| e.counts)
    }

    /// Forget `key`.
    pub fn delete_expectations(&self, key: &K) {
        self.entries.remove(key);
    }

    /// Forget every key matching `pred`.
    pub fn delete_matching<F>(&self, pred: F)
    where
        F: Fn(&K) -> bool,
    {
        self.entries.retain(|k, _| !pred(k));
    }

    /// Number of tracked keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, key: &K) -> dashmap::mapref::one::RefMut<'_, K, Entry> {
        self.entries.entry(key.clone()).or_insert_with(|| Entry {
            counts: ExpectationCounts::default(),
            set_at: Instant::now(),
        })
    }
}
