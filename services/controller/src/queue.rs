//! Deduplicating work queue of job keys.
//!
//! - A key queued several times before a worker picks it up is processed once.
//! - A key is never handed to two workers at once. Adding a key while it is
//!   being processed marks it dirty; `done` puts it back on the queue.
//! - Failed keys are re-added with per-key exponential backoff.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tfop_reconcile::RequeueBackoff;
use tokio::sync::Notify;
use tracing::debug;

use crate::model::JobKey;

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<JobKey>,
    dirty: HashSet<JobKey>,
    processing: HashSet<JobKey>,
    shutting_down: bool,
}

/// Work queue shared by the notification handler and the worker pool.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    backoff: Mutex<RequeueBackoff>,
    notify: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backoff(backoff: RequeueBackoff) -> Self {
        Self {
            backoff: Mutex::new(backoff),
            ..Self::default()
        }
    }

    /// Queue `key` unless it is already waiting.
    pub fn add(&self, key: JobKey) {
        let mut state = lock(&self.state);
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Queue `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: JobKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Queue `key` after its backoff delay, which grows with every call until `forget`.
    pub fn add_rate_limited(self: &Arc<Self>, key: JobKey) {
        let delay = lock(&self.backoff).record_failure(&key.to_string());
        debug!(job = %key, delay_ms = delay.as_millis() as u64, "Requeueing with backoff");
        self.add_after(key, delay);
    }

    /// Reset the backoff of `key`.
    pub fn forget(&self, key: &JobKey) {
        lock(&self.backoff).forget(&key.to_string());
    }

    pub fn num_requeues(&self, key: &JobKey) -> u32 {
        lock(&self.backoff).num_requeues(&key.to_string())
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// The caller owns the key until it calls [`WorkQueue::done`].
    pub async fn get(&self) -> Option<JobKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = lock(&self.state);
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release `key`; re-queue it if it was added while being processed.
    pub fn done(&self, key: &JobKey) {
        let mut state = lock(&self.state);
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shut_down(&self) {
        lock(&self.state).shutting_down = true;
        self.notify.notify_waiters();
    }

    /// Keys waiting to be processed.
    pub fn len(&self) -> usize {
        lock(&self.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> JobKey {
        JobKey::new("default", name)
    }

    #[tokio::test]
    async fn test_duplicate_adds_collapse() {
        let queue = WorkQueue::new();
        for _ in 0..5 {
            queue.add(key("a"));
        }
        queue.add(key("b"));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await, Some(key("a")));
        assert_eq!(queue.get().await, Some(key("b")));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_processing_requeues_on_done() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        let k = queue.get().await.unwrap();

        queue.add(key("a"));
        queue.add(key("a"));
        // Not handed out while in flight.
        assert!(queue.is_empty());

        queue.done(&k);
        assert_eq!(queue.len(), 1);
        let again = queue.get().await.unwrap();
        queue.done(&again);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_shut_down_wakes_waiters() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add(key("late"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_get_waits_for_add() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;

        queue.add(key("a"));
        assert_eq!(waiter.await.unwrap(), Some(key("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_backoff_grows() {
        let queue = Arc::new(WorkQueue::new());

        queue.add_rate_limited(key("a"));
        queue.add_rate_limited(key("a"));
        assert_eq!(queue.num_requeues(&key("a")), 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.get().await, Some(key("a")));

        queue.forget(&key("a"));
        assert_eq!(queue.num_requeues(&key("a")), 0);
    }
}
