use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use vmctl_common::ResourceKey;

pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Delay before the `failures`-th retry: 1s doubling, capped at 5 minutes.
pub fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    BACKOFF_BASE.saturating_mul(1u32 << exp).min(BACKOFF_MAX)
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ResourceKey>,
    /// Keys waiting in `queue` or re-added while processing.
    dirty: HashSet<ResourceKey>,
    processing: HashSet<ResourceKey>,
    failures: HashMap<ResourceKey, u32>,
    shutting_down: bool,
}

/// Deduplicating work queue. A key is handed to at most one worker at a
/// time; adding a key that is being processed defers it until `done`.
#[derive(Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, key: ResourceKey) {
        let mut state = self.state.lock().await;
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if !state.processing.contains(&key) {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Adds `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: ResourceKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Schedules a retry with per-key exponential backoff; returns the delay.
    pub async fn add_rate_limited(self: &Arc<Self>, key: ResourceKey) -> Duration {
        let failures = {
            let mut state = self.state.lock().await;
            let n = state.failures.entry(key.clone()).or_insert(0);
            *n = n.saturating_add(1);
            *n
        };
        let delay = backoff_delay(failures);
        self.add_after(key, delay);
        delay
    }

    /// Clears the backoff history of `key`.
    pub async fn forget(&self, key: &ResourceKey) {
        self.state.lock().await.failures.remove(key);
    }

    pub async fn failures(&self, key: &ResourceKey) -> u32 {
        self.state
            .lock()
            .await
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Waits for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<ResourceKey> {
        loop {
            // Register before checking so a shutdown in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state.lock().await;
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Marks `key` as processed, re-queueing it if it was added meanwhile.
    pub async fn done(&self, key: &ResourceKey) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub async fn shutdown(&self) {
        self.state.lock().await.shutting_down = true;
        self.notify.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new("default", name)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        assert_eq!(backoff_delay(9), Duration::from_secs(256));
        assert_eq!(backoff_delay(10), BACKOFF_MAX);
        assert_eq!(backoff_delay(u32::MAX), BACKOFF_MAX);
    }

    #[tokio::test]
    async fn duplicate_adds_collapse() {
        let queue = WorkQueue::new();
        queue.add(key("a")).await;
        queue.add(key("a")).await;
        queue.add(key("b")).await;
        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.get().await, Some(key("a")));
        assert_eq!(queue.get().await, Some(key("b")));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn key_in_flight_is_not_handed_out_twice() {
        let queue = WorkQueue::new();
        queue.add(key("a")).await;
        let first = queue.get().await.unwrap();

        // Re-added while processing: held back until done.
        queue.add(key("a")).await;
        assert!(queue.is_empty().await);

        queue.done(&first).await;
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.get().await, Some(key("a")));
    }

    #[tokio::test]
    async fn shutdown_releases_waiters() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.shutdown().await;
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, None);

        queue.add(key("late")).await;
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn waiting_worker_wakes_on_add() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        queue.add(key("a")).await;
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Some(key("a")));
    }

    #[tokio::test]
    async fn rate_limited_retries_back_off_until_forgotten() {
        let queue = Arc::new(WorkQueue::new());
        assert_eq!(queue.add_rate_limited(key("a")).await, Duration::from_secs(1));
        assert_eq!(queue.add_rate_limited(key("a")).await, Duration::from_secs(2));
        assert_eq!(queue.failures(&key("a")).await, 2);
        queue.forget(&key("a")).await;
        assert_eq!(queue.failures(&key("a")).await, 0);
    }

    #[tokio::test]
    async fn add_after_enqueues_later() {
        let queue = Arc::new(WorkQueue::new());
        queue.add_after(key("a"), Duration::from_millis(20));
        assert!(queue.is_empty().await);
        let got = tokio::time::timeout(Duration::from_secs(1), queue.get())
            .await
            .unwrap();
        assert_eq!(got, Some(key("a")));
    }
}
