//! Deduplicating work queue with per-item exponential backoff.
//!
//! A key is processed by at most one worker at a time. Adding a key that is
//! already queued is a no-op, and adding a key while it is being processed
//! marks it dirty so it is queued again once the worker calls
//! [`WorkQueue::done`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::debug;

/// Exponential backoff policy: `base_delay * multiplier^failures`, capped at
/// `max_delay` when set.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Growth factor per consecutive failure.
    pub multiplier: f64,
    /// Upper bound for any single delay.
    pub max_delay: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_delay: Some(Duration::from_secs(1000)),
        }
    }
}

impl BackoffPolicy {
    /// Create a policy with the given base delay and multiplier, uncapped.
    #[must_use]
    pub const fn new(base_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay: None,
        }
    }

    /// Cap every delay at `max_delay`.
    #[must_use]
    pub const fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Delay before the retry that follows `failures` earlier failures.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);

        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

struct Inner<K> {
    name: String,
    policy: BackoffPolicy,
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

/// Rate-limited deduplicating work queue. Cloning yields another handle to
/// the same queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync + 'static,
{
    /// Create a named queue using `policy` for rate-limited adds.
    pub fn new(name: impl Into<String>, policy: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                policy,
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
            }),
        }
    }

    /// Queue name, for logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queue `key` unless it is already waiting.
    pub async fn add(&self, key: K) {
        let mut state = self.inner.state.lock().await;
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }

        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            debug!(queue = %self.inner.name, key = ?key, "Key in flight, marked dirty");
            return;
        }

        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Queue `key` after `delay` on a timer task.
    pub async fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down().await {
            return;
        }
        if delay.is_zero() {
            self.add(key).await;
            return;
        }

        debug!(
            queue = %self.inner.name,
            key = ?key,
            delay_ms = delay.as_millis(),
            "Scheduling delayed add"
        );
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key).await;
        });
    }

    /// Queue `key` after its backoff delay and count the failure.
    pub async fn add_rate_limited(&self, key: K) {
        let delay = {
            let mut state = self.inner.state.lock().await;
            let failures = state.failures.entry(key.clone()).or_insert(0);
            let delay = self.inner.policy.delay_for(*failures);
            *failures = failures.saturating_add(1);
            delay
        };
        self.add_after(key, delay).await;
    }

    /// Reset the backoff of `key`.
    pub async fn forget(&self, key: &K) {
        self.inner.state.lock().await.failures.remove(key);
    }

    /// Number of failures recorded for `key` since it was last forgotten.
    pub async fn num_requeues(&self, key: &K) -> u32 {
        self.inner
            .state
            .lock()
            .await
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// The caller must hand the key back with [`WorkQueue::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock().await;
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

    /// Mark `key` as processed, re-queueing it if it was added meanwhile.
    pub async fn done(&self, key: &K) {
        let mut state = self.inner.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Number of keys waiting.
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    /// Whether no key is waiting.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Stop handing out keys and release every waiting worker.
    pub async fn shut_down(&self) {
        self.inner.state.lock().await.shutting_down = true;
        self.inner.notify.notify_waiters();
        debug!(queue = %self.inner.name, "Queue shut down");
    }

    /// Whether [`WorkQueue::shut_down`] was called.
    pub async fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().await.shutting_down
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use proptest::prelude::*;

    fn queue() -> WorkQueue<&'static str> {
        WorkQueue::new("test", BackoffPolicy::default())
    }

    #[test]
    fn test_default_policy_doubles_from_five_millis() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(5));
        assert_eq!(policy.delay_for(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for(3), Duration::from_millis(40));
    }

    #[test]
    fn test_policy_respects_cap() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), 10.0)
            .with_max_delay(Duration::from_secs(1));
        assert_eq!(policy.delay_for(5), Duration::from_secs(1));
    }

    #[test]
    fn test_uncapped_policy_saturates() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), 2.0);
        assert_eq!(policy.delay_for(u32::MAX), Duration::MAX);
    }

    proptest! {
        #[test]
        fn prop_delay_is_monotonic_and_capped(failures in 0u32..200, base_ms in 1u64..1000) {
            let cap = Duration::from_secs(60);
            let policy = BackoffPolicy::new(Duration::from_millis(base_ms), 2.0).with_max_delay(cap);

            let current = policy.delay_for(failures);
            let next = policy.delay_for(failures.saturating_add(1));
            prop_assert!(next >= current);
            prop_assert!(current <= cap);
        }
    }

    #[test]
    fn test_clones_share_name() {
        let q = WorkQueue::<&'static str>::new("RevisionController", BackoffPolicy::default());
        assert_eq!(q.clone().name(), "RevisionController");
    }

    #[tokio::test]
    async fn test_add_deduplicates() {
        let q = queue();
        q.add("key").await;
        q.add("key").await;
        q.add("key").await;
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn test_add_while_processing_requeues_on_done() {
        let q = queue();
        q.add("key").await;

        let key = q.get().await.unwrap();
        q.add("key").await;
        assert!(q.is_empty().await, "in-flight key must not be queued twice");

        q.done(&key).await;
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn test_done_without_dirty_leaves_queue_empty() {
        let q = queue();
        q.add("key").await;
        let key = q.get().await.unwrap();
        q.done(&key).await;
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn test_shut_down_releases_waiting_worker() {
        let q = queue();
        let worker = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };

        tokio::task::yield_now().await;
        q.shut_down().await;

        let got = tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_add_after_shut_down_is_dropped() {
        let q = queue();
        q.shut_down().await;
        q.add("key").await;
        assert!(q.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_add_backs_off() {
        let q = WorkQueue::new("test", BackoffPolicy::new(Duration::from_millis(100), 2.0));

        q.add_rate_limited("key").await;
        q.add_rate_limited("key").await;
        assert_eq!(q.num_requeues(&"key").await, 2);
        assert!(q.is_empty().await);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(q.len().await, 1);

        q.forget(&"key").await;
        assert_eq!(q.num_requeues(&"key").await, 0);
    }
}
