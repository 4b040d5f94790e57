//! Rate-limited work queues with the semantics the reconciliation loop
//! relies on: items are deduplicated by key while queued, an item whose key
//! is being processed is parked and re-queued once processing finishes
//! (coalescing any number of re-adds into a single retry), and failed items
//! come back after a per-key exponential backoff.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Base delay of the per-item exponential backoff.
const BASE_DELAY: Duration = Duration::from_millis(5);
/// Backoff ceiling.
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// Anything that can live on a [`RateLimitingQueue`]. The key carries the
/// dedup identity; two items with equal keys coalesce.
pub trait QueueItem: Clone + Send + Sync + 'static {
    type Key: Eq + Hash + Clone + Debug + Send + Sync + 'static;

    fn queue_key(&self) -> Self::Key;
}

struct Inner<T: QueueItem> {
    order: VecDeque<T::Key>,
    queued: AHashMap<T::Key, T>,
    processing: AHashSet<T::Key>,
    parked: AHashMap<T::Key, T>,
    failures: AHashMap<T::Key, u32>,
    shutting_down: bool,
}

impl<T: QueueItem> Default for Inner<T> {
    fn default() -> Self {
        Self {
            order: VecDeque::new(),
            queued: AHashMap::new(),
            processing: AHashSet::new(),
            parked: AHashMap::new(),
            failures: AHashMap::new(),
            shutting_down: false,
        }
    }
}

pub struct RateLimitingQueue<T: QueueItem> {
    inner: Arc<Mutex<Inner<T>>>,
    notify: Arc<Notify>,
}

impl<T: QueueItem> Clone for RateLimitingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            notify: self.notify.clone(),
        }
    }
}

impl<T: QueueItem> Default for RateLimitingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: QueueItem> RateLimitingQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Enqueue immediately. An already-queued item with the same key is
    /// replaced in place (latest value wins); an item whose key is currently
    /// being processed is parked until [`RateLimitingQueue::done`].
    pub fn add(&self, item: T) {
        let mut inner = self.inner.lock();
        if inner.shutting_down {
            return;
        }
        let key = item.queue_key();
        if inner.processing.contains(&key) {
            inner.parked.insert(key, item);
            return;
        }
        if inner.queued.insert(key.clone(), item).is_none() {
            inner.order.push_back(key);
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Enqueue after the item's current backoff delay, bumping its failure
    /// count. The count is reset by [`RateLimitingQueue::forget`].
    pub fn add_rate_limited(&self, item: T) {
        let delay = {
            let mut inner = self.inner.lock();
            if inner.shutting_down {
                return;
            }
            let failures = inner.failures.entry(item.queue_key()).or_insert(0);
            let delay = backoff_delay(*failures);
            *failures += 1;
            delay
        };
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Reset the item's failure count after a successful round.
    pub fn forget(&self, item: &T) {
        self.inner.lock().failures.remove(&item.queue_key());
    }

    /// Wait for the next item. Returns `None` once the queue has been shut
    /// down and drained. The returned item must be released with `done`.
    pub async fn next(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(key) = inner.order.pop_front() {
                    if let Some(item) = inner.queued.remove(&key) {
                        inner.processing.insert(key);
                        return Some(item);
                    }
                    continue;
                }
                if inner.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Finish processing an item obtained from `next`. A parked re-add for
    /// the same key is moved back onto the queue.
    pub fn done(&self, item: &T) {
        let mut inner = self.inner.lock();
        let key = item.queue_key();
        inner.processing.remove(&key);
        if inner.shutting_down {
            return;
        }
        if let Some(parked) = inner.parked.remove(&key) {
            inner.queued.insert(key.clone(), parked);
            inner.order.push_back(key);
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Stop accepting new items and wake all waiters. Items already queued
    /// are still handed out so workers drain before exiting.
    pub fn shut_down(&self) {
        self.inner.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn backoff_delay(failures: u32) -> Duration {
    let exp = failures.min(20);
    let delay = BASE_DELAY.saturating_mul(1u32 << exp);
    delay.min(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, pause, Duration};

    impl QueueItem for (&'static str, u32) {
        type Key = &'static str;

        fn queue_key(&self) -> Self::Key {
            self.0
        }
    }

    #[tokio::test]
    async fn deduplicates_queued_items_latest_wins() {
        let queue = RateLimitingQueue::new();
        queue.add(("a", 1));
        queue.add(("a", 2));
        queue.add(("b", 1));

        let first = queue.next().await.unwrap();
        assert_eq!(first, ("a", 2));
        queue.done(&first);
        let second = queue.next().await.unwrap();
        assert_eq!(second, ("b", 1));
        queue.done(&second);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn readd_during_processing_is_parked_until_done() {
        let queue = RateLimitingQueue::new();
        queue.add(("a", 1));
        let item = queue.next().await.unwrap();

        // re-adds while in flight coalesce into a single retry
        queue.add(("a", 2));
        queue.add(("a", 3));
        assert!(queue.is_empty());

        queue.done(&item);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next().await.unwrap(), ("a", 3));
    }

    #[tokio::test]
    async fn rate_limited_adds_back_off_exponentially() {
        pause();
        let queue = RateLimitingQueue::new();
        queue.add_rate_limited(("a", 1));
        advance(Duration::from_millis(6)).await;
        let item = queue.next().await.unwrap();
        queue.done(&item);

        // second failure waits ~10ms
        queue.add_rate_limited(("a", 2));
        advance(Duration::from_millis(6)).await;
        assert!(queue.is_empty());
        advance(Duration::from_millis(6)).await;
        assert_eq!(queue.next().await.unwrap(), ("a", 2));

        // forget resets the per-key counter
        queue.forget(&("a", 2));
        queue.done(&("a", 2));
        queue.add_rate_limited(("a", 3));
        // let the freshly spawned task register its sleep before the clock jumps,
        // and run to completion afterward
        tokio::task::yield_now().await;
        advance(Duration::from_millis(6)).await;
        tokio::task::yield_now().await;
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_drains_remaining_items() {
        let queue = RateLimitingQueue::new();
        queue.add(("a", 1));
        queue.shut_down();
        queue.add(("b", 1));

        let item = queue.next().await.unwrap();
        assert_eq!(item, ("a", 1));
        queue.done(&item);
        assert!(queue.next().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_workers() {
        let queue: RateLimitingQueue<(&'static str, u32)> = RateLimitingQueue::new();
        let mut waiter = Box::pin(queue.next());

        assert!(futures::poll!(&mut waiter).is_pending());
        queue.shut_down();
        assert!(waiter.await.is_none());
    }

    #[test]
    fn backoff_delay_is_capped() {
        assert_eq!(backoff_delay(0), Duration::from_millis(5));
        assert_eq!(backoff_delay(1), Duration::from_millis(10));
        assert_eq!(backoff_delay(30), Duration::from_secs(1000));
    }
}
