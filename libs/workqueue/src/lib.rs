//! Deduplicating work queue.
//!
//! This library provides the queue that decouples event arrival from
//! event processing in reconciliation loops. Key guarantees:
//!
//! - **Dedup**: duplicate [`WorkQueue::add`] calls for a key that is
//!   already pending collapse into a single delivery.
//! - **At most one in flight**: a key handed to a consumer is not
//!   handed to another consumer until [`WorkQueue::done`] is called.
//! - **No loss**: a key re-added while it is being processed is
//!   redelivered exactly once after the current pass completes.
//!
//! Consumers suspend inside [`WorkQueue::get`] while the queue is
//! empty; there is no polling or spinning.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::pin::pin;
use std::sync::Mutex;

use tokio::sync::Notify;

/// Internal queue state, guarded by a single mutex.
struct QueueState<K> {
    /// Keys pending dispatch.
    added: HashSet<K>,

    /// Keys currently held by a consumer.
    processing: HashSet<K>,

    /// Dispatch order. A key in the backlog without a pending mark in
    /// `added` was removed after enqueue and is skipped at dequeue.
    backlog: VecDeque<K>,

    /// Set by `close`; `get` drains the backlog and then returns `None`.
    closed: bool,
}

/// A deduplicating work queue keyed by a stable, comparable identity.
///
/// Key the queue by an explicit identifier field (for example a record
/// name), not by structural equality of a mutable record. Two updates
/// to the same logical item must map to the same key or dedup breaks.
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

impl<K: Clone + Eq + Hash> WorkQueue<K> {
    /// Create an empty, open queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                added: HashSet::new(),
                processing: HashSet::new(),
                backlog: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Mark a key for processing.
    ///
    /// Idempotent: a key that is already pending is left alone. A key
    /// currently being processed is marked pending without entering
    /// the backlog; `done` redelivers it. Adds after `close` are
    /// ignored.
    pub fn add(&self, key: K) {
        let mut state = self.state.lock().expect("workqueue lock poisoned");
        if state.closed || state.added.contains(&key) {
            return;
        }
        state.added.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.backlog.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Take the next key to process.
    ///
    /// Suspends until a key is available or the queue has been closed
    /// and drained. `None` is the shutdown signal; the consumer loop
    /// should return. The returned key is held as in-flight until the
    /// matching [`done`](Self::done) call.
    pub async fn get(&self) -> Option<K> {
        loop {
            // Register for a wakeup before inspecting state, so a
            // notify between the check and the await is not lost.
            let mut notified = pin!(self.notify.notified());
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().expect("workqueue lock poisoned");
                while let Some(key) = state.backlog.pop_front() {
                    if !state.added.remove(&key) {
                        // Removed after enqueue; skip without yielding.
                        continue;
                    }
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Mark a key's processing pass as finished.
    ///
    /// If the key was re-added while in flight, it goes back into the
    /// backlog so the newer event is not silently dropped.
    pub fn done(&self, key: &K) {
        let mut state = self.state.lock().expect("workqueue lock poisoned");
        state.processing.remove(key);
        if state.added.contains(key) {
            state.backlog.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Withdraw a pending key before it is dequeued.
    ///
    /// A key already handed to a consumer is unaffected.
    pub fn remove(&self, key: &K) {
        let mut state = self.state.lock().expect("workqueue lock poisoned");
        state.added.remove(key);
    }

    /// Close the queue.
    ///
    /// Blocked and future `get` calls return `None` once the backlog
    /// is drained.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("workqueue lock poisoned");
        state.closed = true;
        drop(state);
        self.notify.notify_waiters();
    }

    /// Number of keys waiting in the backlog.
    pub fn len(&self) -> usize {
        let state = self.state.lock().expect("workqueue lock poisoned");
        state.backlog.len()
    }

    /// True if no keys are waiting in the backlog.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Clone + Eq + Hash> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_add_dedups_pending_keys() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.add("a");
        queue.add("a");
        queue.add("b");

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_readd_during_processing_redelivers_once() {
        let queue = WorkQueue::new();
        queue.add("a");

        let key = queue.get().await.unwrap();
        assert_eq!(key, "a");

        // Arrives while "a" is in flight: no backlog entry yet.
        queue.add("a");
        queue.add("a");
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await, Some("a"));
        queue.done(&"a");

        // Exactly once: nothing left afterwards.
        queue.close();
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn test_done_without_readd_leaves_queue_empty() {
        let queue = WorkQueue::new();
        queue.add("a");
        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_remove_withdraws_pending_key() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.add("b");
        queue.remove(&"a");

        // "a" is skipped at dequeue, "b" comes out.
        assert_eq!(queue.get().await, Some("b"));

        // A fresh add makes the key deliverable again.
        queue.add("a");
        assert_eq!(queue.get().await, Some("a"));
    }

    #[tokio::test]
    async fn test_remove_does_not_affect_in_flight_key() {
        let queue = WorkQueue::new();
        queue.add("a");
        let key = queue.get().await.unwrap();

        queue.remove(&key);
        queue.add("a");
        queue.done(&key);

        // The re-add during processing still wins.
        assert_eq!(queue.get().await, Some("a"));
    }

    #[tokio::test]
    async fn test_close_drains_then_stops() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.close();

        assert_eq!(queue.get().await, Some("a"));
        assert_eq!(queue.get().await, None);
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_consumer() {
        let queue = Arc::new(WorkQueue::<String>::new());

        let consumer = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.get().await }
        });

        // Let the consumer park inside get().
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();

        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer did not observe close")
            .unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_add_wakes_blocked_consumer() {
        let queue = Arc::new(WorkQueue::new());

        let consumer = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.get().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.add("a");

        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("consumer did not wake on add")
            .unwrap();
        assert_eq!(got, Some("a"));
    }

    #[tokio::test]
    async fn test_add_after_close_is_ignored() {
        let queue = WorkQueue::new();
        queue.close();
        queue.add("a");
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn test_concurrent_producers_single_consumer() {
        let queue = Arc::new(WorkQueue::new());

        let mut producers = Vec::new();
        for _ in 0..4 {
            producers.push(tokio::spawn({
                let queue = Arc::clone(&queue);
                async move {
                    for i in 0..50u32 {
                        queue.add(i % 10);
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }

        let consumer = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move {
                let mut delivered = 0usize;
                while let Some(key) = queue.get().await {
                    queue.done(&key);
                    delivered += 1;
                }
                delivered
            }
        });

        for p in producers {
            p.await.unwrap();
        }
        queue.close();

        // Heavy duplication across producers collapses well below the
        // 200 raw adds; every delivery was a distinct pending mark.
        let delivered = consumer.await.unwrap();
        assert!(delivered >= 10);
        assert!(delivered <= 200);
    }
}
