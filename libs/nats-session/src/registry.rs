//! Background task handles and the subscription registry.
//!
//! Every delivery loop (subscription, watcher, stats poller) runs as its own
//! task and watches a [`CancellationToken`]. Stopping is cooperative: the
//! loop finishes the item it is handling, sees the token and returns.

use std::collections::BTreeMap;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::metrics;
use crate::models::SubscriptionInfo;

/// Owns a spawned background loop and the token that stops it.
///
/// Dropping the handle cancels the loop.
#[derive(Debug)]
pub struct TaskHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Spawn `f(token)` on the runtime and keep its handle.
    pub fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let task = tokio::spawn(f(token.clone()));
        Self {
            token,
            task: Some(task),
        }
    }

    /// Ask the loop to stop. Does not wait for it.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Ask the loop to stop and wait until it has returned.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                trace!(?err, "background task ended abnormally");
            }
        }
    }

    /// true once the loop has returned
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().is_none_or(|t| t.is_finished())
    }

    /// true once a stop was requested
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    #[cfg(test)]
    pub(crate) fn token_for_test(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// A registered subscription.
#[derive(Debug)]
pub struct ActiveSubscription {
    pub subject: String,
    handle: TaskHandle,
}

/// Subscriptions keyed by a session-unique, increasing id.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: BTreeMap<u64, ActiveSubscription>,
    last_id: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the id the next subscription will get.
    pub fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    /// Register a running delivery loop under `id` (from [`next_id`]).
    ///
    /// [`next_id`]: SubscriptionRegistry::next_id
    pub fn insert(&mut self, id: u64, subject: String, handle: TaskHandle) -> SubscriptionInfo {
        self.entries.insert(
            id,
            ActiveSubscription {
                subject: subject.clone(),
                handle,
            },
        );
        metrics::ACTIVE_SUBSCRIPTIONS.set(self.entries.len() as i64);
        SubscriptionInfo {
            id,
            subject,
            count: self.entries.len(),
        }
    }

    /// Remove and stop a subscription. Unknown ids are ignored.
    pub fn remove(&mut self, id: u64) -> Option<ActiveSubscription> {
        let removed = self.entries.remove(&id);
        if let Some(sub) = &removed {
            sub.handle.stop();
            metrics::ACTIVE_SUBSCRIPTIONS.set(self.entries.len() as i64);
        }
        removed
    }

    /// Stop everything and reset the id counter.
    pub fn clear(&mut self) {
        for sub in self.entries.values() {
            sub.handle.stop();
        }
        self.entries.clear();
        self.last_id = 0;
        metrics::ACTIVE_SUBSCRIPTIONS.set(0);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(id, subject)` pairs in id order.
    pub fn list(&self) -> Vec<(u64, String)> {
        self.entries
            .iter()
            .map(|(id, sub)| (*id, sub.subject.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_task() -> TaskHandle {
        TaskHandle::spawn(|token| async move { token.cancelled().await })
    }

    #[tokio::test]
    async fn test_count_tracks_registrations() {
        let mut registry = SubscriptionRegistry::new();
        let mut live = 0usize;

        // interleaved subscribe/unsubscribe, including repeats and unknown ids
        let script: &[(bool, u64)] = &[
            (true, 0),
            (true, 0),
            (false, 1),
            (true, 0),
            (false, 1),
            (false, 42),
            (true, 0),
            (false, 2),
        ];
        for &(subscribe, id) in script {
            if subscribe {
                let id = registry.next_id();
                let info = registry.insert(id, format!("s.{id}"), idle_task());
                live += 1;
                assert_eq!(info.count, live);
            } else if registry.remove(id).is_some() {
                live -= 1;
            }
            assert_eq!(registry.len(), live);
        }
        assert_eq!(
            registry.list(),
            vec![(3, "s.3".to_owned()), (4, "s.4".to_owned())]
        );
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_reset_on_clear() {
        let mut registry = SubscriptionRegistry::new();
        let a = registry.next_id();
        registry.insert(a, "a".into(), idle_task());
        let b = registry.next_id();
        registry.insert(b, "b".into(), idle_task());
        assert_eq!((a, b), (1, 2));

        registry.remove(a);
        let c = registry.next_id();
        assert_eq!(c, 3);

        registry.clear();
        assert!(registry.is_empty());
        assert_eq!(registry.next_id(), 1);
    }

    #[tokio::test]
    async fn test_remove_stops_loop() {
        let mut registry = SubscriptionRegistry::new();
        let id = registry.next_id();
        registry.insert(id, "a".into(), idle_task());
        let removed = registry.remove(id).unwrap();
        assert!(removed.handle.is_stopped());
        assert!(registry.remove(id).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_loop() {
        let handle = idle_task();
        assert!(!handle.is_stopped());
        let stopped = handle.token.clone();
        handle.shutdown().await;
        assert!(stopped.is_cancelled());
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let handle = idle_task();
        let token = handle.token.clone();
        drop(handle);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_loop_finishes_current_item_before_stopping() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use tokio::sync::Notify;

        let done = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(Notify::new());
        let (seen, handling) = (done.clone(), started.clone());
        let (tx, mut rx) = tokio::sync::mpsc::channel::<u32>(4);
        let handle = TaskHandle::spawn(move |token| async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    item = rx.recv() => {
                        let Some(_item) = item else { return };
                        handling.notify_one();
                        tokio::task::yield_now().await;
                        seen.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        });
        tx.send(1).await.unwrap();
        started.notified().await;
        handle.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
