//! Work queue with per-name delayed re-enqueue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;

use catalog_core::types::RepoName;
use catalog_sync::Requeue;

use crate::paths::{RETRY_BASE, RETRY_MAX};

type Deadlines = Arc<Mutex<HashMap<RepoName, Instant>>>;

/// Delivers repository names to the processor, either now or after a delay.
/// At most one delayed delivery is pending per name; the earliest wins.
#[derive(Debug, Clone)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<RepoName>,
    deadlines: Deadlines,
    runtime: Handle,
}

impl WorkQueue {
    pub fn new(runtime: Handle) -> (Self, mpsc::UnboundedReceiver<RepoName>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            tx,
            deadlines: Arc::new(Mutex::new(HashMap::new())),
            runtime,
        };
        (queue, rx)
    }

    pub fn enqueue(&self, name: RepoName) {
        if self.tx.send(name).is_err() {
            tracing::debug!("work queue closed, dropping item");
        }
    }

    /// Number of delayed deliveries still waiting.
    pub fn pending(&self) -> usize {
        lock(&self.deadlines).len()
    }

    fn schedule(&self, name: &RepoName, after: Duration) {
        let deadline = Instant::now() + after;
        {
            let mut deadlines = lock(&self.deadlines);
            if matches!(deadlines.get(name), Some(existing) if *existing <= deadline) {
                return;
            }
            deadlines.insert(name.clone(), deadline);
        }

        let deadlines = self.deadlines.clone();
        let tx = self.tx.clone();
        let name = name.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let due = {
                let mut deadlines = lock(&deadlines);
                if deadlines.get(&name) == Some(&deadline) {
                    deadlines.remove(&name);
                    true
                } else {
                    false
                }
            };
            if due {
                let _ = tx.send(name);
            }
        });
    }
}

impl Requeue for WorkQueue {
    fn enqueue_after(&self, name: &RepoName, after: Duration) {
        self.schedule(name, after);
    }
}

/// Delay before retrying after the `failures`-th consecutive failure.
pub fn retry_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    RETRY_BASE
        .saturating_mul(1u32 << exponent)
        .min(RETRY_MAX)
}

fn lock(deadlines: &Deadlines) -> MutexGuard<'_, HashMap<RepoName, Instant>> {
    deadlines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[test]
    fn retry_delay_doubles_then_caps() {
        assert_eq!(retry_delay(1), Duration::from_secs(1));
        assert_eq!(retry_delay(2), Duration::from_secs(2));
        assert_eq!(retry_delay(5), Duration::from_secs(16));
        assert_eq!(retry_delay(9), Duration::from_secs(256));
        assert_eq!(retry_delay(10), RETRY_MAX);
        assert_eq!(retry_delay(u32::MAX), RETRY_MAX);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn delayed_item_arrives_after_its_deadline() {
        let (queue, mut rx) = WorkQueue::new(Handle::current());
        queue.enqueue_after(&RepoName::from("charts"), Duration::from_secs(300));
        assert_eq!(queue.pending(), 1);

        advance(Duration::from_secs(299)).await;
        assert!(rx.try_recv().is_err());

        advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(rx.recv().await, Some(RepoName::from("charts")));
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn earliest_deadline_wins_and_fires_once() {
        let (queue, mut rx) = WorkQueue::new(Handle::current());
        let name = RepoName::from("charts");
        queue.enqueue_after(&name, Duration::from_secs(300));
        queue.enqueue_after(&name, Duration::from_secs(5));
        queue.enqueue_after(&name, Duration::from_secs(60));
        assert_eq!(queue.pending(), 1);

        advance(Duration::from_secs(6)).await;
        assert_eq!(rx.recv().await, Some(name.clone()));

        advance(Duration::from_secs(400)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn immediate_enqueue_is_delivered_in_order() {
        let (queue, mut rx) = WorkQueue::new(Handle::current());
        queue.enqueue(RepoName::from("a"));
        queue.enqueue(RepoName::from("b"));
        assert_eq!(rx.recv().await, Some(RepoName::from("a")));
        assert_eq!(rx.recv().await, Some(RepoName::from("b")));
    }
}
