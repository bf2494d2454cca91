//! Background side effects.
//!
//! Request flows finish the durable part of an operation and hand the rest
//! (cache upkeep, fan-out, push) to the [`TaskQueue`]. Units run
//! concurrently with no ordering or result guarantee.

use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{trace, warn};

use crate::metrics;

type Task = BoxFuture<'static, ()>;

#[derive(Debug, Default)]
struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

/// Decrements the pending count when a unit finishes, even by panic.
struct PendingGuard(Arc<Pending>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// A bounded queue of background units.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    sender: mpsc::Sender<Task>,
    pending: Arc<Pending>,
}

impl TaskQueue {
    /// Create a queue and start its dispatcher.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Task>(capacity.max(1));

        tokio::spawn(async move {
            while let Some(task) = receiver.recv().await {
                tokio::spawn(task);
            }
            trace!("task dispatcher stopped");
        });

        Self {
            sender,
            pending: Arc::new(Pending::default()),
        }
    }

    /// Enqueue a unit. Returns `false` if the queue is full and the unit
    /// was dropped.
    pub fn submit<F>(&self, name: &'static str, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pending.count.fetch_add(1, Ordering::AcqRel);
        let guard = PendingGuard(Arc::clone(&self.pending));

        let unit: Task = Box::pin(async move {
            let _guard = guard;
            task.await;
        });

        match self.sender.try_send(unit) {
            Ok(()) => true,
            Err(e) => {
                warn!(task = name, error = %e, "dropping background task");
                metrics::record_background_dropped(name);
                false
            }
        }
    }

    /// Number of units submitted but not yet finished.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.count.load(Ordering::Acquire)
    }

    /// Wait until every submitted unit, including units submitted while
    /// waiting, has finished.
    pub async fn drain(&self) {
        loop {
            let notified = self.pending.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_drain_waits_for_all_units() {
        let queue = TaskQueue::new(16);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let done = Arc::clone(&done);
            assert!(queue.submit("count", async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }

        queue.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 8);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_drain_covers_nested_units() {
        let queue = TaskQueue::new(16);
        let done = Arc::new(AtomicUsize::new(0));

        let inner_queue = queue.clone();
        let inner_done = Arc::clone(&done);
        queue.submit("outer", async move {
            inner_queue.submit("inner", async move {
                inner_done.fetch_add(1, Ordering::SeqCst);
            });
        });

        queue.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_unit() {
        let queue = TaskQueue::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        // Occupies the only slot until the dispatcher picks it up.
        let mut accepted = 0;
        let mut release_rx = Some(release_rx);
        for _ in 0..64 {
            let rx = release_rx.take();
            if queue.submit("block", async move {
                if let Some(rx) = rx {
                    let _ = rx.await;
                }
            }) {
                accepted += 1;
            }
        }

        assert!(accepted < 64);
        let _ = release_tx.send(());
        queue.drain().await;
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_drain_when_idle_returns() {
        let queue = TaskQueue::new(4);
        tokio::time::timeout(Duration::from_secs(1), queue.drain())
            .await
            .unwrap();
    }
}
