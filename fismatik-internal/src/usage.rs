//! Usage Accountant - delivers token-usage events to the quota store off the request path
//!
//! ## Design
//!
//! Request handlers call [`UsageAccountant::submit`], which never blocks or fails. Events go into a
//! bounded in-memory queue; when it is full the oldest queued event is dropped. A single background
//! worker drains the queue and writes each event through [`QuotaStore::increment_token_usage`].
//!
//! Write failures are logged and counted, never surfaced to the caller. On shutdown the worker
//! drains whatever is still queued before exiting.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use metrics::counter;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::quota::QuotaStore;

#[derive(Debug, Clone, PartialEq)]
pub struct UsageEvent {
    pub user_id: String,
    pub token_count: u64,
    pub timestamp: DateTime<Utc>,
}

impl UsageEvent {
    pub fn now(user_id: impl Into<String>, token_count: u64) -> Self {
        Self {
            user_id: user_id.into(),
            token_count,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageStats {
    pub submitted: u64,
    pub written: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

struct Shared {
    queue: Mutex<VecDeque<UsageEvent>>,
    notify: Notify,
    capacity: usize,
    counters: Counters,
}

impl Shared {
    fn pop(&self) -> Option<UsageEvent> {
        // Held only for push/pop.
        #[expect(clippy::expect_used)]
        let mut queue = self.queue.lock().expect("usage queue mutex poisoned");
        queue.pop_front()
    }
}

#[derive(Clone)]
pub struct UsageAccountant {
    shared: Arc<Shared>,
}

impl UsageAccountant {
    /// Starts the background worker. It exits once `shutdown` flips to `true` (or its sender is
    /// dropped) and the queue is empty.
    pub fn spawn(
        store: QuotaStore,
        capacity: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            notify: Notify::new(),
            capacity: capacity.max(1),
            counters: Counters::default(),
        });
        let handle = tokio::spawn(Self::worker(Arc::clone(&shared), store, shutdown));
        (Self { shared }, handle)
    }

    pub fn submit(&self, event: UsageEvent) {
        self.shared
            .counters
            .submitted
            .fetch_add(1, Ordering::Relaxed);
        let dropped = {
            #[expect(clippy::expect_used)]
            let mut queue = self
                .shared
                .queue
                .lock()
                .expect("usage queue mutex poisoned");
            let dropped = if queue.len() >= self.shared.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(event);
            dropped
        };
        if let Some(dropped) = dropped {
            self.shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
            counter!("fismatik_usage_events_dropped_total").increment(1);
            warn!(
                user_id = dropped.user_id,
                "Usage queue full, dropped {} tokens of usage",
                dropped.token_count
            );
        }
        self.shared.notify.notify_one();
    }

    pub fn stats(&self) -> UsageStats {
        let counters = &self.shared.counters;
        UsageStats {
            submitted: counters.submitted.load(Ordering::Relaxed),
            written: counters.written.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
        }
    }

    async fn worker(shared: Arc<Shared>, store: QuotaStore, mut shutdown: watch::Receiver<bool>) {
        info!("Usage accountant started: queue_capacity={}", shared.capacity);
        let mut stopping = false;
        loop {
            if let Some(event) = shared.pop() {
                Self::write(&shared, &store, event).await;
                continue;
            }
            if stopping || *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shared.notify.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        stopping = true;
                    }
                }
            }
        }
        info!("Usage accountant stopped");
    }

    async fn write(shared: &Shared, store: &QuotaStore, event: UsageEvent) {
        match store
            .increment_token_usage(&event.user_id, event.token_count)
            .await
        {
            Ok(()) => {
                shared.counters.written.fetch_add(1, Ordering::Relaxed);
                counter!("fismatik_usage_events_written_total").increment(1);
                debug!(
                    user_id = event.user_id,
                    "Recorded {} tokens of usage",
                    event.token_count
                );
            }
            Err(e) => {
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                counter!("fismatik_usage_events_failed_total").increment(1);
                warn!(
                    user_id = event.user_id,
                    "Failed to record {} tokens of usage: {e}",
                    event.token_count
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::quota::MockQuotaStore;

    async fn wait_for(accountant: &UsageAccountant, done: impl Fn(UsageStats) -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !done(accountant.stats()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_events_are_written() {
        let mock = Arc::new(MockQuotaStore::default());
        let (_tx, rx) = watch::channel(false);
        let (accountant, _handle) =
            UsageAccountant::spawn(QuotaStore::Mock(mock.clone()), 16, rx);

        accountant.submit(UsageEvent::now("u1", 30));
        accountant.submit(UsageEvent::now("u1", 12));
        wait_for(&accountant, |s| s.written == 2).await;

        assert_eq!(mock.token_usage("u1"), 42);
        assert_eq!(
            accountant.stats(),
            UsageStats {
                submitted: 2,
                written: 2,
                failed: 0,
                dropped: 0
            }
        );
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_propagated() {
        let mock = Arc::new(MockQuotaStore::default());
        mock.fail_writes(true);
        let (_tx, rx) = watch::channel(false);
        let (accountant, _handle) =
            UsageAccountant::spawn(QuotaStore::Mock(mock.clone()), 16, rx);

        accountant.submit(UsageEvent::now("u1", 5));
        wait_for(&accountant, |s| s.failed == 1).await;
        assert_eq!(accountant.stats().written, 0);
        assert_eq!(mock.token_usage("u1"), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_full_queue_drops_oldest() {
        let mock = Arc::new(MockQuotaStore::default());
        let (tx, rx) = watch::channel(false);
        let (accountant, handle) =
            UsageAccountant::spawn(QuotaStore::Mock(mock.clone()), 2, rx);

        // The worker cannot run until this task yields, so all three land in the queue first.
        accountant.submit(UsageEvent::now("u1", 1));
        accountant.submit(UsageEvent::now("u1", 10));
        accountant.submit(UsageEvent::now("u1", 100));
        assert_eq!(accountant.stats().dropped, 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(mock.token_usage("u1"), 110);
        assert_eq!(accountant.stats().written, 2);
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let mock = Arc::new(MockQuotaStore::default());
        let (tx, rx) = watch::channel(false);
        let (accountant, handle) =
            UsageAccountant::spawn(QuotaStore::Mock(mock.clone()), 64, rx);
        for _ in 0..20 {
            accountant.submit(UsageEvent::now("u2", 1));
        }
        drop(tx);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mock.token_usage("u2"), 20);
    }
}
