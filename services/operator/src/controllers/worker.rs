//! Work queue and reconcile worker pool.
//!
//! Each controller owns a [`WorkQueue`] of object keys. A key is queued at
//! most once, and a key being processed is never handed to a second worker;
//! adds that arrive mid-pass are replayed when the pass finishes. Workers
//! run every pass under a deadline and requeue failures with per-key
//! exponential backoff.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use fleet_reconcile::{Backoff, ReconcileError};
use futures_util::future::join_all;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, instrument, warn};

use super::{ControllerError, ControllerResult};
use crate::model::ObjectKey;

/// What to do with a key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Wait for the next change notification.
    Done,
    /// Reconcile again after the delay, even without a change.
    RequeueAfter(Duration),
}

/// A reconcile function for one kind of object.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Controller name for logs.
    fn name(&self) -> &'static str;

    /// Converge one object. Must be idempotent.
    async fn reconcile(&self, key: &ObjectKey) -> ControllerResult<Action>;
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    /// Added while processing; requeued by `done`.
    dirty: HashSet<ObjectKey>,
    shutting_down: bool,
}

/// Deduplicating queue of object keys.
#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, key: ObjectKey) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        if state.processing.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queued.insert(key.clone()) {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Wait for the next key. Returns `None` once the queue shuts down.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark a key as finished, replaying any add that arrived meanwhile.
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.remove(key) && !state.shutting_down && state.queued.insert(key.clone()) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    pub workers: usize,
    pub pass_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            pass_timeout: Duration::from_secs(10),
        }
    }
}

/// Runs a reconciler over its work queue with a pool of workers.
pub struct Controller<R: Reconciler> {
    reconciler: Arc<R>,
    queue: Arc<WorkQueue>,
    config: ControllerConfig,
    backoff: Arc<Mutex<Backoff>>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: R, queue: Arc<WorkQueue>, config: ControllerConfig) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            queue,
            config,
            backoff: Arc::new(Mutex::new(Backoff::default())),
        }
    }

    /// Run until shutdown is signaled.
    #[instrument(skip(self, shutdown), fields(controller = self.reconciler.name()))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(workers = self.config.workers, "Starting controller");

        let workers: Vec<_> = (0..self.config.workers.max(1))
            .map(|_| {
                let reconciler = Arc::clone(&self.reconciler);
                let queue = Arc::clone(&self.queue);
                let backoff = Arc::clone(&self.backoff);
                let pass_timeout = self.config.pass_timeout;
                tokio::spawn(async move {
                    while let Some(key) = queue.next().await {
                        process(reconciler.as_ref(), &queue, &backoff, pass_timeout, &key).await;
                        queue.done(&key);
                    }
                })
            })
            .collect();

        loop {
            if *shutdown.borrow() {
                break;
            }
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        self.queue.shutdown();
        for result in join_all(workers).await {
            if let Err(e) = result {
                warn!(error = %e, "Reconcile worker panicked");
            }
        }
        info!("Controller shut down");
    }
}

fn lock_backoff(backoff: &Mutex<Backoff>) -> MutexGuard<'_, Backoff> {
    backoff.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run one pass for `key` and schedule whatever follows.
async fn process<R: Reconciler>(
    reconciler: &R,
    queue: &Arc<WorkQueue>,
    backoff: &Mutex<Backoff>,
    pass_timeout: Duration,
    key: &ObjectKey,
) {
    let started = tokio::time::Instant::now();
    let result = match tokio::time::timeout(pass_timeout, reconciler.reconcile(key)).await {
        Ok(result) => result,
        Err(_) => Err(ControllerError::Reconcile(ReconcileError::Timeout {
            resource: key.to_string(),
            elapsed: started.elapsed(),
        })),
    };

    match result {
        Ok(action) => {
            lock_backoff(backoff).clear(&key.to_string());
            if let Action::RequeueAfter(delay) = action {
                debug!(key = %key, delay_ms = delay.as_millis() as u64, "Requeue requested");
                queue.add_after(key.clone(), delay);
            }
        }
        Err(e) => {
            let delay = lock_backoff(backoff).record_failure(&key.to_string());
            warn!(
                controller = reconciler.name(),
                key = %key,
                error = %e,
                retry_in_ms = delay.as_millis() as u64,
                "Reconcile failed"
            );
            queue.add_after(key.clone(), delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::store::StoreError;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("default", name)
    }

    #[tokio::test]
    async fn test_add_deduplicates() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        queue.add(key("a"));
        queue.add(key("b"));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_add_while_processing_is_replayed() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        let k = queue.next().await.unwrap();

        queue.add(key("a"));
        assert!(queue.is_empty());

        queue.done(&k);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next().await.unwrap(), key("a"));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
    }

    struct Flaky {
        calls: Arc<AtomicUsize>,
        fail_first: usize,
    }

    #[async_trait]
    impl Reconciler for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn reconcile(&self, _key: &ObjectKey) -> ControllerResult<Action> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(ControllerError::Store(StoreError::Backend("boom".into())))
            } else {
                Ok(Action::Done)
            }
        }
    }

    #[tokio::test]
    async fn test_failures_are_retried_with_backoff() {
        let calls = Arc::new(AtomicUsize::new(0));
        let queue = Arc::new(WorkQueue::new());
        let controller = Controller::new(
            Flaky {
                calls: Arc::clone(&calls),
                fail_first: 2,
            },
            Arc::clone(&queue),
            ControllerConfig::default(),
        );
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(controller.run(rx));

        queue.add(key("a"));
        tokio::time::timeout(Duration::from_secs(5), async {
            while calls.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    struct Slow;

    #[async_trait]
    impl Reconciler for Slow {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn reconcile(&self, _key: &ObjectKey) -> ControllerResult<Action> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Action::Done)
        }
    }

    #[tokio::test]
    async fn test_pass_deadline() {
        let queue = Arc::new(WorkQueue::new());
        let backoff = Mutex::new(Backoff::default());
        process(&Slow, &queue, &backoff, Duration::from_millis(20), &key("a")).await;
        assert_eq!(lock_backoff(&backoff).failures("default/a"), 1);
    }
}
