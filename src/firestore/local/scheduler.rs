use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use futures::future::{abortable, AbortHandle};

use crate::firestore::error::{failed_precondition, FirestoreResult};
use crate::platform::runtime::{sleep, spawn_detached};

/// Identifies the kind of background work a delayed operation performs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    ClientMetadataRefresh,
    LruGarbageCollection,
    IndexBackfill,
}

/// Runs operations after a delay on the background runtime.
///
/// Only the waiting period can be cancelled: once an operation has started it runs to
/// completion, so transactions are never interrupted halfway.
#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

#[derive(Default)]
struct SchedulerInner {
    shut_down: AtomicBool,
    next_id: AtomicU64,
    pending: StdMutex<BTreeMap<u64, (TimerId, AbortHandle)>>,
}

impl SchedulerInner {
    fn forget(&self, id: u64) -> Option<(TimerId, AbortHandle)> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `operation` to run once `delay` has elapsed.
    ///
    /// Fails once the scheduler has been shut down.
    pub fn enqueue_after_delay<F, Fut>(
        &self,
        timer_id: TimerId,
        delay: Duration,
        operation: F,
    ) -> FirestoreResult<DelayedOperation>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            return Err(failed_precondition(format!(
                "Scheduler is shut down, rejecting {timer_id:?}"
            )));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (wait, handle) = abortable(sleep(delay));
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, (timer_id, handle.clone()));

        let inner = Arc::clone(&self.inner);
        spawn_detached(async move {
            let elapsed = wait.await.is_ok();
            inner.forget(id);
            if elapsed && !inner.shut_down.load(Ordering::SeqCst) {
                operation().await;
            }
        });

        Ok(DelayedOperation {
            id,
            timer_id,
            handle,
            scheduler: Arc::downgrade(&self.inner),
        })
    }

    /// Cancels every pending operation and rejects new ones.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        let pending = std::mem::take(
            &mut *self
                .inner
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for (_, (_, handle)) in pending {
            handle.abort();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Whether an operation with `timer_id` is still waiting for its delay.
    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|(pending, _)| *pending == timer_id)
    }
}

impl Debug for Scheduler {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

/// Handle to an operation enqueued on a [`Scheduler`].
#[derive(Debug)]
pub struct DelayedOperation {
    id: u64,
    timer_id: TimerId,
    handle: AbortHandle,
    scheduler: std::sync::Weak<SchedulerInner>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Prevents the operation from starting. Has no effect once it is running or done.
    pub fn cancel(&self) {
        self.handle.abort();
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.forget(self.id);
        }
    }
}

impl Debug for SchedulerInner {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerInner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(flavor = "current_thread")]
    async fn runs_after_delay() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        scheduler
            .enqueue_after_delay(TimerId::IndexBackfill, Duration::from_millis(5), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert!(scheduler.contains_delayed_operation(TimerId::IndexBackfill));
        sleep(Duration::from_millis(40)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!scheduler.contains_delayed_operation(TimerId::IndexBackfill));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn cancelled_operations_never_run() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let operation = scheduler
            .enqueue_after_delay(TimerId::LruGarbageCollection, Duration::from_millis(5), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        operation.cancel();
        operation.cancel();
        sleep(Duration::from_millis(40)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn shutdown_cancels_and_rejects() {
        let scheduler = Scheduler::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        scheduler
            .enqueue_after_delay(TimerId::ClientMetadataRefresh, Duration::from_millis(5), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        scheduler.shutdown();
        let err = scheduler
            .enqueue_after_delay(TimerId::ClientMetadataRefresh, Duration::ZERO, || async {})
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/failed-precondition");
        sleep(Duration::from_millis(40)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
