use std::future::Future;
use std::time::Duration;

/// Spawns an async task that runs in the background.
///
/// Uses the ambient tokio runtime when there is one and a lazily created background runtime
/// otherwise, so callers outside of an async context (for example `Drop` implementations)
/// can still schedule work.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    use std::sync::LazyLock;
    use tokio::runtime::{Builder, Handle, Runtime};

    static BACKGROUND_RUNTIME: LazyLock<Option<Runtime>> = LazyLock::new(|| {
        match Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("firestore-local-background")
            .enable_all()
            .build()
        {
            Ok(runtime) => Some(runtime),
            Err(err) => {
                log::error!("failed to build background tokio runtime: {err}");
                None
            }
        }
    });

    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else if let Some(runtime) = BACKGROUND_RUNTIME.as_ref() {
        runtime.spawn(future);
    }
}

/// Runs blocking work (file system or database calls) from async code.
///
/// On a multi-threaded tokio runtime the current worker hands its queued tasks to other
/// workers first. On a current-thread runtime, or outside tokio, the work runs inline.
pub fn run_blocking<F, R>(work: F) -> R
where
    F: FnOnce() -> R,
{
    use tokio::runtime::{Handle, RuntimeFlavor};

    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(work)
        }
        _ => work(),
    }
}

/// Asynchronously waits for the provided duration.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    tokio::time::sleep(duration).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test(flavor = "current_thread")]
    async fn spawned_task_runs_on_current_runtime() {
        let flag = Arc::new(AtomicBool::new(false));
        let task_flag = Arc::clone(&flag);
        spawn_detached(async move {
            task_flag.store(true, Ordering::SeqCst);
        });
        sleep(Duration::from_millis(5)).await;
        assert!(flag.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn blocking_work_runs_inline_on_current_thread_runtime() {
        assert_eq!(run_blocking(|| 2 + 2), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_work_runs_on_multi_thread_runtime() {
        let flag = Arc::new(AtomicBool::new(false));
        let inner = Arc::clone(&flag);
        run_blocking(move || inner.store(true, Ordering::SeqCst));
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn blocking_work_runs_outside_tokio() {
        assert_eq!(run_blocking(|| "done"), "done");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn zero_sleep_returns_immediately() {
        sleep(Duration::ZERO).await;
    }
}
