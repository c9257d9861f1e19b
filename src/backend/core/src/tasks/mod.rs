//! Detached background work with counted completion.
//!
//! Handlers hand fire-and-forget work (sending a welcome email, for example)
//! to a [`TaskTracker`]. The tracker keeps an in-flight count so shutdown can
//! wait for that work to finish before the process exits.

pub mod notifier;

pub use notifier::{Notifier, NotifyError, TracingNotifier};

use futures::FutureExt;
use metrics::{counter, gauge};
use std::{
    fmt::Display,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, Instrument};

use crate::middleware::recovery::panic_message;

/// Counts running background tasks.
///
/// Cheap to clone; all clones share the same counter.
#[derive(Debug, Clone, Default)]
pub struct TaskTracker {
    tracker: tokio_util::task::TaskTracker,
    failed: Arc<AtomicU64>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `future` as a tracked background task.
    ///
    /// The task is counted before `run` returns, so a later `wait` always
    /// sees it. Errors and panics are logged and counted, never propagated.
    pub fn run<F, E>(&self, name: &'static str, future: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let span = tracing::info_span!("background_task", task = name);
        let tracker = self.tracker.clone();
        let failed = self.failed.clone();

        let handle = self.tracker.spawn(
            async move {
                match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(Ok(())) => debug!("Background task completed"),
                    Ok(Err(e)) => {
                        failed.fetch_add(1, Ordering::Relaxed);
                        counter!("background_tasks_failed_total", "task" => name).increment(1);
                        error!(error = %e, "Background task failed");
                    }
                    Err(payload) => {
                        failed.fetch_add(1, Ordering::Relaxed);
                        counter!("background_tasks_failed_total", "task" => name).increment(1);
                        error!(panic = %panic_message(payload.as_ref()), "Background task panicked");
                    }
                }
                // This task is still counted until it returns.
                gauge!("background_tasks_in_flight").set(tracker.len().saturating_sub(1) as f64);
            }
            .instrument(span),
        );
        gauge!("background_tasks_in_flight").set(self.tracker.len() as f64);
        handle
    }

    /// Resolve once no tracked task is running.
    ///
    /// Tasks may still be started afterwards, including from tasks being
    /// waited on; they are counted as usual.
    pub async fn wait(&self) {
        // The underlying tracker only reports empty once closed. Closing does
        // not stop new spawns.
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Like [`wait`](Self::wait), giving up after `limit`.
    ///
    /// Returns `true` if all tasks finished in time.
    pub async fn wait_timeout(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.wait()).await.is_ok()
    }

    /// Number of tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Number of tasks that returned an error or panicked.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_immediately_when_idle() {
        let tracker = TaskTracker::new();
        assert_eq!(tracker.in_flight(), 0);
        assert!(tracker.wait_timeout(Duration::from_millis(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_blocks_for_running_task() {
        let tracker = TaskTracker::new();
        tracker.run("sleepy", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, std::convert::Infallible>(())
        });
        assert_eq!(tracker.in_flight(), 1);

        assert!(!tracker.wait_timeout(Duration::from_secs(1)).await);
        assert!(tracker.wait_timeout(Duration::from_secs(10)).await);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failures_are_counted_not_propagated() {
        let tracker = TaskTracker::new();
        let failing = tracker.run("failing", async { Err::<(), _>("smtp unavailable") });
        let panicking = tracker.run("panicking", async {
            if true {
                panic!("template missing");
            }
            Ok::<_, String>(())
        });

        assert!(failing.await.is_ok());
        assert!(panicking.await.is_ok());
        tracker.wait().await;

        assert_eq!(tracker.in_flight(), 0);
        assert_eq!(tracker.failed(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tasks_started_after_wait_are_still_awaited() {
        let tracker = TaskTracker::new();
        tracker.wait().await;

        tracker.run("late", async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok::<_, std::convert::Infallible>(())
        });
        assert_eq!(tracker.in_flight(), 1);

        assert!(!tracker.wait_timeout(Duration::from_secs(1)).await);
        assert!(tracker.wait_timeout(Duration::from_secs(5)).await);
        assert_eq!(tracker.in_flight(), 0);
    }
}
