//! Stoppable periodic background tasks.
//!
//! The lock-expiry sweep and the transaction watchdog both run on a fixed
//! interval for the life of the process. [`BackgroundTask`] owns the spawned
//! Tokio task and a shutdown channel so the composition root can stop them
//! during shutdown instead of leaking free-running timers.

use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Smallest interval accepted by [`BackgroundTask::spawn_periodic`].
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to a periodic task running on the Tokio runtime.
///
/// Dropping the handle also stops the task (the shutdown channel closes),
/// but [`stop`](Self::stop) additionally waits for the current tick to
/// finish.
#[derive(Debug)]
pub struct BackgroundTask {
    name: &'static str,
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawn `tick` every `interval` until stopped.
    ///
    /// The first run happens one full interval after spawning. Must be
    /// called from within a Tokio runtime.
    pub fn spawn_periodic<F, Fut>(name: &'static str, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let period = interval.max(MIN_INTERVAL);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick of a Tokio interval completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => tick().await,
                }
            }

            tracing::debug!(task = name, "Background task stopped");
        });

        tracing::debug!(task = name, interval_ms = period.as_millis(), "Background task spawned");

        Self {
            name,
            stop_tx,
            handle,
        }
    }

    /// Name given at spawn time, used in log fields.
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the task has already exited.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal the task to stop and wait for it to exit.
    pub async fn stop(self) {
        // The receiver is gone only if the task already exited.
        let _ = self.stop_tx.send(());
        if let Err(e) = self.handle.await {
            tracing::warn!(task = self.name, error = %e, "Background task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn runs_every_interval_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let task = BackgroundTask::spawn_periodic("test", Duration::from_secs(30), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        task.stop().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_handle_stops_task() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let task = BackgroundTask::spawn_periodic("dropped", Duration::from_secs(1), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        drop(task);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
