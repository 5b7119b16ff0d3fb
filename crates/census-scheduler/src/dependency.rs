//! In-flight task registry used for dependency waits.
//!
//! A task is registered when it is submitted and stays in flight until its
//! [`InFlight`] guard is dropped, which happens when the task finishes,
//! fails, or its future is dropped. Waiting on an ID that is not in flight
//! returns immediately: the dependency either already finished or was never
//! submitted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use census_types::TaskId;

/// A dependency was still in flight when the wait timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyTimeout {
    /// The dependency still in flight.
    pub dependency: TaskId,
    /// How long the caller waited.
    pub waited: Duration,
}

#[derive(Debug, Default)]
struct TrackerState {
    next_generation: u64,
    in_flight: HashMap<TaskId, (u64, watch::Receiver<()>)>,
}

/// Registry of task IDs that are submitted but not finished.
#[derive(Debug, Default)]
pub struct DependencyTracker {
    state: Mutex<TrackerState>,
}

impl DependencyTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `id` as in flight until the returned guard is dropped.
    ///
    /// Registering an ID that is already in flight replaces the earlier
    /// registration; waiters that subscribed to the earlier one are released
    /// when its guard drops.
    pub fn register(self: &Arc<Self>, id: TaskId) -> InFlight {
        let (done, receiver) = watch::channel(());
        let mut state = self.state();
        let generation = state.next_generation;
        state.next_generation = generation.wrapping_add(1);
        if state.in_flight.insert(id, (generation, receiver)).is_some() {
            tracing::warn!(task_id = %id, "Task ID registered twice while in flight");
        }
        drop(state);

        InFlight {
            tracker: Arc::clone(self),
            id,
            generation,
            _done: done,
        }
    }

    /// Whether `id` is currently in flight.
    pub fn is_in_flight(&self, id: TaskId) -> bool {
        self.state().in_flight.contains_key(&id)
    }

    /// Number of tasks in flight.
    pub fn in_flight_count(&self) -> usize {
        self.state().in_flight.len()
    }

    /// Wait until none of `dependencies` is in flight.
    ///
    /// `waiter` is the waiting task's own ID and is skipped if listed.
    /// With a `timeout`, the whole wait is bounded by it.
    ///
    /// # Errors
    ///
    /// Returns [`DependencyTimeout`] naming the first dependency still in
    /// flight when the timeout elapses.
    pub async fn wait_for(
        &self,
        waiter: TaskId,
        dependencies: &[TaskId],
        timeout: Option<Duration>,
    ) -> Result<(), DependencyTimeout> {
        let started = Instant::now();
        let deadline = timeout.and_then(|t| started.checked_add(t));

        for &dependency in dependencies.iter().filter(|&&d| d != waiter) {
            let receiver = self.state().in_flight.get(&dependency).map(|(_, rx)| rx.clone());
            let Some(mut receiver) = receiver else {
                continue;
            };

            tracing::debug!(task_id = %waiter, dependency = %dependency, "Waiting for dependency");
            // Nothing is ever sent; `changed` fails once the guard drops.
            let finished = async move { while receiver.changed().await.is_ok() {} };

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, finished).await.is_err() {
                        return Err(DependencyTimeout {
                            dependency,
                            waited: started.elapsed(),
                        });
                    }
                }
                None => finished.await,
            }
        }
        Ok(())
    }

    fn finish(&self, id: TaskId, generation: u64) {
        let mut state = self.state();
        if state.in_flight.get(&id).is_some_and(|(g, _)| *g == generation) {
            state.in_flight.remove(&id);
        }
    }
}

/// Keeps a task registered as in flight; dropping it marks the task complete.
#[derive(Debug)]
pub struct InFlight {
    tracker: Arc<DependencyTracker>,
    id: TaskId,
    generation: u64,
    _done: watch::Sender<()>,
}

impl InFlight {
    /// The registered task ID.
    pub const fn id(&self) -> TaskId {
        self.id
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.tracker.finish(self.id, self.generation);
    }
}
