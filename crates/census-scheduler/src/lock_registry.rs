//! In-process advisory locks keyed by resource name.
//!
//! At most one owner holds a resource at a time. The holder may acquire the
//! same resource again without waiting; holds are counted and the lock is
//! freed when every hold is released. A lock older than the configured
//! timeout is reclaimed, either by a contending acquirer or by the periodic
//! sweep, so a task that never reaches its release step cannot block a
//! resource forever.
//!
//! Waiters sleep until a release, the current holder's expiry, or their own
//! deadline, whichever comes first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use census_types::{BackgroundTask, LockId};

use crate::error::LockError;

/// Default age after which a held lock may be reclaimed.
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Default ceiling on how long `acquire` waits.
const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(60);

/// Default interval between expiry sweeps.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Lock registry settings.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Age after which a lock is eligible for forced reclamation.
    pub lock_timeout: Duration,
    /// Maximum time `acquire` waits before failing.
    pub max_wait: Duration,
    /// Interval of the background expiry sweep.
    pub sweep_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            max_wait: DEFAULT_MAX_WAIT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl LockConfig {
    /// Set the lock expiry timeout.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the acquisition wait ceiling.
    #[must_use]
    pub const fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Set the sweep interval.
    #[must_use]
    pub const fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Read-only view of one held lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockSnapshot {
    /// Lock identifier.
    pub lock_id: LockId,
    /// Locked resource name.
    pub resource: String,
    /// Owner that holds it.
    pub owner: String,
    /// Outstanding reentrant holds.
    pub holds: u32,
    /// Wall-clock acquisition time.
    pub acquired_at: DateTime<Utc>,
    /// Milliseconds since acquisition.
    pub age_ms: u64,
}

#[derive(Debug)]
struct HeldLock {
    lock_id: LockId,
    owner: String,
    holds: u32,
    acquired_at: Instant,
    acquired_wall: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RegistryState {
    by_resource: HashMap<String, HeldLock>,
    by_id: HashMap<LockId, String>,
}

impl RegistryState {
    fn remove(&mut self, resource: &str) -> Option<HeldLock> {
        let held = self.by_resource.remove(resource)?;
        self.by_id.remove(&held.lock_id);
        Some(held)
    }
}

enum Attempt {
    Acquired(LockId),
    /// Held by another owner; `None` means the hold never expires.
    Busy(Option<Instant>),
}

fn expiry(acquired_at: Instant, timeout: Duration) -> Option<Instant> {
    acquired_at.checked_add(timeout)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Registry of named advisory locks.
#[derive(Debug)]
pub struct LockRegistry {
    config: LockConfig,
    state: Mutex<RegistryState>,
    released: Notify,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::new(LockConfig::default())
    }
}

impl LockRegistry {
    /// Create an empty registry.
    pub fn new(config: LockConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RegistryState::default()),
            released: Notify::new(),
        }
    }

    /// The registry settings.
    pub const fn config(&self) -> &LockConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire `resource` for `owner`, waiting up to the configured ceiling.
    ///
    /// If `owner` already holds the resource the existing lock ID is
    /// returned at once and its hold count incremented.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] if another owner still holds the
    /// resource when the wait ceiling elapses.
    pub async fn acquire(&self, resource: &str, owner: &str) -> Result<LockId, LockError> {
        let started = Instant::now();
        let deadline = started.checked_add(self.config.max_wait);

        loop {
            // Register interest before looking so a release between the
            // check and the wait is not missed.
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let busy_until = match self.try_acquire(resource, owner) {
                Attempt::Acquired(lock_id) => return Ok(lock_id),
                Attempt::Busy(until) => until,
            };

            if deadline.is_some_and(|d| Instant::now() >= d) {
                let waited = started.elapsed();
                tracing::warn!(resource, owner, waited_ms = millis(waited), "Lock acquisition timed out");
                return Err(LockError::Timeout {
                    resource: resource.to_owned(),
                    waited,
                });
            }

            let wake_at = match (busy_until, deadline) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            match wake_at {
                Some(at) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Try once without waiting. Returns `None` if another owner holds the
    /// resource and the hold has not expired.
    pub fn try_acquire_now(&self, resource: &str, owner: &str) -> Option<LockId> {
        match self.try_acquire(resource, owner) {
            Attempt::Acquired(lock_id) => Some(lock_id),
            Attempt::Busy(_) => None,
        }
    }

    fn try_acquire(&self, resource: &str, owner: &str) -> Attempt {
        let now = Instant::now();
        let mut state = self.state();

        let existing = state
            .by_resource
            .get(resource)
            .map(|held| (held.owner == owner, held.lock_id, held.acquired_at));

        match existing {
            Some((true, lock_id, _)) => {
                if let Some(held) = state.by_resource.get_mut(resource) {
                    held.holds = held.holds.saturating_add(1);
                    tracing::debug!(resource, owner, lock_id = %lock_id, holds = held.holds, "Reentrant lock reused");
                }
                return Attempt::Acquired(lock_id);
            }
            Some((false, lock_id, acquired_at)) => {
                let expires_at = expiry(acquired_at, self.config.lock_timeout);
                if expires_at.is_none_or(|at| now < at) {
                    return Attempt::Busy(expires_at);
                }
                if let Some(stale) = state.remove(resource) {
                    tracing::warn!(
                        resource,
                        lock_id = %lock_id,
                        previous_owner = %stale.owner,
                        age_ms = millis(now.saturating_duration_since(stale.acquired_at)),
                        "Reclaiming expired lock"
                    );
                }
            }
            None => {}
        }

        let lock_id = LockId::new();
        state.by_resource.insert(
            resource.to_owned(),
            HeldLock {
                lock_id,
                owner: owner.to_owned(),
                holds: 1,
                acquired_at: now,
                acquired_wall: Utc::now(),
            },
        );
        state.by_id.insert(lock_id, resource.to_owned());
        tracing::debug!(resource, owner, lock_id = %lock_id, "Lock acquired");
        Attempt::Acquired(lock_id)
    }

    /// Release one hold on `lock_id`.
    ///
    /// Returns `false` (and logs a warning) if the lock is not held, which
    /// happens after a double release or after the lock expired and was
    /// reclaimed.
    pub fn release(&self, lock_id: LockId) -> bool {
        let mut state = self.state();
        let Some(resource) = state.by_id.get(&lock_id).cloned() else {
            drop(state);
            tracing::warn!(lock_id = %lock_id, "Release of unknown lock ignored");
            return false;
        };

        let remaining = match state.by_resource.get_mut(&resource) {
            Some(held) => {
                held.holds = held.holds.saturating_sub(1);
                held.holds
            }
            None => 0,
        };

        if remaining > 0 {
            tracing::debug!(resource = %resource, lock_id = %lock_id, holds = remaining, "Reentrant hold released");
            return true;
        }

        state.remove(&resource);
        drop(state);
        self.released.notify_waiters();
        tracing::debug!(resource = %resource, lock_id = %lock_id, "Lock released");
        true
    }

    /// Remove every lock older than the lock timeout, whatever its owner.
    /// Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let timeout = self.config.lock_timeout;
        let mut state = self.state();

        let expired: Vec<String> = state
            .by_resource
            .iter()
            .filter(|(_, held)| expiry(held.acquired_at, timeout).is_some_and(|at| now >= at))
            .map(|(resource, _)| resource.clone())
            .collect();

        for resource in &expired {
            if let Some(stale) = state.remove(resource) {
                tracing::warn!(
                    resource = %resource,
                    lock_id = %stale.lock_id,
                    owner = %stale.owner,
                    "Expired lock swept"
                );
            }
        }
        drop(state);

        if !expired.is_empty() {
            self.released.notify_waiters();
        }
        expired.len()
    }

    /// Snapshot of every held lock, ordered by resource name.
    pub fn snapshot(&self) -> Vec<LockSnapshot> {
        let now = Instant::now();
        let mut locks: Vec<LockSnapshot> = self
            .state()
            .by_resource
            .iter()
            .map(|(resource, held)| LockSnapshot {
                lock_id: held.lock_id,
                resource: resource.clone(),
                owner: held.owner.clone(),
                holds: held.holds,
                acquired_at: held.acquired_wall,
                age_ms: millis(now.saturating_duration_since(held.acquired_at)),
            })
            .collect();
        locks.sort_by(|a, b| a.resource.cmp(&b.resource));
        locks
    }

    /// Number of held locks.
    pub fn len(&self) -> usize {
        self.state().by_resource.len()
    }

    /// Whether no lock is held.
    pub fn is_empty(&self) -> bool {
        self.state().by_resource.is_empty()
    }

    /// Whether `resource` is currently held.
    pub fn is_locked(&self, resource: &str) -> bool {
        self.state().by_resource.contains_key(resource)
    }

    /// Run [`sweep_expired`](Self::sweep_expired) on the configured interval
    /// until the returned task is stopped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> BackgroundTask {
        let registry = Arc::clone(self);
        BackgroundTask::spawn_periodic("lock-sweeper", self.config.sweep_interval, move || {
            let registry = Arc::clone(&registry);
            async move {
                let swept = registry.sweep_expired();
                if swept > 0 {
                    tracing::info!(swept, "Lock sweep removed expired locks");
                }
            }
        })
    }
}
