//! Concurrency ceiling with priority admission.
//!
//! At most `capacity` [`SlotPermit`]s exist at once. Callers beyond the
//! ceiling wait in a heap ordered by priority (higher first), then by
//! arrival (earlier first). A dropped permit is handed directly to the next
//! waiter, so a slot never sits idle while someone is queued.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

#[derive(Debug)]
struct Waiter {
    priority: i32,
    seq: u64,
    wake: oneshot::Sender<()>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first; within a priority, lower sequence first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct GateState {
    capacity: usize,
    running: usize,
    next_seq: u64,
    waiting: BinaryHeap<Waiter>,
}

/// Priority-ordered counting gate.
#[derive(Debug)]
pub struct PriorityGate {
    state: Mutex<GateState>,
}

impl PriorityGate {
    /// Create a gate admitting `capacity` holders at once (at least one).
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(GateState {
                capacity: capacity.max(1),
                running: 0,
                next_seq: 0,
                waiting: BinaryHeap::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for a slot.
    pub async fn acquire(self: &Arc<Self>, priority: i32) -> SlotPermit {
        loop {
            let receiver = {
                let mut state = self.state();
                if state.running < state.capacity && state.waiting.is_empty() {
                    state.running = state.running.saturating_add(1);
                    return SlotPermit {
                        gate: Arc::clone(self),
                    };
                }
                let (wake, receiver) = oneshot::channel();
                let seq = state.next_seq;
                state.next_seq = seq.wrapping_add(1);
                state.waiting.push(Waiter { priority, seq, wake });
                receiver
            };

            let mut pending = PendingSlot {
                gate: Arc::clone(self),
                receiver: Some(receiver),
            };
            if pending.wait().await {
                return SlotPermit {
                    gate: Arc::clone(self),
                };
            }
        }
    }

    /// Holders currently admitted.
    pub fn running(&self) -> usize {
        self.state().running
    }

    /// Callers waiting for a slot.
    pub fn waiting(&self) -> usize {
        self.state().waiting.len()
    }

    /// Maximum concurrent holders.
    pub fn capacity(&self) -> usize {
        self.state().capacity
    }

    /// Pass a freed slot to the best live waiter, or return it to the pool.
    fn release_slot(&self) {
        let mut state = self.state();
        while let Some(waiter) = state.waiting.pop() {
            if waiter.wake.send(()).is_ok() {
                return;
            }
        }
        state.running = state.running.saturating_sub(1);
    }
}

/// A queued `acquire` that has not been admitted yet.
struct PendingSlot {
    gate: Arc<PriorityGate>,
    receiver: Option<oneshot::Receiver<()>>,
}

impl PendingSlot {
    /// Returns `true` once a slot was handed over.
    async fn wait(&mut self) -> bool {
        let Some(receiver) = self.receiver.as_mut() else {
            return false;
        };
        let handed = receiver.await.is_ok();
        self.receiver = None;
        handed
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        // Cancelled while queued: a slot handed over in the meantime must be
        // passed on, not leaked.
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close();
            if receiver.try_recv().is_ok() {
                self.gate.release_slot();
            }
        }
    }
}

/// One admitted slot; dropping it frees the slot.
#[derive(Debug)]
pub struct SlotPermit {
    gate: Arc<PriorityGate>,
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.gate.release_slot();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn admits_up_to_capacity() {
        let gate = Arc::new(PriorityGate::new(2));
        let a = gate.acquire(0).await;
        let _b = gate.acquire(0).await;
        assert_eq!(gate.running(), 2);

        let gate2 = Arc::clone(&gate);
        let third = tokio::spawn(async move { gate2.acquire(0).await });
        tokio::task::yield_now().await;
        assert_eq!(gate.waiting(), 1);

        drop(a);
        let _c = third.await.unwrap();
        assert_eq!(gate.running(), 2);
        assert_eq!(gate.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn higher_priority_admitted_first() {
        let gate = Arc::new(PriorityGate::new(1));
        let held = gate.acquire(0).await;
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (label, priority) in [("low", 0), ("high", 10), ("low-2", 0), ("mid", 5)] {
            let gate = Arc::clone(&gate);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _permit = gate.acquire(priority).await;
                order.lock().unwrap().push(label);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }));
            tokio::task::yield_now().await;
        }
        assert_eq!(gate.waiting(), 4);

        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low", "low-2"]);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak_slot() {
        let gate = Arc::new(PriorityGate::new(1));
        let held = gate.acquire(0).await;

        let gate2 = Arc::clone(&gate);
        let cancelled = tokio::spawn(async move { gate2.acquire(0).await });
        tokio::task::yield_now().await;
        cancelled.abort();
        let _ = cancelled.await;

        drop(held);
        assert_eq!(gate.running(), 0);
        let _again = gate.acquire(0).await;
        assert_eq!(gate.running(), 1);
    }
}
