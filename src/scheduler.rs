//! Background execution boundary.
//!
//! The engine does not run jobs itself; it hands reconciliation triggers to a
//! [`Scheduler`], which the deployment maps onto whatever substrate it has (a
//! job queue, a worker pool, a cron loop). Delivery only needs to be
//! at-least-once and best-effort-timely: reconciliation is idempotent, and
//! the straggler sweep re-triggers anything a lost enqueue missed.
//!
//! [`QueueScheduler`] is the in-process implementation: it collects pending
//! keys (deduplicated) for a worker to drain. Fire-and-forget in spirit; the
//! drain loop is the "worker".

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::model::CounterKey;

/// Accepts reconciliation triggers for later execution.
pub trait Scheduler: Send + Sync {
    /// Requests that `reconcile` eventually run for the counter.
    ///
    /// Must not block on the counter's row lock and must tolerate duplicate
    /// enqueues of the same key.
    fn enqueue(&self, key: CounterKey);
}

/// In-process queue of pending reconciliations.
///
/// # Examples
///
/// ```rust
/// use conteggio::scheduler::{QueueScheduler, Scheduler};
/// use conteggio::model::CounterKey;
///
/// let scheduler = QueueScheduler::new();
/// scheduler.enqueue(CounterKey::global("signups"));
/// scheduler.enqueue(CounterKey::global("signups")); // deduplicated
/// assert_eq!(scheduler.drain().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct QueueScheduler {
    pending: Mutex<VecDeque<CounterKey>>,
}

impl QueueScheduler {
    /// Creates an empty queue.
    pub fn new() -> Self {
        QueueScheduler::default()
    }

    /// Takes every pending key, leaving the queue empty.
    pub fn drain(&self) -> Vec<CounterKey> {
        self.pending.lock().drain(..).collect()
    }

    /// Number of keys currently queued.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl Scheduler for QueueScheduler {
    fn enqueue(&self, key: CounterKey) {
        let mut pending = self.pending.lock();
        if !pending.contains(&key) {
            pending.push_back(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enqueue_and_drain() {
        let scheduler = QueueScheduler::new();
        assert!(scheduler.is_empty());
        scheduler.enqueue(CounterKey::global("a"));
        scheduler.enqueue(CounterKey::global("b"));
        assert_eq!(scheduler.len(), 2);
        let drained = scheduler.drain();
        assert_eq!(drained.len(), 2);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_duplicate_keys_are_coalesced() {
        let scheduler = QueueScheduler::new();
        scheduler.enqueue(CounterKey::global("a"));
        scheduler.enqueue(CounterKey::global("a"));
        assert_eq!(scheduler.len(), 1);
    }
}
