//! The asynchronous change-log path.
//!
//! When synchronous per-event locking is too contentious (one very hot
//! parent), deltas are appended to a durable change log instead of applied in
//! place. [`Counters::record_change`] never takes the counter's row lock;
//! [`Counters::reconcile`] later folds every unprocessed change into the row
//! as a single delta, under the lock, in one atomic unit.
//!
//! Reconciliation is idempotent: changes already marked processed are never
//! re-summed, so a duplicate trigger finds nothing to do. Triggers are
//! delivered through the [`Scheduler`](crate::scheduler::Scheduler) after
//! every append, and [`Counters::reconcile_stragglers`] sweeps up anything a
//! lost trigger left behind. Processed rows are retained for
//! [`RETENTION_DAYS`] and then become purge-eligible.

use chrono::{DateTime, Duration, Utc};

use crate::engine::Counters;
use crate::error::Result;
use crate::filters::{EventItem, Phase};
use crate::model::{Countable, CounterChange, CounterKey};

/// How long processed change rows are kept before they can be purged.
pub const RETENTION_DAYS: i64 = 7;

impl Counters {
    /// Appends a pending delta for the counter and triggers reconciliation.
    ///
    /// Does not touch the counter row and never blocks on its lock; this is
    /// the whole reason the asynchronous path exists for hot counters.
    pub fn record_change(&self, key: &CounterKey, amount: f64) -> Result<CounterChange> {
        let row = self.find_or_create(key)?;
        let change = self.changes.append(row.id, amount, Utc::now())?;
        self.scheduler.enqueue(key.clone());
        Ok(change)
    }

    /// Folds every unprocessed change for the counter into its value.
    ///
    /// Runs entirely under the row's exclusive lock: select unprocessed, sum,
    /// apply, mark processed. Safe to invoke concurrently for the same key;
    /// the invocation that loses the lock race finds nothing unprocessed and
    /// no-ops. Returns the applied delta.
    pub fn reconcile(&self, key: &CounterKey) -> Result<f64> {
        let definition = self.registry.resolve_key(key)?;
        let row = self.find_or_create(key)?;

        let mut applied = 0.0;
        {
            let changes = &self.changes;
            let applied = &mut applied;
            self.write_value(&definition, row.id, move |current| {
                let pending = changes.unprocessed_for(row.id)?;
                let delta: f64 = pending.iter().map(|c| c.amount).sum();
                let ids: Vec<i64> = pending.iter().map(|c| c.id).collect();
                changes.mark_processed(&ids, Utc::now())?;
                *applied = delta;
                Ok(current + delta)
            })?;
        }
        if applied != 0.0 {
            log::debug!("reconciled `{key}`: applied {applied}");
        }
        Ok(applied)
    }

    /// Re-triggers reconciliation for every counter that still has
    /// unprocessed changes created at or before `older_than` ago.
    ///
    /// This is the periodic self-healing sweep behind lost scheduler
    /// triggers. Returns the number of counters reconciled.
    pub fn reconcile_stragglers(&self, older_than: Duration) -> Result<usize> {
        let threshold = Utc::now() - older_than;
        let counter_ids = self.changes.counters_with_unprocessed(threshold)?;
        let mut reconciled = 0;
        for counter_id in counter_ids {
            let Some(row) = self.store.find_by_id(counter_id)? else {
                log::warn!("changes reference missing counter row {counter_id}");
                continue;
            };
            self.reconcile(&row.key)?;
            reconciled += 1;
        }
        Ok(reconciled)
    }

    /// Purges processed change rows older than the retention window.
    ///
    /// Storage hygiene only; skipping a purge never affects correctness.
    pub fn purge_processed(&self, now: DateTime<Utc>) -> Result<usize> {
        self.changes
            .purge_processed(now - Duration::days(RETENTION_DAYS))
    }

    /// Asynchronous mirror of [`Counters::add_item`]: accepted contributions
    /// go through the change log instead of the row lock.
    pub fn add_item_async(&self, item: &dyn Countable) -> Result<()> {
        let event = EventItem::Current(item);
        for movement in self.movements(&event, Phase::Create) {
            self.record_change(&movement.key, movement.amount)?;
        }
        Ok(())
    }

    /// Asynchronous mirror of [`Counters::update_item`].
    pub fn update_item_async(&self, before: &dyn Countable, after: &dyn Countable) -> Result<()> {
        let event = EventItem::Changed { before, after };
        for movement in self.movements(&event, Phase::Update) {
            self.record_change(&movement.key, movement.amount)?;
        }
        Ok(())
    }

    /// Asynchronous mirror of [`Counters::remove_item`].
    pub fn remove_item_async(&self, item: &dyn Countable) -> Result<()> {
        let event = EventItem::Current(item);
        for movement in self.movements(&event, Phase::Delete) {
            self.record_change(&movement.key, movement.amount)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{CounterDefinition, Relation};
    use crate::model::{ParentRef, Record};
    use crate::registry::Registry;
    use crate::scheduler::QueueScheduler;
    use crate::store::memory::{MemoryChangeStore, MemoryStore};
    use std::sync::Arc;

    struct Fixture {
        counters: Counters,
        store: Arc<MemoryStore>,
        changes: Arc<MemoryChangeStore>,
        scheduler: Arc<QueueScheduler>,
    }

    fn fixture() -> Fixture {
        let registry = Registry::builder()
            .counter(CounterDefinition::new("visits").with_parent("user"))
            .counter(
                CounterDefinition::new("products")
                    .with_parent("user")
                    .counting(Relation::new("products", "product").with_inverse("user")),
            )
            .build()
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        let changes = Arc::new(MemoryChangeStore::new());
        let scheduler = Arc::new(QueueScheduler::new());
        let counters = Counters::new(
            Arc::new(registry),
            store.clone(),
            changes.clone(),
            scheduler.clone(),
        );
        Fixture {
            counters,
            store,
            changes,
            scheduler,
        }
    }

    fn key() -> CounterKey {
        CounterKey::parented(ParentRef::new("user", 1), "visits")
    }

    #[test]
    fn test_record_change_does_not_touch_value() {
        let f = fixture();
        f.counters.record_change(&key(), 5.0).unwrap();
        assert_eq!(f.counters.value(&key()).unwrap(), 0.0);
        assert_eq!(f.scheduler.len(), 1);
    }

    #[test]
    fn test_reconcile_folds_all_pending_changes() {
        let f = fixture();
        f.counters.record_change(&key(), 1.0).unwrap();
        f.counters.record_change(&key(), 1.0).unwrap();
        f.counters.record_change(&key(), -3.0).unwrap();

        let applied = f.counters.reconcile(&key()).unwrap();
        assert_eq!(applied, -1.0);
        assert_eq!(f.counters.value(&key()).unwrap(), -1.0);

        // Every change row ends marked processed exactly once.
        let row = f.counters.find_or_create(&key()).unwrap();
        let all = f.changes.all_for(row.id);
        assert_eq!(all.len(), 3);
        assert!(all.iter().all(|c| c.is_processed()));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let f = fixture();
        f.counters.record_change(&key(), 2.0).unwrap();
        assert_eq!(f.counters.reconcile(&key()).unwrap(), 2.0);
        assert_eq!(f.counters.reconcile(&key()).unwrap(), 0.0);
        assert_eq!(f.counters.value(&key()).unwrap(), 2.0);
    }

    #[test]
    fn test_two_concurrent_changes_single_reconcile() {
        use std::thread;

        let f = fixture();
        let counters = Arc::new(f.counters);
        let mut handles = vec![];
        for _ in 0..2 {
            let counters = Arc::clone(&counters);
            handles.push(thread::spawn(move || {
                counters.record_change(&key(), 1.0).unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counters.reconcile(&key()).unwrap(), 2.0);
        assert_eq!(counters.value(&key()).unwrap(), 2.0);
    }

    #[test]
    fn test_record_change_does_not_block_on_row_lock() {
        use crate::store::CounterStore;
        use std::thread;
        use std::time::{Duration as StdDuration, Instant};

        let f = fixture();
        let row = f.counters.find_or_create(&key()).unwrap();

        let holder = {
            let store = Arc::clone(&f.store);
            thread::spawn(move || {
                store
                    .with_lock(row.id, &mut |r| {
                        thread::sleep(StdDuration::from_millis(300));
                        r.value += 1.0;
                        Ok(())
                    })
                    .unwrap();
            })
        };
        thread::sleep(StdDuration::from_millis(50));

        // The append lands while the row lock is still held elsewhere.
        let start = Instant::now();
        f.counters.record_change(&key(), 1.0).unwrap();
        assert!(start.elapsed() < StdDuration::from_millis(150));
        holder.join().unwrap();

        assert_eq!(f.counters.reconcile(&key()).unwrap(), 1.0);
        assert_eq!(f.counters.value(&key()).unwrap(), 2.0);
    }

    #[test]
    fn test_scheduler_drain_drives_reconciliation() {
        let f = fixture();
        f.counters.record_change(&key(), 1.0).unwrap();
        f.counters.record_change(&key(), 1.0).unwrap();

        for pending in f.scheduler.drain() {
            f.counters.reconcile(&pending).unwrap();
        }
        assert_eq!(f.counters.value(&key()).unwrap(), 2.0);
    }

    #[test]
    fn test_straggler_sweep_catches_lost_triggers() {
        let f = fixture();
        f.counters.record_change(&key(), 4.0).unwrap();
        // The trigger is "lost": nobody drains the queue.
        f.scheduler.drain();

        let reconciled = f.counters.reconcile_stragglers(Duration::zero()).unwrap();
        assert_eq!(reconciled, 1);
        assert_eq!(f.counters.value(&key()).unwrap(), 4.0);

        // Nothing left for a second sweep.
        assert_eq!(
            f.counters.reconcile_stragglers(Duration::zero()).unwrap(),
            0
        );
    }

    #[test]
    fn test_purge_after_retention() {
        let f = fixture();
        f.counters.record_change(&key(), 1.0).unwrap();
        f.counters.reconcile(&key()).unwrap();

        // Inside the window: kept.
        assert_eq!(f.counters.purge_processed(Utc::now()).unwrap(), 0);
        // Past the window: gone.
        let future = Utc::now() + Duration::days(RETENTION_DAYS + 1);
        assert_eq!(f.counters.purge_processed(future).unwrap(), 1);
    }

    #[test]
    fn test_async_lifecycle_mirrors() {
        let f = fixture();
        let parent = ParentRef::new("user", 1);
        let product = Record::new("product", 1)
            .with_parent(parent)
            .with_field("price", 100);
        let products_key = CounterKey::parented(parent, "products");

        f.counters.add_item_async(&product).unwrap();
        assert_eq!(f.counters.value(&products_key).unwrap(), 0.0);
        f.counters.reconcile(&products_key).unwrap();
        assert_eq!(f.counters.value(&products_key).unwrap(), 1.0);

        f.counters.remove_item_async(&product).unwrap();
        f.counters.reconcile(&products_key).unwrap();
        assert_eq!(f.counters.value(&products_key).unwrap(), 0.0);
    }
}
