//! In-memory reference implementation of the persistence boundary.
//!
//! [`MemoryStore`] keeps one read-modify-write mutex per aggregate row, so
//! concurrent locked sequences against the same counter serialize exactly
//! like row-level locks in a relational store, while different counters never
//! block each other. The committed value itself lives in an atomic next to
//! the lock: point reads and change-log appends load it directly and never
//! touch the mutex, the same way a relational `SELECT` reads the last
//! committed row without waiting on a writer. It also holds a flat table of
//! [`Record`]s standing in for the countable relations, which is what the
//! COUNT/SUM aggregate queries run against.
//!
//! [`MemoryChangeStore`] is the matching append-only change log.
//!
//! Both are the test substrate for the engine and a usable store for
//! single-process deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::definition::Relation;
use crate::error::{CounterError, Result};
use crate::filters::ItemPredicate;
use crate::model::{Countable, CounterChange, CounterKey, CounterValue, ParentRef, Record};
use crate::store::{ChangeStore, CounterStore};

struct Row {
    id: i64,
    key: CounterKey,
    /// Last committed value as `f64` bits; readable without the lock.
    value: AtomicU64,
    /// Serializes read-modify-write sequences on this row.
    lock: Mutex<()>,
}

impl Row {
    fn snapshot(&self) -> CounterValue {
        CounterValue {
            id: self.id,
            key: self.key.clone(),
            value: f64::from_bits(self.value.load(Ordering::Acquire)),
        }
    }
}

#[derive(Default)]
struct Rows {
    by_key: HashMap<CounterKey, Arc<Row>>,
    by_id: HashMap<i64, Arc<Row>>,
    next_id: i64,
}

/// In-memory counter row store with per-row locking.
#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<Rows>,
    items: RwLock<HashMap<(String, i64), Record>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Inserts or replaces a countable entity row.
    ///
    /// This is the relational-table side of the store: aggregate queries
    /// count and sum over these rows.
    pub fn put_item(&self, item: Record) {
        let mut items = self.items.write();
        items.insert((item.kind().to_string(), item.id()), item);
    }

    /// Removes a countable entity row.
    pub fn remove_item(&self, kind: &str, id: i64) {
        let mut items = self.items.write();
        items.remove(&(kind.to_string(), id));
    }

    fn row(&self, key: &CounterKey) -> Option<Arc<Row>> {
        self.rows.read().by_key.get(key).cloned()
    }

    fn row_by_id(&self, id: i64) -> Option<Arc<Row>> {
        self.rows.read().by_id.get(&id).cloned()
    }
}

impl CounterStore for MemoryStore {
    fn find(&self, key: &CounterKey) -> Result<Option<CounterValue>> {
        Ok(self.row(key).map(|row| row.snapshot()))
    }

    fn find_by_id(&self, id: i64) -> Result<Option<CounterValue>> {
        Ok(self.row_by_id(id).map(|row| row.snapshot()))
    }

    fn insert(&self, key: &CounterKey) -> Result<CounterValue> {
        let mut rows = self.rows.write();
        if rows.by_key.contains_key(key) {
            return Err(CounterError::Conflict(key.clone()));
        }
        rows.next_id += 1;
        let row = Arc::new(Row {
            id: rows.next_id,
            key: key.clone(),
            value: AtomicU64::new(0.0f64.to_bits()),
            lock: Mutex::new(()),
        });
        rows.by_key.insert(key.clone(), row.clone());
        rows.by_id.insert(row.id, row.clone());
        Ok(row.snapshot())
    }

    fn with_lock(
        &self,
        id: i64,
        body: &mut dyn FnMut(&mut CounterValue) -> Result<()>,
    ) -> Result<CounterValue> {
        let row = self
            .row_by_id(id)
            .ok_or_else(|| CounterError::Store(format!("no counter row with id {id}")))?;
        let _guard = row.lock.lock();
        // Work on a snapshot so a failing body leaves the committed value
        // intact.
        let mut working = row.snapshot();
        body(&mut working)?;
        row.value.store(working.value.to_bits(), Ordering::Release);
        Ok(working)
    }

    fn aggregate(
        &self,
        parent: &ParentRef,
        relation: &Relation,
        sum_field: Option<&str>,
        scope: Option<&ItemPredicate>,
    ) -> Result<f64> {
        let items = self.items.read();
        let matching = items.values().filter(|item| {
            let item: &Record = item;
            item.kind() == relation.countable_kind
                && item.parent() == Some(*parent)
                && scope.is_none_or(|accept| accept(item))
        });
        let total = match sum_field {
            Some(field) => matching
                .map(|item| item.get(field).as_number().unwrap_or(0.0))
                .sum(),
            None => matching.count() as f64,
        };
        Ok(total)
    }

    fn delete_for_parent(&self, parent: &ParentRef) -> Result<usize> {
        let mut rows = self.rows.write();
        let before = rows.by_key.len();
        rows.by_key.retain(|key, _| key.parent != Some(*parent));
        rows.by_id.retain(|_, row| row.key.parent != Some(*parent));
        Ok(before - rows.by_key.len())
    }

    fn id_bounds(&self) -> Result<Option<(i64, i64)>> {
        let rows = self.rows.read();
        let mut bounds: Option<(i64, i64)> = None;
        for &id in rows.by_id.keys() {
            bounds = Some(match bounds {
                Some((lo, hi)) => (lo.min(id), hi.max(id)),
                None => (id, id),
            });
        }
        Ok(bounds)
    }

    fn first_at_or_after(&self, id: i64) -> Result<Option<CounterValue>> {
        let rows = self.rows.read();
        let best = rows
            .by_id
            .iter()
            .filter(|(&row_id, _)| row_id >= id)
            .min_by_key(|(&row_id, _)| row_id)
            .map(|(_, row)| row.snapshot());
        Ok(best)
    }
}

/// In-memory append-only change log.
#[derive(Default)]
pub struct MemoryChangeStore {
    changes: Mutex<Vec<CounterChange>>,
    next_id: Mutex<i64>,
}

impl MemoryChangeStore {
    /// Creates an empty change log.
    pub fn new() -> Self {
        MemoryChangeStore::default()
    }

    /// Every change row for the counter, processed or not. Test inspection.
    pub fn all_for(&self, counter_id: i64) -> Vec<CounterChange> {
        self.changes
            .lock()
            .iter()
            .filter(|c| c.counter_id == counter_id)
            .cloned()
            .collect()
    }
}

impl ChangeStore for MemoryChangeStore {
    fn append(&self, counter_id: i64, amount: f64, now: DateTime<Utc>) -> Result<CounterChange> {
        let mut next_id = self.next_id.lock();
        *next_id += 1;
        let change = CounterChange {
            id: *next_id,
            counter_id,
            amount,
            created_at: now,
            processed_at: None,
        };
        self.changes.lock().push(change.clone());
        Ok(change)
    }

    fn unprocessed_for(&self, counter_id: i64) -> Result<Vec<CounterChange>> {
        Ok(self
            .changes
            .lock()
            .iter()
            .filter(|c| c.counter_id == counter_id && !c.is_processed())
            .cloned()
            .collect())
    }

    fn mark_processed(&self, change_ids: &[i64], now: DateTime<Utc>) -> Result<()> {
        let mut changes = self.changes.lock();
        for change in changes.iter_mut() {
            if change_ids.contains(&change.id) && change.processed_at.is_none() {
                change.processed_at = Some(now);
            }
        }
        Ok(())
    }

    fn counters_with_unprocessed(&self, older_than: DateTime<Utc>) -> Result<Vec<i64>> {
        let changes = self.changes.lock();
        let mut ids: Vec<i64> = changes
            .iter()
            .filter(|c| !c.is_processed() && c.created_at <= older_than)
            .map(|c| c.counter_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    fn purge_processed(&self, before: DateTime<Utc>) -> Result<usize> {
        let mut changes = self.changes.lock();
        let len = changes.len();
        changes.retain(|c| match c.processed_at {
            Some(at) => at >= before,
            None => true,
        });
        Ok(len - changes.len())
    }
}
