//! Persistence boundary.
//!
//! The engine never talks to a database directly; it is written against two
//! narrow traits that any relational (or relational-enough) store can
//! implement:
//!
//! - [`CounterStore`] - aggregate rows: point lookup by key, atomic
//!   conditional insert with a uniqueness guarantee, exclusive per-row locked
//!   read-modify-write, COUNT/SUM aggregate queries over a relation, and the
//!   id-range scans the verifier samples with.
//! - [`ChangeStore`] - the append-only change log backing the asynchronous
//!   path.
//!
//! The unit of mutual exclusion is a single counter row: every
//! read-modify-write sequence (increment, reconcile batch, recalculation,
//! reset, correction) goes through [`CounterStore::with_lock`], and different
//! rows never contend with each other. Change-log appends deliberately bypass
//! the row lock; that is the whole point of the asynchronous path.
//!
//! A reference implementation, [`MemoryStore`](memory::MemoryStore), ships
//! with the crate and doubles as the test substrate.

pub mod memory;

use chrono::{DateTime, Utc};

use crate::definition::Relation;
use crate::error::Result;
use crate::filters::ItemPredicate;
use crate::model::{CounterChange, CounterKey, CounterValue, ParentRef};

/// Storage operations for aggregate rows.
pub trait CounterStore: Send + Sync {
    /// Point lookup by logical key.
    fn find(&self, key: &CounterKey) -> Result<Option<CounterValue>>;

    /// Point lookup by store-assigned row id.
    fn find_by_id(&self, id: i64) -> Result<Option<CounterValue>>;

    /// Inserts a fresh zero-valued row for `key`.
    ///
    /// Must enforce the key's uniqueness: a concurrent insert of the same key
    /// fails with [`CounterError::Conflict`](crate::error::CounterError),
    /// which the engine catches and retries against the winning row.
    fn insert(&self, key: &CounterKey) -> Result<CounterValue>;

    /// Runs `body` on the row under its exclusive lock, persisting the
    /// mutation when `body` returns `Ok`. Returns the committed row.
    ///
    /// The lock must be held for the full duration of `body`, including any
    /// aggregate queries or change-log work it performs.
    fn with_lock(
        &self,
        id: i64,
        body: &mut dyn FnMut(&mut CounterValue) -> Result<()>,
    ) -> Result<CounterValue>;

    /// COUNT (or SUM of `sum_field`) over the countable entities of
    /// `relation` owned by `parent`, restricted by `scope` when given.
    fn aggregate(
        &self,
        parent: &ParentRef,
        relation: &Relation,
        sum_field: Option<&str>,
        scope: Option<&ItemPredicate>,
    ) -> Result<f64>;

    /// Deletes every counter row owned by `parent` (cascade with the parent's
    /// own lifecycle). Returns the number of rows removed.
    fn delete_for_parent(&self, parent: &ParentRef) -> Result<usize>;

    /// The smallest and largest row ids currently stored, if any rows exist.
    /// Used by the verifier's random sampling.
    fn id_bounds(&self) -> Result<Option<(i64, i64)>>;

    /// The row with the smallest id `>= id`, if any.
    fn first_at_or_after(&self, id: i64) -> Result<Option<CounterValue>>;
}

/// Storage operations for the change log.
pub trait ChangeStore: Send + Sync {
    /// Appends an unprocessed change row. Never touches the counter row and
    /// never takes its lock.
    fn append(&self, counter_id: i64, amount: f64, now: DateTime<Utc>) -> Result<CounterChange>;

    /// Every unprocessed change for the counter, in append order.
    fn unprocessed_for(&self, counter_id: i64) -> Result<Vec<CounterChange>>;

    /// Marks the given change rows processed at `now`. Rows already marked
    /// stay marked (idempotent).
    fn mark_processed(&self, change_ids: &[i64], now: DateTime<Utc>) -> Result<()>;

    /// Counter ids having at least one unprocessed change created at or
    /// before `older_than`. Drives the straggler sweep.
    fn counters_with_unprocessed(&self, older_than: DateTime<Utc>) -> Result<Vec<i64>>;

    /// Deletes processed rows whose `processed_at` is before `before`.
    /// Storage hygiene only; never correctness-critical.
    fn purge_processed(&self, before: DateTime<Utc>) -> Result<usize>;
}
