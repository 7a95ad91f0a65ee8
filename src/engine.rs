//! The counter engine facade and the synchronous increment path.
//!
//! [`Counters`] ties the registry, the stores, and the scheduler together.
//! Its surface is split by concern across a few modules, mirroring how the
//! paths differ:
//!
//! - this module: find-or-create, `increment`/`decrement`/`apply_delta`, the
//!   lifecycle entry points (`add_item`/`update_item`/`remove_item`), hook
//!   firing, and dependency propagation;
//! - [`changes`](crate::changes): the asynchronous change-log path;
//! - [`recalc`](crate::recalc): from-scratch recalculation and reset;
//! - [`verify`](crate::verify): drift detection and repair.
//!
//! # The synchronous hot path
//!
//! `apply_delta` acquires the row's exclusive lock, adds the signed delta,
//! and commits. Zero deltas are dropped before any store traffic so they
//! fire no writes and no hooks. After the commit the definition's hooks run
//! in order with `(counter, old, new)`, each failure isolated and logged,
//! and any calculated counters depending on the changed one are recomputed.
//!
//! Lock contention on one hot aggregate is the intended backpressure signal
//! steering that counter toward the asynchronous path instead.
//!
//! # Examples
//!
//! ```rust,ignore
//! let counters = Counters::new(registry, store, changes, scheduler);
//!
//! // Lifecycle events from the domain:
//! counters.add_item(&product)?;
//! counters.update_item(&before, &after)?;
//! counters.remove_item(&product)?;
//!
//! // Manual counters:
//! counters.increment(&CounterKey::parented(user, "visits"), 100.0)?;
//! ```

use std::sync::Arc;

use crate::definition::CounterDefinition;
use crate::error::{CounterError, Result};
use crate::filters::{Direction, EventItem, Phase};
use crate::model::{Countable, CounterKey, CounterValue, ParentRef};
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::store::{ChangeStore, CounterStore};

/// The counter maintenance engine.
///
/// Cheap to clone is not a goal; share it with `Arc` like the stores it
/// wraps.
pub struct Counters {
    pub(crate) registry: Arc<Registry>,
    pub(crate) store: Arc<dyn CounterStore>,
    pub(crate) changes: Arc<dyn ChangeStore>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
}

/// One accepted counter movement derived from a lifecycle event.
pub(crate) struct Movement {
    pub(crate) definition: Arc<CounterDefinition>,
    pub(crate) key: CounterKey,
    pub(crate) amount: f64,
}

impl Counters {
    /// Creates an engine over the given collaborators.
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn CounterStore>,
        changes: Arc<dyn ChangeStore>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Counters {
            registry,
            store,
            changes,
            scheduler,
        }
    }

    /// The definition registry this engine resolves against.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Finds the counter row for `key`, creating a zero-valued one if absent.
    ///
    /// A concurrent first creation losing the uniqueness race retries against
    /// the winning row; the race is never surfaced to the caller.
    pub fn find_or_create(&self, key: &CounterKey) -> Result<CounterValue> {
        if let Some(row) = self.store.find(key)? {
            return Ok(row);
        }
        match self.store.insert(key) {
            Ok(row) => Ok(row),
            Err(CounterError::Conflict(_)) => self.store.find(key)?.ok_or_else(|| {
                CounterError::Store(format!("row for `{key}` vanished after conflict"))
            }),
            Err(err) => Err(err),
        }
    }

    /// The current value of `key`, `0` when no row exists yet.
    pub fn value(&self, key: &CounterKey) -> Result<f64> {
        Ok(self.store.find(key)?.map(|row| row.value).unwrap_or(0.0))
    }

    /// Increments the counter by `by`.
    pub fn increment(&self, key: &CounterKey, by: f64) -> Result<()> {
        self.apply_delta(key, by)
    }

    /// Decrements the counter by `by`.
    pub fn decrement(&self, key: &CounterKey, by: f64) -> Result<()> {
        self.apply_delta(key, -by)
    }

    /// Applies a signed delta under the row's exclusive lock.
    ///
    /// A zero delta is a complete no-op: no write, no hooks.
    pub fn apply_delta(&self, key: &CounterKey, delta: f64) -> Result<()> {
        if delta == 0.0 {
            return Ok(());
        }
        let definition = self.registry.resolve_key(key)?;
        let row = self.find_or_create(key)?;
        self.write_value(&definition, row.id, |current| Ok(current + delta))
    }

    /// Entry point for "a countable entity was created".
    pub fn add_item(&self, item: &dyn Countable) -> Result<()> {
        let event = EventItem::Current(item);
        for movement in self.movements(&event, Phase::Create) {
            self.apply_movement(&movement)?;
        }
        Ok(())
    }

    /// Entry point for "a countable entity was updated".
    ///
    /// The increment and decrement condition sets are evaluated
    /// independently; a boundary-crossing update fires one of them, a no-op
    /// update fires neither, and an ill-formed filter set may fire both.
    pub fn update_item(&self, before: &dyn Countable, after: &dyn Countable) -> Result<()> {
        let event = EventItem::Changed { before, after };
        for movement in self.movements(&event, Phase::Update) {
            self.apply_movement(&movement)?;
        }
        Ok(())
    }

    /// Entry point for "a countable entity was deleted".
    pub fn remove_item(&self, item: &dyn Countable) -> Result<()> {
        let event = EventItem::Current(item);
        for movement in self.movements(&event, Phase::Delete) {
            self.apply_movement(&movement)?;
        }
        Ok(())
    }

    /// Cascade: drops every counter row owned by `parent`.
    ///
    /// Call when the parent entity itself is deleted; counter rows are never
    /// deleted any other way.
    pub fn delete_for_parent(&self, parent: &ParentRef) -> Result<usize> {
        self.store.delete_for_parent(parent)
    }

    /// Resolves a lifecycle event into the accepted counter movements.
    pub(crate) fn movements(&self, event: &EventItem<'_>, phase: Phase) -> Vec<Movement> {
        let item = event.current();
        let Some(parent) = item.parent() else {
            return Vec::new();
        };

        let mut movements = Vec::new();
        for definition in self.registry.counting(item) {
            let key = CounterKey::parented(parent, definition.name());
            match phase {
                Phase::Create => {
                    if definition
                        .filters()
                        .accept(event, phase, Direction::Increment)
                    {
                        let amount = definition.contribution(item);
                        movements.push(Movement {
                            definition,
                            key,
                            amount,
                        });
                    }
                }
                Phase::Delete => {
                    if definition
                        .filters()
                        .accept(event, phase, Direction::Decrement)
                    {
                        let amount = -definition.contribution(item);
                        movements.push(Movement {
                            definition,
                            key,
                            amount,
                        });
                    }
                }
                Phase::Update => {
                    let EventItem::Changed { before, after } = event else {
                        continue;
                    };
                    if definition
                        .filters()
                        .accept(event, phase, Direction::Increment)
                    {
                        movements.push(Movement {
                            definition: definition.clone(),
                            key: key.clone(),
                            amount: definition.contribution(*after),
                        });
                    }
                    if definition
                        .filters()
                        .accept(event, phase, Direction::Decrement)
                    {
                        movements.push(Movement {
                            definition: definition.clone(),
                            key,
                            amount: -definition.contribution(*before),
                        });
                    }
                }
            }
        }
        movements
    }

    fn apply_movement(&self, movement: &Movement) -> Result<()> {
        if movement.amount == 0.0 {
            return Ok(());
        }
        let row = self.find_or_create(&movement.key)?;
        self.write_value(&movement.definition, row.id, |current| {
            Ok(current + movement.amount)
        })
    }

    /// Locked read-modify-write plus the post-commit side effects.
    ///
    /// `next` computes the new value from the current one while the row lock
    /// is held. When the committed value differs from the old one, hooks fire
    /// and dependent calculated counters are recomputed.
    pub(crate) fn write_value(
        &self,
        definition: &Arc<CounterDefinition>,
        row_id: i64,
        mut next: impl FnMut(f64) -> Result<f64>,
    ) -> Result<()> {
        let mut old = 0.0;
        let mut new = 0.0;
        let row = self.store.with_lock(row_id, &mut |row| {
            old = row.value;
            new = next(row.value)?;
            row.value = new;
            Ok(())
        })?;
        if old != new {
            self.after_change(definition, &row, old, new)?;
        }
        Ok(())
    }

    /// Post-commit side effects: ordered hooks, then dependency propagation.
    fn after_change(
        &self,
        definition: &Arc<CounterDefinition>,
        row: &CounterValue,
        old: f64,
        new: f64,
    ) -> Result<()> {
        for hook in definition.hooks() {
            // One failing hook must not prevent the others from running.
            if let Err(err) = hook(row, old, new) {
                log::warn!("hook on counter `{}` failed: {err}", definition.name());
            }
        }

        // Single-hop push propagation: recompute every calculated counter on
        // the same parent that depends on this one. Chains cascade because
        // each recomputation is itself a value change.
        for dependent in self
            .registry
            .dependents_of(definition.parent_kind(), definition.name())
        {
            let key = CounterKey {
                parent: row.key.parent,
                name: dependent.name().to_string(),
            };
            self.calculate(&key)?;
        }
        Ok(())
    }
}
