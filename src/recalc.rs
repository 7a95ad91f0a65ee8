//! From-scratch recalculation and the operator repair surface.
//!
//! Incremental maintenance drifts when events are missed; `recalc` rebuilds a
//! counter's value from its source of truth instead of its history. The
//! branch taken follows the definition's classification:
//!
//! - **relation-backed**: COUNT (or SUM of the sum field) over the relation,
//!   restricted to the declared scope, computed and installed while the row
//!   lock is held. Holding the lock across the aggregate query is what keeps
//!   concurrent deltas from being lost mid-recalculation.
//! - **calculated**: re-evaluate the aggregation over the dependencies'
//!   current values.
//! - **manual**: there is no source of truth; recalculation is a domain
//!   error.
//!
//! `reset` forces the value to zero under the same lock; `reset` followed by
//! `recalc` restores whatever a from-scratch aggregate produces.

use crate::engine::Counters;
use crate::error::{CounterError, Result};
use crate::model::CounterKey;

impl Counters {
    /// Rebuilds the counter's value from its source of truth and returns it.
    ///
    /// # Errors
    ///
    /// [`CounterError::ManualRecalculation`] for manual counters (including
    /// parentless relation-backed ones, which have no aggregate to query).
    pub fn recalc(&self, key: &CounterKey) -> Result<f64> {
        let definition = self.registry.resolve_key(key)?;

        if definition.is_calculated() {
            self.calculate(key)?;
            return self.value(key);
        }

        let (Some(relation), Some(parent)) = (definition.relation(), key.parent.as_ref()) else {
            return Err(CounterError::ManualRecalculation(
                definition.name().to_string(),
            ));
        };

        let row = self.find_or_create(key)?;
        let store = &self.store;
        self.write_value(&definition, row.id, |_| {
            store.aggregate(parent, relation, definition.sum_field(), definition.scope())
        })?;
        self.value(key)
    }

    /// Re-evaluates a calculated counter from its dependencies and installs
    /// the result atomically.
    ///
    /// A no-op when any dependency row does not exist yet, and when called on
    /// a counter that is not calculated.
    pub fn calculate(&self, key: &CounterKey) -> Result<()> {
        let definition = self.registry.resolve_key(key)?;
        let Some(aggregate) = definition.aggregation() else {
            log::debug!("`{key}` is not calculated; nothing to do");
            return Ok(());
        };

        let mut values = Vec::with_capacity(definition.dependencies().len());
        for dependency in definition.dependencies() {
            let dependency_key = CounterKey {
                parent: key.parent,
                name: dependency.clone(),
            };
            match self.store.find(&dependency_key)? {
                Some(row) => values.push(row.value),
                // Can't calculate until every dependency exists.
                None => return Ok(()),
            }
        }

        let new_value = aggregate(&values);
        let row = self.find_or_create(key)?;
        self.write_value(&definition, row.id, |_| Ok(new_value))
    }

    /// Forces the counter's value to zero under its lock.
    ///
    /// Part of the operator repair surface, alongside [`Counters::recalc`].
    /// Hooks fire like any other value change.
    pub fn reset(&self, key: &CounterKey) -> Result<()> {
        let definition = self.registry.resolve_key(key)?;
        let row = self.find_or_create(key)?;
        self.write_value(&definition, row.id, |_| Ok(0.0))
    }

    /// Computes the counter's true value without writing anything.
    ///
    /// `None` when the counter has no recomputable source (manual and global
    /// counters, calculated counters with missing dependencies).
    pub(crate) fn true_value(&self, key: &CounterKey) -> Result<Option<f64>> {
        let definition = self.registry.resolve_key(key)?;

        if let Some(aggregate) = definition.aggregation() {
            let mut values = Vec::with_capacity(definition.dependencies().len());
            for dependency in definition.dependencies() {
                let dependency_key = CounterKey {
                    parent: key.parent,
                    name: dependency.clone(),
                };
                match self.store.find(&dependency_key)? {
                    Some(row) => values.push(row.value),
                    None => return Ok(None),
                }
            }
            return Ok(Some(aggregate(&values)));
        }

        if let (Some(relation), Some(parent)) = (definition.relation(), key.parent.as_ref()) {
            let value =
                self.store
                    .aggregate(parent, relation, definition.sum_field(), definition.scope())?;
            return Ok(Some(value));
        }

        Ok(None)
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
    }

    fn fixture() -> Fixture {
        let registry = Registry::builder()
            .counter(
                CounterDefinition::new("products")
                    .with_parent("user")
                    .counting(Relation::new("products", "product").with_inverse("user")),
            )
            .counter(
                CounterDefinition::new("order_revenue")
                    .with_parent("user")
                    .counting(Relation::new("orders", "order").with_inverse("user"))
                    .summing("price"),
            )
            .counter(
                CounterDefinition::new("premium_products")
                    .with_parent("user")
                    .counting(Relation::new("products", "product").with_inverse("user"))
                    .with_scope(|item| item.get("price").as_number().is_some_and(|p| p >= 1000.0)),
            )
            .counter(CounterDefinition::new("visits").with_parent("user"))
            .counter(CounterDefinition::new("orders_count").with_parent("user"))
            .counter(
                CounterDefinition::new("conversion_rate")
                    .with_parent("user")
                    .calculated_from(["visits", "orders_count"], |v| (v[1] / v[0]) * 100.0),
            )
            .build()
            .unwrap();
        let store = Arc::new(MemoryStore::new());
        let counters = Counters::new(
            Arc::new(registry),
            store.clone(),
            Arc::new(MemoryChangeStore::new()),
            Arc::new(QueueScheduler::new()),
        );
        Fixture { counters, store }
    }

    fn user() -> ParentRef {
        ParentRef::new("user", 1)
    }

    fn seed_orders(store: &MemoryStore, prices: &[i64]) {
        for (i, price) in prices.iter().enumerate() {
            store.put_item(
                Record::new("order", i as i64 + 1)
                    .with_parent(user())
                    .with_field("price", *price),
            );
        }
    }

    #[test]
    fn test_recalc_count_from_relation() {
        let f = fixture();
        for id in 1..=4 {
            f.store
                .put_item(Record::new("product", id).with_parent(user()));
        }
        let key = CounterKey::parented(user(), "products");
        assert_eq!(f.counters.recalc(&key).unwrap(), 4.0);
    }

    #[test]
    fn test_recalc_sum_from_relation() {
        let f = fixture();
        seed_orders(&f.store, &[10, 20, 30]);
        let key = CounterKey::parented(user(), "order_revenue");
        assert_eq!(f.counters.recalc(&key).unwrap(), 60.0);
    }

    #[test]
    fn test_recalc_applies_scope() {
        let f = fixture();
        f.store.put_item(
            Record::new("product", 1)
                .with_parent(user())
                .with_field("price", 100),
        );
        f.store.put_item(
            Record::new("product", 2)
                .with_parent(user())
                .with_field("price", 1500),
        );
        let key = CounterKey::parented(user(), "premium_products");
        assert_eq!(f.counters.recalc(&key).unwrap(), 1.0);
    }

    #[test]
    fn test_recalc_manual_counter_fails() {
        let f = fixture();
        let key = CounterKey::parented(user(), "visits");
        assert!(matches!(
            f.counters.recalc(&key),
            Err(CounterError::ManualRecalculation(_))
        ));
    }

    #[test]
    fn test_recalc_overwrites_drifted_value() {
        let f = fixture();
        seed_orders(&f.store, &[10, 20, 30]);
        let key = CounterKey::parented(user(), "order_revenue");
        f.counters.increment(&key, 999.0).unwrap();
        assert_eq!(f.counters.recalc(&key).unwrap(), 60.0);
    }

    #[test]
    fn test_reset_then_recalc_round_trips() {
        let f = fixture();
        seed_orders(&f.store, &[10, 20, 30]);
        let key = CounterKey::parented(user(), "order_revenue");
        assert_eq!(f.counters.recalc(&key).unwrap(), 60.0);

        f.counters.reset(&key).unwrap();
        assert_eq!(f.counters.value(&key).unwrap(), 0.0);
        assert_eq!(f.counters.recalc(&key).unwrap(), 60.0);
    }

    #[test]
    fn test_calculated_counter_updates_automatically() {
        let f = fixture();
        let visits = CounterKey::parented(user(), "visits");
        let orders = CounterKey::parented(user(), "orders_count");
        let rate = CounterKey::parented(user(), "conversion_rate");

        f.counters.increment(&visits, 100.0).unwrap();
        f.counters.increment(&orders, 2.0).unwrap();

        // No explicit recalculation: propagation kept the rate current.
        assert_eq!(f.counters.value(&rate).unwrap(), 2.0);
    }

    #[test]
    fn test_calculate_skips_missing_dependencies() {
        let f = fixture();
        let visits = CounterKey::parented(user(), "visits");
        let rate = CounterKey::parented(user(), "conversion_rate");

        // Only one dependency exists; the rate stays untouched.
        f.counters.increment(&visits, 10.0).unwrap();
        assert_eq!(f.counters.value(&rate).unwrap(), 0.0);
    }

    #[test]
    fn test_recalc_of_calculated_counter() {
        let f = fixture();
        let visits = CounterKey::parented(user(), "visits");
        let orders = CounterKey::parented(user(), "orders_count");
        let rate = CounterKey::parented(user(), "conversion_rate");

        f.counters.increment(&visits, 50.0).unwrap();
        f.counters.increment(&orders, 5.0).unwrap();
        f.counters.reset(&rate).unwrap();
        assert_eq!(f.counters.recalc(&rate).unwrap(), 10.0);
    }

    #[test]
    fn test_recalc_converges_with_live_maintenance() {
        let f = fixture();
        let key = CounterKey::parented(user(), "products");

        // Live maintenance: events fire and the backing table changes too.
        for id in 1..=3 {
            let item = Record::new("product", id).with_parent(user());
            f.store.put_item(item.clone());
            f.counters.add_item(&item).unwrap();
        }
        let removed = Record::new("product", 2).with_parent(user());
        f.store.remove_item("product", 2);
        f.counters.remove_item(&removed).unwrap();

        let live = f.counters.value(&key).unwrap();
        assert_eq!(f.counters.recalc(&key).unwrap(), live);
    }

    #[test]
    fn test_first_creation_race_retries() {
        use std::thread;

        let f = fixture();
        seed_orders(&f.store, &[10, 20, 30]);
        let counters = Arc::new(f.counters);
        let key = CounterKey::parented(user(), "order_revenue");

        let mut handles = vec![];
        for _ in 0..4 {
            let counters = Arc::clone(&counters);
            let key = key.clone();
            handles.push(thread::spawn(move || counters.recalc(&key).unwrap()));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 60.0);
        }
    }
}
