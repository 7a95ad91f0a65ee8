//! Static counter configuration.
//!
//! A [`CounterDefinition`] describes one kind of counter: what it counts, how,
//! and under what conditions. Definitions are built once at startup with the
//! chained `with_*` style, registered in a
//! [`Registry`](crate::registry::Registry), and never mutated afterwards.
//!
//! Exactly one of three classifications applies to every definition:
//!
//! - **relation-backed**: aggregates a live collection of countable entities
//!   (a plain count, or a sum over [`sum_field`](CounterDefinition::sum_field));
//! - **calculated**: a pure function of other counters' current values;
//! - **manual**: moved only by explicit increment/decrement/reset.
//!
//! # Examples
//!
//! A conditional counter of premium products per user:
//!
//! ```rust
//! use conteggio::definition::{CounterDefinition, Relation};
//! use conteggio::filters::{Conditions, Filter, Matcher, Phase};
//!
//! let premium = |p: f64| p >= 1000.0;
//! let definition = CounterDefinition::new("premium_products")
//!     .with_parent("user")
//!     .counting(Relation::new("products", "product").with_inverse("user"))
//!     .with_scope(|item| item.get("price").as_number().is_some_and(|p| p >= 1000.0))
//!     .on(
//!         Phase::Create,
//!         Conditions::new().increment_if(Filter::test(|item| {
//!             item.get("price").as_number().is_some_and(|p| p >= 1000.0)
//!         })),
//!     )
//!     .on(
//!         Phase::Update,
//!         Conditions::new()
//!             .increment_if(Filter::changed(
//!                 "price",
//!                 Matcher::number(move |p| !premium(p)),
//!                 Matcher::number(premium),
//!             ))
//!             .decrement_if(Filter::changed(
//!                 "price",
//!                 Matcher::number(premium),
//!                 Matcher::number(move |p| !premium(p)),
//!             )),
//!     );
//!
//! assert!(!definition.is_manual());
//! assert!(!definition.is_calculated());
//! ```

use std::fmt::{self, Debug};
use std::sync::Arc;

use crate::error::Result;
use crate::filters::{Conditions, Filters, ItemPredicate, Phase};
use crate::model::{Countable, CounterValue};

/// Post-change callback: receives the committed counter row and the old and
/// new values. Errors are isolated per hook and logged by the engine.
pub type Hook = Arc<dyn Fn(&CounterValue, f64, f64) -> Result<()> + Send + Sync>;

/// Pure aggregation over dependency values, in declaration order.
pub type Aggregation = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;

/// The collection of countable entities a relation-backed counter aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relation {
    /// The relation's name on the parent (e.g. `"products"`).
    pub name: &'static str,
    /// The kind of entity the relation contains, matched against
    /// [`Countable::kind`].
    pub countable_kind: &'static str,
    /// The inverse reference from the countable entity back to the parent.
    ///
    /// Required for parented counters: lifecycle events use it to know which
    /// aggregate to update. Validated at registry build time.
    pub inverse: Option<&'static str>,
}

impl Relation {
    /// Declares a relation named `name` containing entities of
    /// `countable_kind`, with no inverse reference yet.
    pub const fn new(name: &'static str, countable_kind: &'static str) -> Self {
        Relation {
            name,
            countable_kind,
            inverse: None,
        }
    }

    /// Sets the inverse reference back to the parent.
    pub const fn with_inverse(self, inverse: &'static str) -> Self {
        Relation {
            inverse: Some(inverse),
            ..self
        }
    }
}

/// Static configuration for one counter kind.
///
/// Constructed with chained `with_*` methods and frozen inside a registry.
#[derive(Clone)]
pub struct CounterDefinition {
    name: String,
    parent_kind: Option<&'static str>,
    relation: Option<Relation>,
    sum_field: Option<&'static str>,
    scope: Option<ItemPredicate>,
    filters: Filters,
    dependencies: Vec<String>,
    aggregate_with: Option<Aggregation>,
    hooks: Vec<Hook>,
}

impl CounterDefinition {
    /// Creates a definition with the given record name.
    ///
    /// The name is the persisted key of every row this definition produces;
    /// it must be unique within a registry.
    pub fn new(name: impl Into<String>) -> Self {
        CounterDefinition {
            name: name.into(),
            parent_kind: None,
            relation: None,
            sum_field: None,
            scope: None,
            filters: Filters::default(),
            dependencies: Vec::new(),
            aggregate_with: None,
            hooks: Vec::new(),
        }
    }

    /// Attaches the counter to a parent entity kind.
    ///
    /// Definitions without a parent are global singletons.
    pub fn with_parent(mut self, kind: &'static str) -> Self {
        self.parent_kind = Some(kind);
        self
    }

    /// Declares the relation this counter aggregates.
    pub fn counting(mut self, relation: Relation) -> Self {
        self.relation = Some(relation);
        self
    }

    /// Sums the given field instead of counting entities.
    pub fn summing(mut self, field: &'static str) -> Self {
        self.sum_field = Some(field);
        self
    }

    /// Restricts the countable set seen by recalculation and verification.
    ///
    /// Conditional counters should declare the same boundary here as in their
    /// filters, so `recalc` converges with live maintenance.
    pub fn with_scope(mut self, scope: impl Fn(&dyn Countable) -> bool + Send + Sync + 'static) -> Self {
        self.scope = Some(Arc::new(scope));
        self
    }

    /// Declares the condition pair for one lifecycle phase.
    pub fn on(mut self, phase: Phase, conditions: Conditions) -> Self {
        self.filters.set(phase, conditions);
        self
    }

    /// Makes this a calculated counter derived from other counters.
    ///
    /// `dependencies` are record names of counters on the same parent; the
    /// aggregation receives their current values in the same order whenever
    /// any of them changes.
    pub fn calculated_from<I, S>(
        mut self,
        dependencies: I,
        aggregate: impl Fn(&[f64]) -> f64 + Send + Sync + 'static,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self.aggregate_with = Some(Arc::new(aggregate));
        self
    }

    /// Appends a post-change hook.
    ///
    /// Hooks run synchronously after the value commits, in declaration order.
    /// A failing hook is logged and does not prevent later hooks.
    pub fn after_change(
        mut self,
        hook: impl Fn(&CounterValue, f64, f64) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.hooks.push(Arc::new(hook));
        self
    }

    /// The record name, used as the persisted key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The parent entity kind, or `None` for a global counter.
    pub fn parent_kind(&self) -> Option<&'static str> {
        self.parent_kind
    }

    /// The aggregated relation, if this counter is relation-backed.
    pub fn relation(&self) -> Option<&Relation> {
        self.relation.as_ref()
    }

    /// The summed field, if this counter sums instead of counting.
    pub fn sum_field(&self) -> Option<&'static str> {
        self.sum_field
    }

    /// The recalculation scope predicate, if declared.
    pub fn scope(&self) -> Option<&ItemPredicate> {
        self.scope.as_ref()
    }

    /// The declared lifecycle conditions.
    pub fn filters(&self) -> &Filters {
        &self.filters
    }

    /// Record names of the counters this calculated counter derives from.
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// The aggregation function, if this counter is calculated.
    pub fn aggregation(&self) -> Option<&Aggregation> {
        self.aggregate_with.as_ref()
    }

    /// The ordered post-change hooks.
    pub fn hooks(&self) -> &[Hook] {
        &self.hooks
    }

    /// Is this a global (parentless) counter?
    pub fn is_global(&self) -> bool {
        self.parent_kind.is_none()
    }

    /// Is this counter calculated from other counters?
    pub fn is_calculated(&self) -> bool {
        self.aggregate_with.is_some()
    }

    /// Does this counter sum a field rather than count entities?
    pub fn uses_sum(&self) -> bool {
        self.sum_field.is_some()
    }

    /// Is this a manual counter, moved only by explicit operations?
    pub fn is_manual(&self) -> bool {
        self.relation.is_none() && !self.is_calculated()
    }

    /// Does this counter respond to lifecycle events at all?
    ///
    /// Calculated counters never accept items; their value is derived.
    pub fn accepts_items(&self) -> bool {
        self.relation.is_some() && !self.is_calculated()
    }

    /// How much one entity contributes to the aggregate: `1` for plain
    /// counts, the sum field's numeric value for sums (`0` when absent).
    pub fn contribution(&self, item: &dyn Countable) -> f64 {
        match self.sum_field {
            Some(field) => item.get(field).as_number().unwrap_or(0.0),
            None => 1.0,
        }
    }
}

impl Debug for CounterDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterDefinition")
            .field("name", &self.name)
            .field("parent_kind", &self.parent_kind)
            .field("relation", &self.relation)
            .field("sum_field", &self.sum_field)
            .field("dependencies", &self.dependencies)
            .field("calculated", &self.is_calculated())
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Record;

    #[test]
    fn test_classification_relation_backed() {
        let def = CounterDefinition::new("products")
            .with_parent("user")
            .counting(Relation::new("products", "product").with_inverse("user"));
        assert!(!def.is_manual());
        assert!(!def.is_calculated());
        assert!(!def.is_global());
        assert!(!def.uses_sum());
        assert!(def.accepts_items());
    }

    #[test]
    fn test_classification_manual() {
        let def = CounterDefinition::new("visits").with_parent("user");
        assert!(def.is_manual());
        assert!(!def.accepts_items());
    }

    #[test]
    fn test_classification_calculated() {
        let def = CounterDefinition::new("conversion_rate")
            .with_parent("user")
            .calculated_from(["visits", "orders"], |values| {
                (values[1] / values[0]) * 100.0
            });
        assert!(def.is_calculated());
        assert!(!def.is_manual());
        assert!(!def.accepts_items());
        assert_eq!(def.dependencies(), ["visits", "orders"]);
    }

    #[test]
    fn test_classification_global() {
        let def = CounterDefinition::new("signups");
        assert!(def.is_global());
        assert!(def.is_manual());
    }

    #[test]
    fn test_contribution_count() {
        let def = CounterDefinition::new("products")
            .with_parent("user")
            .counting(Relation::new("products", "product").with_inverse("user"));
        let item = Record::new("product", 1).with_field("price", 100);
        assert_eq!(def.contribution(&item), 1.0);
    }

    #[test]
    fn test_contribution_sum() {
        let def = CounterDefinition::new("order_revenue")
            .with_parent("user")
            .counting(Relation::new("orders", "order").with_inverse("user"))
            .summing("price");
        let order = Record::new("order", 1).with_field("price", 250);
        assert_eq!(def.contribution(&order), 250.0);

        let missing = Record::new("order", 2);
        assert_eq!(def.contribution(&missing), 0.0);
    }

    #[test]
    fn test_aggregation_function() {
        let def = CounterDefinition::new("conversion_rate")
            .with_parent("user")
            .calculated_from(["visits", "orders"], |values| {
                (values[1] / values[0]) * 100.0
            });
        let aggregate = def.aggregation().unwrap();
        assert_eq!(aggregate(&[100.0, 2.0]), 2.0);
    }
}
