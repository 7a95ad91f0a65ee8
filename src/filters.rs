//! Conditional aggregation: deciding whether a lifecycle event moves a counter.
//!
//! A [`CounterDefinition`](crate::definition::CounterDefinition) may declare,
//! per lifecycle [`Phase`], independent predicate lists for the increment and
//! decrement [`Direction`]s. A counter with no declared conditions counts
//! unconditionally on create/delete and ignores updates entirely; once
//! conditions are declared, every predicate in the relevant direction list
//! must accept the event.
//!
//! Predicates are tagged variants rather than duck-typed values:
//!
//! - [`Filter::Named`] - a named predicate the entity itself implements via
//!   [`Countable::named_predicate`];
//! - [`Filter::Test`] - an inline function over the entity's current state;
//! - [`Filter::Transition`] - a state-transition test: "attribute X changed
//!   from matching `from` to matching `to`", with [`Matcher::Any`] as the
//!   wildcard on either side.
//!
//! The update path evaluates the increment and decrement lists independently.
//! A boundary-crossing update fires exactly one direction; an update that
//! crosses no boundary fires neither. Nothing forbids a filter set where both
//! directions accept the same update; keeping the two evaluations independent
//! is what guarantees the no-op-update invariant, so mutual exclusivity is
//! left to filter authors.

use std::fmt::{self, Debug};
use std::sync::Arc;

use crate::model::{Countable, FieldValue};

/// Lifecycle phase of the mutation being evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// A countable entity was created.
    Create,
    /// A countable entity was updated.
    Update,
    /// A countable entity was deleted.
    Delete,
}

/// Which way the counter would move if the event is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The event adds to the aggregate.
    Increment,
    /// The event subtracts from the aggregate.
    Decrement,
}

/// Inline predicate over a countable entity's current state.
pub type ItemPredicate = Arc<dyn Fn(&dyn Countable) -> bool + Send + Sync>;

/// Predicate over a single attribute value, used by transition matchers.
pub type ValuePredicate = Arc<dyn Fn(&FieldValue) -> bool + Send + Sync>;

/// One side of a state-transition test.
#[derive(Clone)]
pub enum Matcher {
    /// Matches any value ("changed from anything" / "changed to anything").
    Any,
    /// Matches a specific value.
    Equals(FieldValue),
    /// Matches values accepted by a predicate.
    Where(ValuePredicate),
}

impl Matcher {
    /// Builds a predicate matcher from a closure.
    pub fn matching(f: impl Fn(&FieldValue) -> bool + Send + Sync + 'static) -> Self {
        Matcher::Where(Arc::new(f))
    }

    /// Builds a predicate matcher over the numeric value of the attribute.
    ///
    /// Non-numeric values never match.
    pub fn number(f: impl Fn(f64) -> bool + Send + Sync + 'static) -> Self {
        Matcher::Where(Arc::new(move |v| v.as_number().is_some_and(&f)))
    }

    fn matches(&self, value: &FieldValue) -> bool {
        match self {
            Matcher::Any => true,
            Matcher::Equals(expected) => expected == value,
            Matcher::Where(predicate) => predicate(value),
        }
    }
}

impl Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Any => write!(f, "Any"),
            Matcher::Equals(v) => write!(f, "Equals({v:?})"),
            Matcher::Where(_) => write!(f, "Where(..)"),
        }
    }
}

/// The entity state visible to a filter for one lifecycle event.
#[derive(Clone, Copy)]
pub enum EventItem<'a> {
    /// Create/delete: only one state exists.
    Current(&'a dyn Countable),
    /// Update: the before and after snapshots.
    Changed {
        /// State before the update.
        before: &'a dyn Countable,
        /// State after the update.
        after: &'a dyn Countable,
    },
}

impl<'a> EventItem<'a> {
    /// The entity state predicates over "current state" see: the after
    /// snapshot for updates, the single snapshot otherwise.
    pub fn current(&self) -> &'a dyn Countable {
        match self {
            EventItem::Current(item) => *item,
            EventItem::Changed { after, .. } => *after,
        }
    }
}

/// One condition over a lifecycle event.
#[derive(Clone)]
pub enum Filter {
    /// A named predicate the domain entity implements itself.
    Named(&'static str),
    /// An inline boolean test of the entity's current state.
    Test(ItemPredicate),
    /// A state-transition test over one attribute.
    ///
    /// Accepts only when the attribute actually changed and the old value
    /// matches `from` while the new value matches `to`.
    Transition {
        /// The attribute to observe.
        attribute: String,
        /// Matcher for the value before the update.
        from: Matcher,
        /// Matcher for the value after the update.
        to: Matcher,
    },
}

impl Filter {
    /// Builds an inline test from a closure.
    pub fn test(f: impl Fn(&dyn Countable) -> bool + Send + Sync + 'static) -> Self {
        Filter::Test(Arc::new(f))
    }

    /// Builds a transition test over `attribute`.
    pub fn changed(attribute: impl Into<String>, from: Matcher, to: Matcher) -> Self {
        Filter::Transition {
            attribute: attribute.into(),
            from,
            to,
        }
    }

    /// Evaluates this filter against one event.
    pub fn accepts(&self, item: &EventItem<'_>) -> bool {
        match self {
            Filter::Named(name) => match item.current().named_predicate(name) {
                Some(result) => result,
                None => {
                    log::warn!(
                        "entity kind `{}` declares no predicate `{}`; rejecting",
                        item.current().kind(),
                        name
                    );
                    false
                }
            },
            Filter::Test(predicate) => predicate(item.current()),
            Filter::Transition {
                attribute,
                from,
                to,
            } => match item {
                // A transition is unobservable outside an update.
                EventItem::Current(_) => false,
                EventItem::Changed { before, after } => {
                    let old_value = before.get(attribute);
                    let new_value = after.get(attribute);
                    if old_value == new_value {
                        return false;
                    }
                    from.matches(&old_value) && to.matches(&new_value)
                }
            },
        }
    }
}

impl Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Named(name) => write!(f, "Named({name})"),
            Filter::Test(_) => write!(f, "Test(..)"),
            Filter::Transition {
                attribute,
                from,
                to,
            } => write!(f, "Transition({attribute}: {from:?} => {to:?})"),
        }
    }
}

/// The increment/decrement condition pair declared for one phase.
#[derive(Debug, Clone, Default)]
pub struct Conditions {
    increment: Vec<Filter>,
    decrement: Vec<Filter>,
}

impl Conditions {
    /// Creates an empty condition pair.
    pub fn new() -> Self {
        Conditions::default()
    }

    /// Adds a condition the event must pass to increment the counter.
    pub fn increment_if(mut self, filter: Filter) -> Self {
        self.increment.push(filter);
        self
    }

    /// Adds a condition the event must pass to decrement the counter.
    pub fn decrement_if(mut self, filter: Filter) -> Self {
        self.decrement.push(filter);
        self
    }

    fn for_direction(&self, direction: Direction) -> &[Filter] {
        match direction {
            Direction::Increment => &self.increment,
            Direction::Decrement => &self.decrement,
        }
    }
}

/// All conditions declared on one counter definition, keyed by phase.
#[derive(Debug, Clone, Default)]
pub struct Filters {
    create: Option<Conditions>,
    update: Option<Conditions>,
    delete: Option<Conditions>,
}

impl Filters {
    /// Returns `true` when no phase declares any condition.
    pub fn is_empty(&self) -> bool {
        self.create.is_none() && self.update.is_none() && self.delete.is_none()
    }

    /// Installs the condition pair for a phase, replacing any previous one.
    pub fn set(&mut self, phase: Phase, conditions: Conditions) {
        match phase {
            Phase::Create => self.create = Some(conditions),
            Phase::Update => self.update = Some(conditions),
            Phase::Delete => self.delete = Some(conditions),
        }
    }

    fn get(&self, phase: Phase) -> Option<&Conditions> {
        match phase {
            Phase::Create => self.create.as_ref(),
            Phase::Update => self.update.as_ref(),
            Phase::Delete => self.delete.as_ref(),
        }
    }

    /// Decides whether `item` moves the counter in `direction` for `phase`.
    ///
    /// Unconditional counters accept create/delete and ignore updates. Once
    /// any condition is declared, a phase without conditions rejects, as does
    /// a declared phase whose direction list is empty.
    pub fn accept(&self, item: &EventItem<'_>, phase: Phase, direction: Direction) -> bool {
        if self.is_empty() {
            return !matches!(phase, Phase::Update);
        }
        let Some(conditions) = self.get(phase) else {
            return false;
        };
        let list = conditions.for_direction(direction);
        !list.is_empty() && list.iter().all(|filter| filter.accepts(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Record;

    fn product(price: i64) -> Record {
        Record::new("product", 1).with_field("price", price)
    }

    #[test]
    fn test_unconditional_accepts_create_and_delete() {
        let filters = Filters::default();
        let item = product(10);
        let event = EventItem::Current(&item);
        assert!(filters.accept(&event, Phase::Create, Direction::Increment));
        assert!(filters.accept(&event, Phase::Delete, Direction::Decrement));
    }

    #[test]
    fn test_unconditional_ignores_updates() {
        let filters = Filters::default();
        let before = product(10);
        let after = product(20);
        let event = EventItem::Changed {
            before: &before,
            after: &after,
        };
        assert!(!filters.accept(&event, Phase::Update, Direction::Increment));
        assert!(!filters.accept(&event, Phase::Update, Direction::Decrement));
    }

    #[test]
    fn test_undeclared_phase_rejects() {
        let mut filters = Filters::default();
        filters.set(
            Phase::Create,
            Conditions::new().increment_if(Filter::test(|_| true)),
        );
        let item = product(10);
        let event = EventItem::Current(&item);
        assert!(filters.accept(&event, Phase::Create, Direction::Increment));
        assert!(!filters.accept(&event, Phase::Delete, Direction::Decrement));
    }

    #[test]
    fn test_inline_test_filter() {
        let mut filters = Filters::default();
        filters.set(
            Phase::Create,
            Conditions::new().increment_if(Filter::test(|item| {
                item.get("price").as_number().is_some_and(|p| p >= 1000.0)
            })),
        );
        let cheap = product(100);
        let premium = product(1500);
        assert!(!filters.accept(
            &EventItem::Current(&cheap),
            Phase::Create,
            Direction::Increment
        ));
        assert!(filters.accept(
            &EventItem::Current(&premium),
            Phase::Create,
            Direction::Increment
        ));
    }

    #[test]
    fn test_named_filter() {
        struct Premium;
        impl Countable for Premium {
            fn kind(&self) -> &str {
                "product"
            }
            fn id(&self) -> i64 {
                1
            }
            fn parent(&self) -> Option<crate::model::ParentRef> {
                None
            }
            fn get(&self, _field: &str) -> FieldValue {
                FieldValue::Null
            }
            fn named_predicate(&self, name: &str) -> Option<bool> {
                (name == "premium").then_some(true)
            }
        }

        let item = Premium;
        let event = EventItem::Current(&item);
        assert!(Filter::Named("premium").accepts(&event));
        assert!(!Filter::Named("discounted").accepts(&event));
    }

    #[test]
    fn test_transition_requires_actual_change() {
        let filter = Filter::changed("price", Matcher::Any, Matcher::Any);
        let before = product(1000);
        let after = product(1000);
        assert!(!filter.accepts(&EventItem::Changed {
            before: &before,
            after: &after,
        }));

        let after = product(1001);
        assert!(filter.accepts(&EventItem::Changed {
            before: &before,
            after: &after,
        }));
    }

    #[test]
    fn test_transition_any_to_value() {
        let filter = Filter::changed("price", Matcher::Any, Matcher::Equals(FieldValue::Int(2000)));
        let before = product(1000);
        let after = product(2000);
        let event = EventItem::Changed {
            before: &before,
            after: &after,
        };
        assert!(filter.accepts(&event));

        let miss = Filter::changed("price", Matcher::Any, Matcher::Equals(FieldValue::Int(999)));
        assert!(!miss.accepts(&event));
    }

    #[test]
    fn test_transition_value_to_any() {
        let filter = Filter::changed("price", Matcher::Equals(FieldValue::Int(1000)), Matcher::Any);
        let before = product(1000);
        let after = product(2000);
        assert!(filter.accepts(&EventItem::Changed {
            before: &before,
            after: &after,
        }));
    }

    #[test]
    fn test_transition_predicate_to_predicate() {
        let filter = Filter::changed(
            "price",
            Matcher::number(|p| p < 2000.0),
            Matcher::number(|p| p > 1000.0),
        );
        let before = product(1000);
        let after = product(2000);
        assert!(filter.accepts(&EventItem::Changed {
            before: &before,
            after: &after,
        }));

        // Reversed direction fails the `to` side.
        let before = product(2000);
        let after = product(1000);
        assert!(!filter.accepts(&EventItem::Changed {
            before: &before,
            after: &after,
        }));
    }

    #[test]
    fn test_transition_outside_update_rejects() {
        let filter = Filter::changed("price", Matcher::Any, Matcher::Any);
        let item = product(10);
        assert!(!filter.accepts(&EventItem::Current(&item)));
    }

    #[test]
    fn test_boundary_crossing_directions_are_independent() {
        let mut filters = Filters::default();
        filters.set(
            Phase::Update,
            Conditions::new()
                .increment_if(Filter::changed(
                    "price",
                    Matcher::number(|p| p < 1000.0),
                    Matcher::number(|p| p >= 1000.0),
                ))
                .decrement_if(Filter::changed(
                    "price",
                    Matcher::number(|p| p >= 1000.0),
                    Matcher::number(|p| p < 1000.0),
                )),
        );

        // Crossing upward: increment only.
        let before = product(100);
        let after = product(1500);
        let event = EventItem::Changed {
            before: &before,
            after: &after,
        };
        assert!(filters.accept(&event, Phase::Update, Direction::Increment));
        assert!(!filters.accept(&event, Phase::Update, Direction::Decrement));

        // No boundary crossed: neither.
        let before = product(1500);
        let after = product(1600);
        let event = EventItem::Changed {
            before: &before,
            after: &after,
        };
        assert!(!filters.accept(&event, Phase::Update, Direction::Increment));
        assert!(!filters.accept(&event, Phase::Update, Direction::Decrement));
    }
}
