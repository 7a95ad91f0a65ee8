//! Core data model: keys, field values, countable entities, and the two
//! persisted record types.
//!
//! The engine is deliberately ignorant of the integrating domain's entity
//! types. Entities cross the boundary as [`Countable`] trait objects exposing
//! a kind, an id, an optional parent reference, and dynamically-typed field
//! access via [`FieldValue`]. The [`Record`] type is a plain field-map
//! implementation of `Countable` used by the in-memory store and tests.
//!
//! Two record types are persisted:
//!
//! - [`CounterValue`] - the aggregate row, one per (parent, counter kind),
//!   unique on its [`CounterKey`].
//! - [`CounterChange`] - a pending signed delta on the asynchronous path,
//!   append-only until reconciled.

use chrono::{DateTime, Utc};
use std::fmt::{self, Display};

/// Polymorphic reference to the entity owning a counter.
///
/// # Examples
///
/// ```rust
/// use conteggio::model::ParentRef;
///
/// let owner = ParentRef::new("user", 7);
/// assert_eq!(owner.to_string(), "user#7");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ParentRef {
    /// The parent entity's kind (model type).
    pub kind: &'static str,
    /// The parent entity's id.
    pub id: i64,
}

impl ParentRef {
    /// Creates a reference to the entity of `kind` with the given id.
    pub const fn new(kind: &'static str, id: i64) -> Self {
        ParentRef { kind, id }
    }
}

impl Display for ParentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// Logical identity of one aggregate: `(parent, name)`, unique per store.
///
/// Global counters carry no parent and are keyed by name alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CounterKey {
    /// The owning entity, or `None` for a global counter.
    pub parent: Option<ParentRef>,
    /// The counter definition's record name.
    pub name: String,
}

impl CounterKey {
    /// Key for a counter attached to `parent`.
    pub fn parented(parent: ParentRef, name: impl Into<String>) -> Self {
        CounterKey {
            parent: Some(parent),
            name: name.into(),
        }
    }

    /// Key for a global (singleton) counter.
    pub fn global(name: impl Into<String>) -> Self {
        CounterKey {
            parent: None,
            name: name.into(),
        }
    }
}

impl Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.parent {
            Some(parent) => write!(f, "{}/{}", parent, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Dynamically-typed attribute value of a countable entity.
///
/// # Examples
///
/// ```rust
/// use conteggio::model::FieldValue;
///
/// assert_eq!(FieldValue::Int(42).as_number(), Some(42.0));
/// assert_eq!(FieldValue::Null.as_number(), None);
/// assert!(FieldValue::Text("premium".into()) != FieldValue::Null);
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum FieldValue {
    /// Absent or SQL-null attribute.
    Null,
    /// Integer attribute.
    Int(i64),
    /// Floating point attribute.
    Float(f64),
    /// Text attribute.
    Text(String),
    /// Boolean attribute.
    Bool(bool),
}

impl FieldValue {
    /// Returns the numeric value, if this field holds one.
    ///
    /// Used to compute a summed counter's contribution from its sum field.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

/// The surface a domain entity exposes to the counter engine.
///
/// Lifecycle events carry entities as `&dyn Countable`; filters, sum fields,
/// and parent resolution all go through this trait.
pub trait Countable {
    /// The entity's kind (model type), matched against
    /// [`Relation::countable_kind`](crate::definition::Relation).
    fn kind(&self) -> &str;

    /// The entity's id.
    fn id(&self) -> i64;

    /// The entity owning the counters this entity contributes to, if loaded.
    fn parent(&self) -> Option<ParentRef>;

    /// Dynamically-typed attribute access. Unknown fields are
    /// [`FieldValue::Null`].
    fn get(&self, field: &str) -> FieldValue;

    /// Evaluates a named predicate declared on the entity itself.
    ///
    /// Returns `None` when the entity declares no predicate with that name;
    /// the filter evaluator treats that as a rejection and logs a warning.
    fn named_predicate(&self, _name: &str) -> Option<bool> {
        None
    }
}

/// A plain field-map entity, the reference [`Countable`] implementation.
///
/// # Examples
///
/// ```rust
/// use conteggio::model::{Countable, FieldValue, ParentRef, Record};
///
/// let product = Record::new("product", 1)
///     .with_parent(ParentRef::new("user", 7))
///     .with_field("price", 100);
///
/// assert_eq!(product.get("price"), FieldValue::Int(100));
/// assert_eq!(product.get("missing"), FieldValue::Null);
/// ```
#[derive(Debug, Clone)]
pub struct Record {
    kind: &'static str,
    id: i64,
    parent: Option<ParentRef>,
    fields: Vec<(String, FieldValue)>,
}

impl Record {
    /// Creates a record of the given kind and id with no fields.
    pub fn new(kind: &'static str, id: i64) -> Self {
        Record {
            kind,
            id,
            parent: None,
            fields: Vec::new(),
        }
    }

    /// Sets the owning parent entity.
    pub fn with_parent(mut self, parent: ParentRef) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Sets a field, replacing any previous value under the same name.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        let name = name.into();
        self.fields.retain(|(n, _)| *n != name);
        self.fields.push((name, value.into()));
        self
    }
}

impl Countable for Record {
    fn kind(&self) -> &str {
        self.kind
    }

    fn id(&self) -> i64 {
        self.id
    }

    fn parent(&self) -> Option<ParentRef> {
        self.parent
    }

    fn get(&self, field: &str) -> FieldValue {
        self.fields
            .iter()
            .find(|(n, _)| n == field)
            .map(|(_, v)| v.clone())
            .unwrap_or(FieldValue::Null)
    }
}

/// The persisted aggregate row: one per (parent, counter kind).
///
/// `value` is `f64` for both plain counts (whole-valued) and sums or
/// calculated ratios (possibly decimal). Rows are created lazily on first
/// access or eagerly at recalculation, and only mutated under the store's
/// per-row exclusive lock.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CounterValue {
    /// Store-assigned row id.
    pub id: i64,
    /// Unique logical identity: `(parent, name)`.
    pub key: CounterKey,
    /// The current aggregate value.
    pub value: f64,
}

impl Display for CounterValue {
    /// Formats the row as `key:value`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key, self.value)
    }
}

/// A pending signed delta on the asynchronous path.
///
/// Appended by `record_change` without touching the aggregate row, folded in
/// by reconciliation, then marked processed and eventually purged.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CounterChange {
    /// Store-assigned row id.
    pub id: i64,
    /// The aggregate row this delta targets.
    pub counter_id: i64,
    /// The signed delta.
    pub amount: f64,
    /// When the delta was recorded.
    pub created_at: DateTime<Utc>,
    /// When the delta was folded into the aggregate; `None` until reconciled.
    pub processed_at: Option<DateTime<Utc>>,
}

impl CounterChange {
    /// Returns `true` once this change has been folded into its counter.
    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }
}
