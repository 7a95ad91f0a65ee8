//! Unified error type for the counter engine.
//!
//! This module provides a single [`CounterError`] type covering configuration
//! errors (surfaced at registry build time), domain errors (recoverable by the
//! caller), and collaborator failures. This allows client code to handle every
//! engine operation with one error type.
//!
//! # Example
//!
//! ```rust,ignore
//! use conteggio::error::{Result, CounterError};
//!
//! fn repair(counters: &Counters, key: &CounterKey) -> Result<()> {
//!     match counters.recalc(key) {
//!         Err(CounterError::ManualRecalculation(_)) => Ok(()), // nothing to rebuild
//!         other => other.map(|_| ()),
//!     }
//! }
//! ```

use thiserror::Error;

/// Unified error type for all counter engine operations.
#[derive(Debug, Error)]
pub enum CounterError {
    /// No definition matches the given parent kind and counter name.
    #[error("unknown counter `{name}` for parent kind `{parent_kind}`")]
    UnknownCounter {
        /// The counter name that failed to resolve.
        name: String,
        /// The parent kind the lookup started from (`"<global>"` for global lookups).
        parent_kind: String,
    },

    /// Two definitions on the same parent kind share a record name.
    #[error("duplicate counter definition `{0}`")]
    DuplicateDefinition(String),

    /// A relation-backed definition has no inverse reference back to its
    /// parent, so lifecycle events cannot locate the aggregate to update.
    #[error("counter `{0}` counts relation `{1}` which declares no inverse reference to the parent")]
    MissingInverse(String, String),

    /// Manual counters have no source of truth to rebuild from.
    #[error("cannot recalculate manual counter `{0}`")]
    ManualRecalculation(String),

    /// A stored value disagrees with the freshly computed true value.
    ///
    /// Only raised under [`OnError::Raise`](crate::verify::OnError); the other
    /// verification policies report without erroring.
    #[error("counter `{name}` has incorrect value: expected {expected} but got {stored}")]
    IncorrectValue {
        /// The counter's record name.
        name: String,
        /// The value currently persisted.
        stored: f64,
        /// The value a from-scratch aggregate produces.
        expected: f64,
    },

    /// A row for this key already exists (uniqueness violation on insert).
    ///
    /// Raised by stores, caught by the engine's find-or-create retry, and
    /// never surfaced to callers.
    #[error("counter row for `{0}` already exists")]
    Conflict(crate::model::CounterKey),

    /// A post-change hook failed. Captured and logged by the engine, never
    /// propagated past the hook loop.
    #[error("counter hook failed: {0}")]
    Hook(String),

    /// The persistence collaborator failed.
    #[error("store error: {0}")]
    Store(String),
}

/// Result type for counter engine operations.
pub type Result<T> = std::result::Result<T, CounterError>;
