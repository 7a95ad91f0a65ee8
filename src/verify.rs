//! Drift detection and repair.
//!
//! Incrementally maintained aggregates drift when lifecycle events are lost
//! or filters change between deployments. The verifier compares stored values
//! against freshly recomputed true values:
//!
//! - [`Counters::is_correct`] - compare without writing;
//! - [`Counters::correct`] - compare and overwrite on mismatch;
//! - [`Counters::sample_and_verify`] - a maintenance sweep drawing random
//!   rows and applying an [`OnError`] policy per mismatch.
//!
//! Global counters have no source aggregate to compare against and are
//! vacuously correct; the same goes for manual counters. Sampling also skips
//! calculated counters, whose values are definitionally derived.

use rand::Rng;
use std::sync::Arc;

use crate::engine::Counters;
use crate::error::{CounterError, Result};
use crate::model::{CounterKey, CounterValue};

/// What to do when a sampled counter turns out to be incorrect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnError {
    /// Abort the sweep with [`CounterError::IncorrectValue`].
    Raise,
    /// Log the mismatch and keep sweeping.
    Log,
    /// Overwrite the stored value with the true one and keep sweeping.
    Correct,
}

/// Options for [`Counters::sample_and_verify`].
#[derive(Clone)]
pub struct SampleOptions {
    /// How many random draws to attempt.
    pub samples: usize,
    /// Mismatch policy.
    pub on_error: OnError,
    /// Restricts which rows are eligible, e.g. to one counter name.
    pub scope: Option<Arc<dyn Fn(&CounterValue) -> bool + Send + Sync>>,
}

impl Default for SampleOptions {
    fn default() -> Self {
        SampleOptions {
            samples: 1000,
            on_error: OnError::Raise,
            scope: None,
        }
    }
}

impl Counters {
    /// Does the stored value match a freshly recomputed true value?
    ///
    /// Counters with nothing to recompute from (global, manual, calculated
    /// with missing dependencies) are vacuously correct.
    pub fn is_correct(&self, key: &CounterKey) -> Result<bool> {
        let definition = self.registry.resolve_key(key)?;
        if definition.is_global() {
            return Ok(true);
        }
        match self.true_value(key)? {
            Some(expected) => Ok(self.value(key)? == expected),
            None => Ok(true),
        }
    }

    /// Verifies the counter and overwrites the stored value on mismatch.
    ///
    /// Returns `true` when the value was already correct, `false` when a
    /// correction was applied. The true value is recomputed while the row
    /// lock is held, so a concurrent locked write cannot land between the
    /// aggregate query and the overwrite and be erased. Corrections go
    /// through the usual locked write, so hooks and dependency propagation
    /// fire.
    pub fn correct(&self, key: &CounterKey) -> Result<bool> {
        let definition = self.registry.resolve_key(key)?;
        if definition.is_global() || definition.is_manual() {
            return Ok(true);
        }

        let row = self.find_or_create(key)?;
        let mut was_correct = true;
        {
            let was_correct = &mut was_correct;
            self.write_value(&definition, row.id, |current| {
                match self.true_value(key)? {
                    Some(expected) if expected != current => {
                        *was_correct = false;
                        Ok(expected)
                    }
                    _ => Ok(current),
                }
            })?;
        }
        Ok(was_correct)
    }

    /// Maintenance sweep: draws up to `samples` random existing rows and
    /// verifies each, applying the configured policy per mismatch.
    ///
    /// Rows are drawn by random id range, so the sweep never scans the whole
    /// table. Global and calculated counters are skipped (unverifiable and
    /// definitionally derived, respectively), as are rows rejected by the
    /// scope. Returns the number of incorrect counters found.
    pub fn sample_and_verify(&self, options: &SampleOptions) -> Result<usize> {
        let Some((min_id, max_id)) = self.store.id_bounds()? else {
            return Ok(0);
        };

        let mut rng = rand::thread_rng();
        let mut incorrect = 0;

        for _ in 0..options.samples {
            let random_id = rng.gen_range(min_id..=max_id);
            let Some(row) = self.store.first_at_or_after(random_id)? else {
                continue;
            };
            if options.scope.as_ref().is_some_and(|accept| !accept(&row)) {
                continue;
            }
            let Ok(definition) = self.registry.resolve_key(&row.key) else {
                log::warn!("row `{}` has no registered definition; skipping", row.key);
                continue;
            };
            if definition.is_global() || definition.is_calculated() {
                log::debug!("skipping unverifiable counter `{}`", row.key);
                continue;
            }
            if self.is_correct(&row.key)? {
                continue;
            }

            incorrect += 1;
            let expected = self.true_value(&row.key)?.unwrap_or(row.value);
            match options.on_error {
                OnError::Raise => {
                    return Err(CounterError::IncorrectValue {
                        name: row.key.to_string(),
                        stored: row.value,
                        expected,
                    });
                }
                OnError::Log => {
                    log::error!(
                        "counter `{}` has incorrect value: expected {expected} but got {}",
                        row.key,
                        row.value
                    );
                }
                OnError::Correct => {
                    self.correct(&row.key)?;
                }
            }
        }
        Ok(incorrect)
    }
}
