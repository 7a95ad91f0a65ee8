//! Immutable counter definition registry.
//!
//! The registry is the "define once, reference everywhere" surface: built at
//! startup from every [`CounterDefinition`] the domain declares, validated,
//! then shared by `Arc` with every component that resolves definitions. There
//! is no global mutable state; integrators construct one registry and inject
//! it into the engine.
//!
//! Resolution is ancestor-aware: a parent kind may declare (via
//! [`RegistryBuilder::kind_extends`]) which kind it extends, and lookup walks
//! that chain so subtypes inherit counters declared on an ancestor. Global
//! definitions live in a separate list keyed by name alone.
//!
//! Build-time validation rejects duplicate record names within a parent kind
//! (different kinds may each declare their own `"products"`) and
//! relation-backed, parented definitions whose relation declares no inverse
//! reference (without one, lifecycle events cannot locate the aggregate to
//! update).

use std::collections::HashMap;
use std::sync::Arc;

use crate::definition::CounterDefinition;
use crate::error::{CounterError, Result};
use crate::model::{Countable, CounterKey};

/// Immutable registry of counter definitions.
#[derive(Debug)]
pub struct Registry {
    by_parent: HashMap<&'static str, Vec<Arc<CounterDefinition>>>,
    globals: Vec<Arc<CounterDefinition>>,
    extends: HashMap<&'static str, &'static str>,
    dependents: HashMap<(Option<&'static str>, String), Vec<Arc<CounterDefinition>>>,
}

impl Registry {
    /// Starts building a registry.
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Every definition visible on `parent_kind`, own first, then inherited
    /// by walking the declared ancestor chain.
    pub fn definitions_for(&self, parent_kind: &str) -> Vec<Arc<CounterDefinition>> {
        let mut definitions = Vec::new();
        let mut visited: Vec<&str> = Vec::new();
        let mut current = Some(parent_kind);
        while let Some(kind) = current {
            // A malformed chain (a kind extending itself) terminates here.
            if visited.contains(&kind) {
                break;
            }
            visited.push(kind);
            if let Some(own) = self.by_parent.get(kind) {
                definitions.extend(own.iter().cloned());
            }
            current = self.extends.get(kind).map(|ancestor| *ancestor as &str);
        }
        definitions
    }

    /// Resolves the single definition named `name` visible on `parent_kind`,
    /// walking the ancestor chain.
    pub fn resolve(&self, parent_kind: &str, name: &str) -> Result<Arc<CounterDefinition>> {
        self.definitions_for(parent_kind)
            .into_iter()
            .find(|def| def.name() == name)
            .ok_or_else(|| CounterError::UnknownCounter {
                name: name.to_string(),
                parent_kind: parent_kind.to_string(),
            })
    }

    /// Resolves a global definition by name.
    pub fn resolve_global(&self, name: &str) -> Result<Arc<CounterDefinition>> {
        self.globals
            .iter()
            .find(|def| def.name() == name)
            .cloned()
            .ok_or_else(|| CounterError::UnknownCounter {
                name: name.to_string(),
                parent_kind: "<global>".to_string(),
            })
    }

    /// Resolves the definition behind a counter key.
    pub fn resolve_key(&self, key: &CounterKey) -> Result<Arc<CounterDefinition>> {
        match &key.parent {
            Some(parent) => self.resolve(parent.kind, &key.name),
            None => self.resolve_global(&key.name),
        }
    }

    /// Every relation-backed definition that counts `item`, resolved through
    /// the item's parent kind and its ancestors.
    pub fn counting(&self, item: &dyn Countable) -> Vec<Arc<CounterDefinition>> {
        let Some(parent) = item.parent() else {
            return Vec::new();
        };
        self.definitions_for(parent.kind)
            .into_iter()
            .filter(|def| {
                def.accepts_items()
                    && def
                        .relation()
                        .is_some_and(|r| r.countable_kind == item.kind())
            })
            .collect()
    }

    /// The calculated definitions declared on `parent_kind` that depend on
    /// the counter named `name`.
    ///
    /// This is the inverted dependency index computed once at build time (the
    /// push side of dependency propagation), scoped per parent kind so a
    /// same-named counter on an unrelated kind never triggers propagation.
    /// Propagation is single-hop: chains cascade because each recalculation
    /// is itself a value change. Cycles are not detected and will recurse
    /// indefinitely.
    pub fn dependents_of(
        &self,
        parent_kind: Option<&'static str>,
        name: &str,
    ) -> &[Arc<CounterDefinition>] {
        self.dependents
            .get(&(parent_kind, name.to_string()))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All global definitions.
    pub fn globals(&self) -> &[Arc<CounterDefinition>] {
        &self.globals
    }
}

/// Builder assembling and validating a [`Registry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    definitions: Vec<Arc<CounterDefinition>>,
    extends: HashMap<&'static str, &'static str>,
}

impl RegistryBuilder {
    /// Adds a definition.
    pub fn counter(mut self, definition: CounterDefinition) -> Self {
        self.definitions.push(Arc::new(definition));
        self
    }

    /// Declares that parent kind `child` extends `ancestor`, so `child`
    /// inherits every counter declared on `ancestor`.
    pub fn kind_extends(mut self, child: &'static str, ancestor: &'static str) -> Self {
        self.extends.insert(child, ancestor);
        self
    }

    /// Validates and freezes the registry.
    ///
    /// # Errors
    ///
    /// [`CounterError::DuplicateDefinition`] when two definitions on the same
    /// parent kind share a record name; [`CounterError::MissingInverse`] when
    /// a parented, relation-backed definition has no inverse reference.
    pub fn build(self) -> Result<Registry> {
        let mut seen: Vec<(Option<&'static str>, &str)> = Vec::new();
        for def in &self.definitions {
            let slot = (def.parent_kind(), def.name());
            if seen.contains(&slot) {
                return Err(CounterError::DuplicateDefinition(def.name().to_string()));
            }
            seen.push(slot);

            if let (Some(_), Some(relation)) = (def.parent_kind(), def.relation()) {
                if relation.inverse.is_none() {
                    return Err(CounterError::MissingInverse(
                        def.name().to_string(),
                        relation.name.to_string(),
                    ));
                }
            }
        }

        let mut by_parent: HashMap<&'static str, Vec<Arc<CounterDefinition>>> = HashMap::new();
        let mut globals = Vec::new();
        let mut dependents: HashMap<(Option<&'static str>, String), Vec<Arc<CounterDefinition>>> =
            HashMap::new();

        for def in &self.definitions {
            match def.parent_kind() {
                Some(kind) => by_parent.entry(kind).or_default().push(def.clone()),
                None => globals.push(def.clone()),
            }
            for dependency in def.dependencies() {
                dependents
                    .entry((def.parent_kind(), dependency.clone()))
                    .or_default()
                    .push(def.clone());
            }
        }

        Ok(Registry {
            by_parent,
            globals,
            extends: self.extends,
            dependents,
        })
    }
}
