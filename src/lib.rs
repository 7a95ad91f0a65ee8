//! # Conteggio - Denormalized Aggregate Counter Maintenance
//!
//! A Rust library that keeps **denormalized aggregate counters** (counts,
//! sums, derived values) attached to arbitrary parent entities consistent
//! with an underlying set of countable records, despite concurrent mutation,
//! without a full table scan on every read.
//!
//! ## The Problem
//!
//! "How many products does this user have?" is cheap to ask once and
//! expensive to ask on every page load. The standard fix is a denormalized
//! counter column - and the standard failure mode is that counter drifting
//! out of sync: a missed callback here, a race there, and the number on the
//! dashboard stops being true.
//!
//! ## The Solution
//!
//! This library treats counter maintenance as an engineering problem of its
//! own, with two write paths and two repair paths around a single data model:
//!
//! 1. **Synchronous increments** - lifecycle events move the counter under a
//!    per-row exclusive lock. Correct, simple, and the right choice for most
//!    aggregates.
//! 2. **Change log + reconciliation** - for hot aggregates where locking on
//!    every event would be a bottleneck, deltas are appended lock-free to a
//!    durable log and folded in batches, idempotently, under one lock
//!    acquisition.
//! 3. **Recalculation** - any relation-backed counter can be rebuilt from
//!    scratch with a COUNT/SUM over its source of truth, installed without
//!    losing concurrent deltas.
//! 4. **Verification** - a sampling sweep compares stored values against
//!    recomputed ones and reports or heals drift.
//!
//! On top of that sit **conditional filters** (count only items matching a
//! predicate, with state-transition tests for updates), **calculated
//! counters** (pure functions of other counters, kept current by push
//! propagation), and **post-change hooks**.
//!
//! ## Architecture
//!
//! ```text
//!  lifecycle event ──► filter evaluator ──► { increment engine │ change log }
//!                                                   │               │
//!                                                   ▼               ▼ reconcile
//!                                           ┌───────────────────────────┐
//!                                           │  CounterValue (one row,   │
//!                                           │  one lock, per aggregate) │
//!                                           └───────────────────────────┘
//!                                                   │
//!                                 hooks ◄───────────┼───────────► dependent
//!                                                   │             counters
//!                                 recalc / verifier cross-check
//! ```
//!
//! The engine is written against two narrow storage traits
//! ([`store::CounterStore`], [`store::ChangeStore`]) plus a
//! [`scheduler::Scheduler`] seam for background work, so it binds to
//! whatever relational store and job substrate the application already has.
//! An in-memory reference implementation ships in [`store::memory`].
//!
//! ## Quick Start
//!
//! ```rust
//! # fn main() -> conteggio::error::Result<()> {
//! use std::sync::Arc;
//!
//! use conteggio::definition::{CounterDefinition, Relation};
//! use conteggio::engine::Counters;
//! use conteggio::model::{CounterKey, ParentRef, Record};
//! use conteggio::registry::Registry;
//! use conteggio::scheduler::QueueScheduler;
//! use conteggio::store::memory::{MemoryChangeStore, MemoryStore};
//!
//! // Declare counters once, at startup.
//! let registry = Registry::builder()
//!     .counter(
//!         CounterDefinition::new("products")
//!             .with_parent("user")
//!             .counting(Relation::new("products", "product").with_inverse("user")),
//!     )
//!     .build()?;
//!
//! let counters = Counters::new(
//!     Arc::new(registry),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(MemoryChangeStore::new()),
//!     Arc::new(QueueScheduler::new()),
//! );
//!
//! // Feed lifecycle events from the domain.
//! let user = ParentRef::new("user", 1);
//! let product = Record::new("product", 1)
//!     .with_parent(user)
//!     .with_field("price", 100);
//! counters.add_item(&product)?;
//!
//! assert_eq!(counters.value(&CounterKey::parented(user, "products"))?, 1.0);
//! # Ok(())
//! # }
//! ```
//!
//! ## Counter Classifications
//!
//! | Classification | Source of truth | Moved by |
//! |----------------|-----------------|----------|
//! | Relation-backed | COUNT/SUM over a live relation | lifecycle events, recalc |
//! | Calculated | a pure function of other counters | dependency propagation |
//! | Manual | none | explicit increment/decrement/reset |
//!
//! Exactly one classification applies to each definition; `recalc` branches
//! on it, and manual counters refuse recalculation outright.
//!
//! ## Concurrency Model
//!
//! The unit of mutual exclusion is a single counter row. Every
//! read-modify-write sequence - synchronous increment, reconcile batch,
//! recalculation, reset, correction - takes that row's exclusive lock;
//! different counters never contend with each other. Change-log appends
//! never take the lock at all, which is what makes the asynchronous path
//! suitable for hot aggregates. Brief lock waits on one hot counter are the
//! intended signal to move it to the change-log path.
//!
//! ## Feature Flags
//!
//! | Feature | Description |
//! |---------|-------------|
//! | `serde` | `Serialize` on the persisted record types |
//! | `json` | `serde_json` support (implies `serde`) |

pub mod changes;
pub mod definition;
pub mod engine;
pub mod error;
pub mod filters;
pub mod model;
pub mod recalc;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod verify;
