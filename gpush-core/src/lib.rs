//! gpush-core — change tracking and series reconstruction for Gerrit
//! push/pull tooling.
//!
//! The engine maintains a persistent mapping between local commits
//! (identified by `Change-Id:` trailers) and server-side review Changes,
//! across repeated, interrupted and rebased work sessions. Three
//! partially stale sources of truth — the local commit graph, the
//! persisted state ledger, and the review server — are reconciled into
//! one consistent view, idempotently: re-running any flow with nothing
//! changed mutates nothing and writes nothing.
//!
//! Entry points: [`context::Context`] owns all per-repository state;
//! [`resolve::resolve_branch`] maps commits to Changes;
//! [`series::assemble`] reconstructs pushable stacks;
//! [`gc::run_gc`] prunes stale records and cache refs.

pub mod config;
pub mod context;
pub mod error;
pub mod gc;
pub mod gerrit;
pub mod graph;
pub mod ledger;
pub mod process;
pub mod registry;
pub mod report;
pub mod resolve;
pub mod series;
pub mod track;
pub mod types;

pub use error::{Error, Result};
