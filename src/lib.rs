//! Strata: declarative multi-stack infrastructure orchestration.
//!
//! Stacks of typed resources reference each other's attributes through
//! deferred tokens. Strata orders the graph, realizes nodes through a
//! pluggable provider, and keeps one locked state record per stack.

pub mod cli;
pub mod core;
pub mod error;
pub mod provenance;
pub mod provider;
pub mod resources;
