//! Core logic: types, tokens, parsing, graph resolution, planning, execution.

pub mod executor;
pub mod parser;
pub mod planner;
pub mod resolver;
pub mod state;
pub mod token;
pub mod types;
