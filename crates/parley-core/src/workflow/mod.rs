//! Conversational workflow interpreter.
//!
//! - `definition` -- YAML parsing, structural validation, lint, filesystem load/save
//! - `variables` -- template interpolation and condition evaluation
//! - `action` -- injected action handler registry
//! - `steps` -- one executor per step kind
//! - `executor` -- the per-turn auto-execution loop
//! - `engine` -- turn driver wiring repository, executor, and config
//! - `error` -- workflow error types

pub mod action;
pub mod definition;
pub mod engine;
pub mod error;
pub mod executor;
pub mod steps;
pub mod variables;
