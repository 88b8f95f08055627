//! Infrastructure layer for Parley.
//!
//! Contains implementations of the ports defined in `parley-core`: SQLite
//! storage for definitions and executions, `config.toml` loading, and the
//! built-in action handlers.

pub mod action;
pub mod config;
pub mod sqlite;
