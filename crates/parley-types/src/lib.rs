//! Shared domain types for Parley.
//!
//! This crate contains the types shared by every layer of the engine: the
//! workflow definition model, the durable execution record, step results,
//! engine configuration, and repository errors.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod workflow;
