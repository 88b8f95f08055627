//! Built-in action handlers.

pub mod builtin;
