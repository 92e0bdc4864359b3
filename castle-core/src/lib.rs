//! Core abstractions of the castle storage orchestrator.
//!
//! This crate holds the pieces shared by the node daemon and the CLI: the typed error kinds,
//! the key/value store contract along with its backends, the key layout of the control plane
//! and the node inventory model.

mod error;
pub mod inventory;
pub mod keys;
#[cfg(test)]
mod keys_test;
pub mod kvs;

pub use error::{AppError, ShutdownError, ShutdownResult};
