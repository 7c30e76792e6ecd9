//! Public facade crate for `wiseflow`.
//!
//! This crate intentionally contains no IO or provider-specific logic.
//! It re-exports the backend-agnostic types/traits from `wiseflow-core`.

pub use wiseflow_core::*;
