//! `wiseflow-mcp` crate (library surface).
//!
//! The primary entrypoint for end users is the `wiseflow` binary (CLI + MCP stdio).
//! This library module lets embedders reach the core types and the local
//! preprocessing/LLM implementations without depending on internal crate layout.

pub use wiseflow_core as core;
pub use wiseflow_local as local;
