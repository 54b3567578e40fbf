//! Agent execution modules.
//!
//! This module provides the execution harness, the handler registry and the
//! built-in handlers for the five analysis agents.

pub mod handlers;
pub mod harness;
pub mod registry;

pub use registry::AgentRegistry;
