//! Coop Runtime - a running coop node
//!
//! This crate provides:
//! - `Coop`, the discovery orchestrator and public node surface
//! - `Watchers`, the per-node event bus
//! - `CoopConfig` and `init_tracing`

pub mod config;
pub mod coop;
pub mod telemetry;
pub mod watchers;

pub use config::*;
pub use coop::*;
pub use telemetry::*;
pub use watchers::*;
