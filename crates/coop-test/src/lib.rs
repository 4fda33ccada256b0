//! Coop Test Harness - multi-node discovery scenarios
//!
//! This crate provides:
//! - An in-memory peer network with optional seeded latency jitter
//! - A cluster harness that starts coop nodes on that network
//! - End-to-end discovery and replication scenarios

pub mod integration;
pub mod network;

pub use integration::*;
pub use network::*;
