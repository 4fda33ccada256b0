//! Coop Transport Layer - what a coop node needs from its peer transport
//!
//! This crate provides:
//! - The `Transport` seam (fetch by peer-addressed URI, inbound request
//!   handlers, event-source subscriptions)
//! - `FetchEvent`, the exactly-once inbound request contract
//! - A short-TTL conditional-fetch response cache
//! - `EventLog`, the resumable body of a node's `event` resource

pub mod cache;
pub mod event_log;
pub mod transport;

pub use cache::*;
pub use event_log::*;
pub use transport::*;
