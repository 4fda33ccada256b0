//! Coop Core - Fundamental types and primitives
//!
//! This crate defines the core types shared by every coop crate:
//! - Identifiers (PeerId, CoopUri, CoopNaming)
//! - Time primitives (HttpTime, LogicalStamp, LogicalClock)
//! - Event payloads exchanged between coop nodes
//! - Wire documents served at the well-known resources
//! - Response bodies and the error taxonomy

pub mod body;
pub mod error;
pub mod event;
pub mod id;
pub mod message;
pub mod time;

pub use body::*;
pub use error::*;
pub use event::*;
pub use id::*;
pub use message::*;
pub use time::*;
