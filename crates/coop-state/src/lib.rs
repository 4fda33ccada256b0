//! Coop State - the four per-node stores
//!
//! - `KeyRegistry` / `KeyFetcher`: local topics and conditional reads of
//!   peers' topics
//! - `LinkStore`: this node's own annotations
//! - `MergedList`: last-writer-wins view over every followed source
//! - `Followings`: who is followed, derived from key intersection
//!
//! None of these types lock or spawn; the runtime owns them behind one
//! per-node mutex.

pub mod followings;
pub mod keys;
pub mod links;
pub mod list;

pub use followings::*;
pub use keys::*;
pub use links::*;
pub use list::*;
