//! fleetgrid-state — embedded local state for a fleetgrid node.
//!
//! Backed by [redb](https://docs.rs/redb), holds the material a node
//! needs across restarts while it forms or joins a cluster:
//!
//! - raw blobs (PEM certificates and keys) keyed by name,
//! - the set of peer certificates this node trusts,
//! - a ledger of join tokens this node has already redeemed.
//!
//! Structured records are JSON-serialized into redb's `&[u8]` value
//! columns. The `StateStore` is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`) and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
