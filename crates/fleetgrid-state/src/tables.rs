//! redb table definitions for the fleetgrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values. Blobs are stored
//! verbatim; peers and redemptions are JSON-serialized records.

use redb::TableDefinition;

/// Opaque blobs (certificates, keys) keyed by file-like name, e.g. `server.crt`.
pub const BLOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");

/// Trusted peer certificates keyed by lowercase hex SHA-256 fingerprint.
pub const TRUSTED_PEERS: TableDefinition<&str, &[u8]> = TableDefinition::new("trusted_peers");

/// Redeemed join tokens keyed by lowercase hex SHA-256 of the token secret.
pub const REDEEMED_TOKENS: TableDefinition<&str, &[u8]> = TableDefinition::new("redeemed_tokens");
