//! StateStore — redb-backed persistence for a fleetgrid node.
//!
//! Provides a raw blob table plus typed operations over trusted peers
//! and the redeemed-token ledger. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(BLOBS).map_err(map_err!(Table))?;
        txn.open_table(TRUSTED_PEERS).map_err(map_err!(Table))?;
        txn.open_table(REDEEMED_TOKENS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Blobs ──────────────────────────────────────────────────────

    /// Insert or replace a named blob.
    pub fn put_blob(&self, name: &str, data: &[u8]) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(BLOBS).map_err(map_err!(Table))?;
            table.insert(name, data).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%name, bytes = data.len(), "blob stored");
        Ok(())
    }

    /// Get a named blob.
    pub fn get_blob(&self, name: &str) -> StateResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BLOBS).map_err(map_err!(Table))?;
        let blob = table
            .get(name)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_vec());
        Ok(blob)
    }

    /// Delete a named blob. Returns true if it existed.
    pub fn delete_blob(&self, name: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(BLOBS).map_err(map_err!(Table))?;
            existed = table.remove(name).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%name, existed, "blob deleted");
        Ok(existed)
    }

    // ── Trusted peers ──────────────────────────────────────────────

    /// Insert a trusted peer unless one with the same fingerprint exists.
    ///
    /// Returns `false` (and leaves the stored record untouched) when the
    /// fingerprint is already trusted.
    pub fn insert_trusted_peer(&self, peer: &TrustedPeer) -> StateResult<bool> {
        let value = serde_json::to_vec(peer).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let inserted;
        {
            let mut table = txn.open_table(TRUSTED_PEERS).map_err(map_err!(Table))?;
            let exists = table
                .get(peer.fingerprint.as_str())
                .map_err(map_err!(Read))?
                .is_some();
            if !exists {
                table
                    .insert(peer.fingerprint.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            inserted = !exists;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(fingerprint = %peer.fingerprint, name = %peer.name, inserted, "trusted peer stored");
        Ok(inserted)
    }

    /// Get a trusted peer by fingerprint.
    pub fn get_trusted_peer(&self, fingerprint: &str) -> StateResult<Option<TrustedPeer>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TRUSTED_PEERS).map_err(map_err!(Table))?;
        match table.get(fingerprint).map_err(map_err!(Read))? {
            Some(guard) => {
                let peer: TrustedPeer =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(peer))
            }
            None => Ok(None),
        }
    }

    /// List all trusted peers.
    pub fn list_trusted_peers(&self) -> StateResult<Vec<TrustedPeer>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TRUSTED_PEERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let peer: TrustedPeer =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(peer);
        }
        Ok(results)
    }

    /// Delete a trusted peer by fingerprint. Returns true if it existed.
    pub fn delete_trusted_peer(&self, fingerprint: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(TRUSTED_PEERS).map_err(map_err!(Table))?;
            existed = table.remove(fingerprint).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%fingerprint, existed, "trusted peer deleted");
        Ok(existed)
    }

    // ── Redeemed tokens ────────────────────────────────────────────

    /// Record a token redemption.
    ///
    /// Check and insert happen in one write transaction. Returns `false`
    /// when the digest was already recorded.
    pub fn record_redemption(&self, entry: &RedeemedToken) -> StateResult<bool> {
        let value = serde_json::to_vec(entry).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let recorded;
        {
            let mut table = txn.open_table(REDEEMED_TOKENS).map_err(map_err!(Table))?;
            let exists = table
                .get(entry.digest.as_str())
                .map_err(map_err!(Read))?
                .is_some();
            if !exists {
                table
                    .insert(entry.digest.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            recorded = !exists;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(server_name = %entry.server_name, recorded, "token redemption recorded");
        Ok(recorded)
    }

    /// Look up a redemption by secret digest.
    pub fn get_redemption(&self, digest: &str) -> StateResult<Option<RedeemedToken>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REDEEMED_TOKENS).map_err(map_err!(Table))?;
        match table.get(digest).map_err(map_err!(Read))? {
            Some(guard) => {
                let entry: RedeemedToken =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// List every recorded redemption.
    pub fn list_redemptions(&self) -> StateResult<Vec<RedeemedToken>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REDEEMED_TOKENS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let redeemed: RedeemedToken =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(redeemed);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peer(fingerprint: &str, name: &str) -> TrustedPeer {
        TrustedPeer {
            fingerprint: fingerprint.to_string(),
            name: name.to_string(),
            address: "10.0.0.1:8443".to_string(),
            certificate: "-----BEGIN CERTIFICATE-----\n...\n-----END CERTIFICATE-----\n"
                .to_string(),
            added_at: 1000,
        }
    }

    fn test_redemption(digest: &str) -> RedeemedToken {
        RedeemedToken {
            digest: digest.to_string(),
            server_name: "node2".to_string(),
            cluster_address: "10.0.0.1:8443".to_string(),
            redeemed_at: 1000,
        }
    }

    // ── Blobs ──────────────────────────────────────────────────────

    #[test]
    fn blob_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_blob(blob::SERVER_CERT, b"cert-bytes").unwrap();

        let back = store.get_blob(blob::SERVER_CERT).unwrap().unwrap();
        assert_eq!(back, b"cert-bytes");
    }

    #[test]
    fn blob_get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_blob("missing").unwrap().is_none());
    }

    #[test]
    fn blob_overwrite_replaces_value() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_blob(blob::SERVER_KEY, b"old").unwrap();
        store.put_blob(blob::SERVER_KEY, b"new").unwrap();
        assert_eq!(store.get_blob(blob::SERVER_KEY).unwrap().unwrap(), b"new");
    }

    #[test]
    fn blob_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_blob("x", b"1").unwrap();
        assert!(store.delete_blob("x").unwrap());
        assert!(!store.delete_blob("x").unwrap());
        assert!(store.get_blob("x").unwrap().is_none());
    }

    // ── Trusted peers ──────────────────────────────────────────────

    #[test]
    fn trusted_peer_insert_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.insert_trusted_peer(&test_peer("aa", "node1")).unwrap());

        let peer = store.get_trusted_peer("aa").unwrap().unwrap();
        assert_eq!(peer.name, "node1");
        assert_eq!(peer.address, "10.0.0.1:8443");
    }

    #[test]
    fn trusted_peer_duplicate_keeps_original() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.insert_trusted_peer(&test_peer("aa", "node1")).unwrap());
        assert!(!store.insert_trusted_peer(&test_peer("aa", "renamed")).unwrap());

        let peer = store.get_trusted_peer("aa").unwrap().unwrap();
        assert_eq!(peer.name, "node1");
        assert_eq!(store.list_trusted_peers().unwrap().len(), 1);
    }

    #[test]
    fn trusted_peer_list_and_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.insert_trusted_peer(&test_peer("aa", "node1")).unwrap();
        store.insert_trusted_peer(&test_peer("bb", "node2")).unwrap();
        assert_eq!(store.list_trusted_peers().unwrap().len(), 2);

        assert!(store.delete_trusted_peer("aa").unwrap());
        let remaining = store.list_trusted_peers().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].fingerprint, "bb");
    }

    // ── Redeemed tokens ────────────────────────────────────────────

    #[test]
    fn redemption_recorded_once() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.record_redemption(&test_redemption("d1")).unwrap());
        assert!(!store.record_redemption(&test_redemption("d1")).unwrap());
        assert_eq!(store.list_redemptions().unwrap().len(), 1);
    }

    #[test]
    fn redemption_lookup() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_redemption("d1").unwrap().is_none());
        store.record_redemption(&test_redemption("d1")).unwrap();

        let entry = store.get_redemption("d1").unwrap().unwrap();
        assert_eq!(entry.server_name, "node2");
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_blob(blob::SERVER_CERT, b"pem").unwrap();
            store.record_redemption(&test_redemption("d1")).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.get_blob(blob::SERVER_CERT).unwrap().unwrap(), b"pem");
        assert!(!store.record_redemption(&test_redemption("d1")).unwrap());
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_trusted_peers().unwrap().is_empty());
        assert!(store.list_redemptions().unwrap().is_empty());
        assert!(!store.delete_trusted_peer("nope").unwrap());
    }
}
