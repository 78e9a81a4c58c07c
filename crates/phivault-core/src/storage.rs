use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;

use crate::error::{Result, VaultError};

/// Contract for encrypted-at-rest blob storage keyed by opaque identifiers.
///
/// Implementations encrypt on the way in and decrypt on the way out; callers only
/// ever see plaintext in memory.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Encrypt `plaintext` and atomically replace whatever is stored under `id`.
    async fn save_encrypted(&self, id: &str, plaintext: &[u8]) -> Result<()>;

    /// Read and decrypt the blob stored under `id`.
    async fn load_encrypted(&self, id: &str) -> Result<Vec<u8>>;

    /// Remove the blob. Returns whether anything was there (idempotent).
    async fn delete_encrypted(&self, id: &str) -> Result<bool>;

    /// Ids of committed blobs, oldest first.
    async fn list_ids(&self) -> Result<Vec<String>>;
}

/// In-memory store that masks bytes for tests and smoke runs.
/// Not cryptographically secure; production uses the AES-GCM file store.
#[derive(Debug, Default, Clone)]
pub struct InMemoryBlobStore {
    inner: Arc<Mutex<MemoryBlobs>>,
}

#[derive(Debug, Default)]
struct MemoryBlobs {
    blobs: HashMap<String, (u64, Vec<u8>)>,
    next_seq: u64,
    fail_writes: bool,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every save and delete fail with `IoFailure`, as a full disk would.
    pub fn fail_writes(&self, fail: bool) {
        self.blobs().fail_writes = fail;
    }

    pub fn len(&self) -> usize {
        self.blobs().blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn blobs(&self) -> MutexGuard<'_, MemoryBlobs> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn save_encrypted(&self, id: &str, plaintext: &[u8]) -> Result<()> {
        let mut state = self.blobs();
        if state.fail_writes {
            return Err(VaultError::io("simulated write failure"));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.blobs.insert(id.to_string(), (seq, mask(plaintext)));
        Ok(())
    }

    async fn load_encrypted(&self, id: &str) -> Result<Vec<u8>> {
        self.blobs()
            .blobs
            .get(id)
            .map(|(_, masked)| mask(masked))
            .ok_or_else(|| VaultError::not_found(id))
    }

    async fn delete_encrypted(&self, id: &str) -> Result<bool> {
        let mut state = self.blobs();
        if state.fail_writes {
            return Err(VaultError::io("simulated write failure"));
        }
        Ok(state.blobs.remove(id).is_some())
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let state = self.blobs();
        let mut ids: Vec<(u64, String)> = state
            .blobs
            .iter()
            .map(|(id, (seq, _))| (*seq, id.clone()))
            .collect();
        ids.sort();
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }
}

const MASK_BYTE: u8 = 0xA5;

/// XOR twice restores the original.
fn mask(input: &[u8]) -> Vec<u8> {
    input.iter().map(|b| b ^ MASK_BYTE).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_masks_and_unmasks() {
        let store = InMemoryBlobStore::new();
        store
            .save_encrypted("rec", b"top-secret-payload")
            .await
            .expect("save");
        assert_eq!(
            store.load_encrypted("rec").await.expect("load"),
            b"top-secret-payload"
        );

        let inner = store.blobs();
        assert_ne!(inner.blobs["rec"].1, b"top-secret-payload".to_vec());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = InMemoryBlobStore::new();
        store.save_encrypted("k", b"v").await.expect("save");
        assert!(store.delete_encrypted("k").await.expect("delete"));
        assert!(!store.delete_encrypted("k").await.expect("delete again"));
        assert_eq!(
            store.load_encrypted("k").await.unwrap_err(),
            VaultError::not_found("k")
        );
    }

    #[tokio::test]
    async fn lists_in_write_order_and_simulates_failure() {
        let store = InMemoryBlobStore::new();
        for id in ["b", "a", "c"] {
            store.save_encrypted(id, b"x").await.expect("save");
        }
        assert_eq!(store.list_ids().await.expect("list"), vec!["b", "a", "c"]);

        store.fail_writes(true);
        assert!(store.save_encrypted("d", b"x").await.is_err());
        assert!(store.delete_encrypted("a").await.is_err());
        assert_eq!(store.len(), 3);
    }
}
