//! Encrypted map from record id to its display descriptor.
//!
//! The whole map is one JSON document sealed as a single blob; every mutation
//! rewrites it through the owning store's atomic replace.

use std::collections::BTreeMap;

use phivault_core::{
    records::{fallback_display_name, BlobId, FileMetadata},
    storage::BlobStore,
    Result, VaultError,
};
use tracing::{debug, instrument};

pub const INDEX_DOCUMENT_ID: &str = "metadata-index";

pub type IndexMap = BTreeMap<BlobId, FileMetadata>;

pub struct MetadataIndex<S> {
    store: S,
}

impl<S: BlobStore> MetadataIndex<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Absent document reads as an empty index.
    pub async fn load(&self) -> Result<IndexMap> {
        match self.store.load_encrypted(INDEX_DOCUMENT_ID).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| VaultError::format(format!("metadata index: {e}"))),
            Err(VaultError::NotFound { .. }) => Ok(IndexMap::new()),
            Err(err) => Err(err),
        }
    }

    #[instrument(skip_all, fields(id = %id))]
    pub async fn upsert(&self, id: BlobId, metadata: FileMetadata) -> Result<()> {
        let mut map = self.load().await?;
        map.insert(id, metadata);
        self.persist(&map).await?;
        debug!(entries = map.len(), "index entry written");
        Ok(())
    }

    /// Returns whether an entry was present. Absent entries leave the document untouched.
    #[instrument(skip_all, fields(id = %id))]
    pub async fn remove(&self, id: &BlobId) -> Result<bool> {
        let mut map = self.load().await?;
        if map.remove(id).is_none() {
            return Ok(false);
        }
        self.persist(&map).await?;
        Ok(true)
    }

    pub async fn lookup(&self, id: &BlobId) -> Result<Option<FileMetadata>> {
        Ok(self.load().await?.remove(id))
    }

    pub async fn display_name_for(&self, id: &BlobId) -> Result<String> {
        Ok(self
            .lookup(id)
            .await?
            .map(|m| m.rendered_display_name)
            .unwrap_or_else(|| fallback_display_name(id)))
    }

    async fn persist(&self, map: &IndexMap) -> Result<()> {
        let json = serde_json::to_vec(map)
            .map_err(|e| VaultError::io(format!("index serialize: {e}")))?;
        self.store.save_encrypted(INDEX_DOCUMENT_ID, &json).await
    }
}
