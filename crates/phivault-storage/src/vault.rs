use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use phivault_core::{
    audit::{AuditAction, AuditEntry},
    storage::BlobStore,
    Result,
};
use tracing::info;

use crate::{
    audit_ledger::AuditLedger, export, key_custodian::KeyCustodian,
    metadata_index::MetadataIndex, secure_file_store::EncryptedFileStore,
};

/// Directory layout under the data dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultLayout {
    root: PathBuf,
}

impl VaultLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn records_dir(&self) -> PathBuf {
        self.root.join("records")
    }

    pub fn captures_dir(&self) -> PathBuf {
        self.root.join("captures")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.root.join("audit")
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.root.join("exports")
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.root.join("keys")
    }

    pub fn create_all(&self) -> Result<()> {
        for dir in [
            self.records_dir(),
            self.captures_dir(),
            self.index_dir(),
            self.audit_dir(),
            self.exports_dir(),
            self.keys_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Everything the session layer persists through: record blobs, stashed raw
/// captures, the metadata index and the audit ledger.
pub struct Vault<S> {
    pub records: S,
    pub captures: S,
    pub index: MetadataIndex<S>,
    pub ledger: AuditLedger<S>,
}

impl<S: BlobStore> Vault<S> {
    pub fn new(records: S, captures: S, index_store: S, ledger_store: S) -> Self {
        Self {
            records,
            captures,
            index: MetadataIndex::new(index_store),
            ledger: AuditLedger::new(ledger_store),
        }
    }
}

impl Vault<EncryptedFileStore> {
    /// Create the layout, clear crash leftovers and build the four stores.
    pub async fn open(layout: &VaultLayout, custodian: Arc<KeyCustodian>) -> Result<Self> {
        layout.create_all()?;
        let store = |dir: PathBuf| EncryptedFileStore::new(dir, Arc::clone(&custodian));
        let vault = Vault::new(
            store(layout.records_dir()),
            store(layout.captures_dir()),
            store(layout.index_dir()),
            store(layout.audit_dir()),
        );

        let mut removed = 0;
        for s in [
            &vault.records,
            &vault.captures,
            vault.index.store(),
            vault.ledger.store(),
        ] {
            removed += s.sweep_stale_temp_files()?;
        }
        removed += export::sweep_exports(&layout.exports_dir())?;

        if removed > 0 {
            info!(removed, "cleaned up files left by an earlier session");
            vault
                .ledger
                .record(
                    AuditEntry::new(AuditAction::Cleanup, "vault")
                        .with_details(format!("removed {removed} stale files")),
                )
                .await;
        }
        Ok(vault)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;
    use crate::{key_custodian::UnlockProof, key_provider::InMemoryKeyBackend};

    #[tokio::test]
    async fn open_creates_layout_and_records_cleanup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = VaultLayout::new(dir.path());
        let custodian = Arc::new(KeyCustodian::new(Arc::new(InMemoryKeyBackend::default())));
        custodian.unlock(UnlockProof::Presence).await.expect("unlock");

        let vault = Vault::open(&layout, Arc::clone(&custodian))
            .await
            .expect("open");
        assert!(layout.records_dir().is_dir());
        assert!(layout.keys_dir().is_dir());
        assert!(vault.ledger.entries().await.expect("entries").is_empty());
        drop(vault);

        let mut orphan = NamedTempFile::new_in(layout.records_dir()).expect("temp");
        orphan.write_all(b"partial").expect("write");
        orphan.keep().expect("keep");
        fs::write(layout.exports_dir().join("audit-x.csv"), b"rows").expect("write");

        let vault = Vault::open(&layout, custodian).await.expect("reopen");
        let entries = vault.ledger.entries().await.expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::Cleanup);
        assert_eq!(entries[0].details, "removed 2 stale files");
    }
}
