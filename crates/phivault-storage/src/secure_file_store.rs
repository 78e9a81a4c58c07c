use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use phivault_core::{storage::BlobStore, Result, VaultError};
use tempfile::NamedTempFile;
use tracing::{debug, instrument, warn};

use crate::key_custodian::KeyCustodian;

const BLOB_EXTENSION: &str = "enc";
const TEMP_PREFIX: &str = ".tmp";

/// Directory of encrypted blobs, one file per id, sealed with the custodian's master key.
///
/// Files are named `<base64url(id)>.enc`; the bytes on disk are always a complete
/// envelope because every write goes through a sibling temp file and an atomic rename.
pub struct EncryptedFileStore {
    root: PathBuf,
    custodian: Arc<KeyCustodian>,
}

impl EncryptedFileStore {
    pub fn new(root: impl Into<PathBuf>, custodian: Arc<KeyCustodian>) -> Self {
        Self {
            root: root.into(),
            custodian,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.root
            .join(format!("{}.{BLOB_EXTENSION}", sanitize_id(id)))
    }

    /// Remove temp files left behind by a write that never reached its rename.
    pub fn sweep_stale_temp_files(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(TEMP_PREFIX) {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        if removed > 0 {
            warn!(removed, root = %self.root.display(), "removed stale temp files");
        }
        Ok(removed)
    }
}

#[async_trait]
impl BlobStore for EncryptedFileStore {
    #[instrument(skip_all, fields(id))]
    async fn save_encrypted(&self, id: &str, plaintext: &[u8]) -> Result<()> {
        let key = self.custodian.current_key()?;
        let envelope = key.seal(plaintext).await?;
        write_blob(&self.path_for(id), envelope.as_bytes())?;
        debug!(bytes = envelope.as_bytes().len(), "blob committed");
        Ok(())
    }

    #[instrument(skip_all, fields(id))]
    async fn load_encrypted(&self, id: &str) -> Result<Vec<u8>> {
        let key = self.custodian.current_key()?;
        let envelope = read_blob(&self.path_for(id), id)?;
        key.open(&envelope).await
    }

    #[instrument(skip_all, fields(id))]
    async fn delete_encrypted(&self, id: &str) -> Result<bool> {
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut found: Vec<(SystemTime, String)> = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(id) = id_from_path(&path) else {
                continue;
            };
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((modified, id));
        }
        found.sort();
        Ok(found.into_iter().map(|(_, id)| id).collect())
    }
}

fn write_blob(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| VaultError::io("invalid storage path"))?;
    fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| VaultError::io(e.error))?;
    Ok(())
}

fn read_blob(path: &Path, id: &str) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            VaultError::not_found(id)
        } else {
            VaultError::io(err)
        }
    })?;

    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

fn sanitize_id(id: &str) -> String {
    URL_SAFE_NO_PAD.encode(id)
}

fn id_from_path(path: &Path) -> Option<String> {
    if path.extension()?.to_str()? != BLOB_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let raw = URL_SAFE_NO_PAD.decode(stem).ok()?;
    String::from_utf8(raw).ok()
}
