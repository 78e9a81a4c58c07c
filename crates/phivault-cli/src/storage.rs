use std::{path::PathBuf, sync::Arc};

use color_eyre::Result;
use dirs::data_dir;
use phivault_session::SaveCoordinator;
use phivault_storage::{
    key_provider::{InMemoryKeyBackend, KeyringBackend},
    passphrase_backend::PassphraseFileBackend,
    EncryptedFileStore, KeyBackend, KeyCustodian, UnlockProof, Vault, VaultLayout,
};
use tracing::{debug, warn};

use crate::{
    config::{Config, KeyBackendKind},
    input,
};

/// Resolve the default data directory for phivault.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = data_dir().ok_or_else(|| color_eyre::eyre::eyre!("no data dir available"))?;
    Ok(base.join("phivault"))
}

pub fn layout_from_config(config: &Config) -> Result<VaultLayout> {
    let root = match &config.data_dir {
        Some(root) => root.clone(),
        None => default_data_dir()?,
    };
    debug!(?root, "resolved data directory");
    Ok(VaultLayout::new(root))
}

/// Backend chosen by `[security] key_backend`.
pub fn backend_from_config(config: &Config, layout: &VaultLayout) -> Arc<dyn KeyBackend> {
    match config.key_backend() {
        KeyBackendKind::Keyring => Arc::new(KeyringBackend::new(
            config.keyring_service(),
            config.key_alias(),
        )),
        KeyBackendKind::Passphrase => Arc::new(PassphraseFileBackend::new(layout.keys_dir())),
        KeyBackendKind::Memory => {
            warn!("memory key backend: records written now cannot be read by a later run");
            Arc::new(InMemoryKeyBackend::default())
        }
    }
}

pub fn custodian_from_config(config: &Config, backend: Arc<dyn KeyBackend>) -> KeyCustodian {
    KeyCustodian::new(backend)
        .with_alias(config.key_alias())
        .with_unlock_window(config.unlock_window())
}

/// Proof the configured backend expects. `provisioning` asks for a new passphrase twice.
pub fn unlock_proof(config: &Config, provisioning: bool) -> Result<UnlockProof> {
    match config.key_backend() {
        KeyBackendKind::Passphrase if provisioning => {
            Ok(UnlockProof::Passphrase(input::prompt_new_passphrase()?))
        }
        KeyBackendKind::Passphrase => Ok(UnlockProof::Passphrase(input::prompt_passphrase()?)),
        KeyBackendKind::Keyring | KeyBackendKind::Memory => Ok(UnlockProof::Presence),
    }
}

/// Everything a command needs: an unlocked custodian and a coordinator over the vault.
pub struct Session {
    pub layout: VaultLayout,
    pub custodian: Arc<KeyCustodian>,
    pub coordinator: SaveCoordinator<EncryptedFileStore>,
}

/// Unlock the master key and open the vault.
pub async fn open_session(config: &Config) -> Result<Session> {
    let layout = layout_from_config(config)?;
    layout.create_all()?;
    let backend = backend_from_config(config, &layout);
    let provisioning = match config.key_backend() {
        KeyBackendKind::Passphrase => !PassphraseFileBackend::new(layout.keys_dir()).is_provisioned(),
        _ => false,
    };
    let custodian = Arc::new(custodian_from_config(config, backend));
    custodian.unlock(unlock_proof(config, provisioning)?).await?;
    open_with(layout, custodian).await
}

pub async fn open_with(layout: VaultLayout, custodian: Arc<KeyCustodian>) -> Result<Session> {
    let vault = Vault::open(&layout, Arc::clone(&custodian)).await?;
    Ok(Session {
        layout,
        custodian,
        coordinator: SaveCoordinator::new(vault),
    })
}

/// Helper for tests: a session over `root` with an in-memory key, already unlocked.
#[cfg(test)]
pub async fn test_session(root: impl Into<PathBuf>) -> Session {
    let custodian = Arc::new(KeyCustodian::new(Arc::new(InMemoryKeyBackend::default())));
    custodian
        .unlock(UnlockProof::Presence)
        .await
        .expect("unlock");
    open_with(VaultLayout::new(root), custodian)
        .await
        .expect("open session")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;

    fn config_with(kind: KeyBackendKind, root: &std::path::Path) -> Config {
        Config {
            data_dir: Some(root.to_path_buf()),
            security: Some(SecurityConfig {
                key_backend: Some(kind),
                ..SecurityConfig::default()
            }),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn memory_backend_session_opens() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config_with(KeyBackendKind::Memory, dir.path());
        let session = open_session(&config).await.expect("open");
        assert_eq!(session.custodian.backend_name(), "memory");
        assert!(session.layout.records_dir().is_dir());
    }

    #[test]
    fn backend_selection_follows_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let layout = VaultLayout::new(dir.path());
        for (kind, name) in [
            (KeyBackendKind::Keyring, "keyring"),
            (KeyBackendKind::Passphrase, "passphrase"),
            (KeyBackendKind::Memory, "memory"),
        ] {
            let backend = backend_from_config(&config_with(kind, dir.path()), &layout);
            assert_eq!(backend.name(), name);
        }
    }

    #[test]
    fn layout_uses_configured_data_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config_with(KeyBackendKind::Memory, dir.path());
        let layout = layout_from_config(&config).expect("layout");
        assert_eq!(layout.root(), dir.path());
    }
}
