use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use phivault_core::{Result, VaultError};
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::{
    cipher::{self, Envelope, KEY_LEN},
    key_custodian::{KeyBackend, KeyHandle, UnlockProof},
};

/// OS credential store backend (Keychain, Credential Manager, Secret Service).
///
/// The key is read from the keyring only for the duration of one seal/open call
/// and zeroized when that call returns.
pub struct KeyringBackend {
    service: String,
    account: String,
}

impl KeyringBackend {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    fn entry(&self, alias: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, alias).map_err(keyring_err)
    }

    fn fetch(&self, alias: &str) -> Result<Option<Zeroizing<[u8; KEY_LEN]>>> {
        match self.entry(alias)?.get_password() {
            Ok(secret) => decode_key(&Zeroizing::new(secret)).map(Some),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(keyring_err(err)),
        }
    }

    fn stored_key(&self, handle: &KeyHandle) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        self.fetch(handle.alias())?
            .ok_or_else(|| VaultError::KeyUnavailable {
                reason: format!("no key stored under alias {}", handle.alias()),
            })
    }
}

#[async_trait]
impl KeyBackend for KeyringBackend {
    fn name(&self) -> &'static str {
        "keyring"
    }

    #[instrument(skip_all, fields(alias))]
    async fn generate_or_fetch_key(&self, alias: &str) -> Result<KeyHandle> {
        // Keyring operations are synchronous; wrap in async for trait compatibility.
        if self.fetch(alias)?.is_some() {
            return Ok(KeyHandle::new(alias));
        }

        let key = cipher::generate_key();
        let encoded = Zeroizing::new(general_purpose::STANDARD.encode(key.as_slice()));
        self.entry(alias)?
            .set_password(&encoded)
            .map_err(keyring_err)?;
        debug!("generated new master key in keyring");
        Ok(KeyHandle::new(alias))
    }

    async fn authenticate(&self, prompt: &str, _proof: &UnlockProof) -> Result<()> {
        // The platform prompts on locked keychains; reaching the entry is the proof.
        debug!(prompt, "probing keyring access");
        match self.entry(&self.account)?.get_password() {
            Ok(_) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(keyring_err(err)),
        }
    }

    async fn seal(&self, handle: &KeyHandle, plaintext: &[u8]) -> Result<Envelope> {
        let key = self.stored_key(handle)?;
        cipher::encrypt(plaintext, &key)
    }

    async fn open(&self, handle: &KeyHandle, envelope: &[u8]) -> Result<Vec<u8>> {
        let key = self.stored_key(handle)?;
        cipher::decrypt(envelope, &key)
    }
}

/// In-memory backend for tests and ephemeral sessions.
#[derive(Default, Clone)]
pub struct InMemoryKeyBackend {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    keys: HashMap<String, Zeroizing<[u8; KEY_LEN]>>,
    passphrase: Option<Zeroizing<String>>,
    deny: bool,
}

impl InMemoryKeyBackend {
    /// Require this passphrase as the unlock proof.
    pub fn with_passphrase(self, passphrase: impl Into<String>) -> Self {
        self.state().passphrase = Some(Zeroizing::new(passphrase.into()));
        self
    }

    /// Make every authentication attempt fail, as if the operator cancelled the prompt.
    pub fn deny_authentication(&self, deny: bool) {
        self.state().deny = deny;
    }

    /// Drop all keys, as a wiped hardware store would.
    pub fn reset(&self) {
        self.state().keys.clear();
    }

    pub fn key_count(&self) -> usize {
        self.state().keys.len()
    }

    fn key_for(&self, handle: &KeyHandle) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        self.state()
            .keys
            .get(handle.alias())
            .cloned()
            .ok_or_else(|| VaultError::KeyUnavailable {
                reason: format!("no key stored under alias {}", handle.alias()),
            })
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for InMemoryKeyBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryKeyBackend")
            .field("keys", &self.key_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl KeyBackend for InMemoryKeyBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn generate_or_fetch_key(&self, alias: &str) -> Result<KeyHandle> {
        self.state()
            .keys
            .entry(alias.to_string())
            .or_insert_with(cipher::generate_key);
        Ok(KeyHandle::new(alias))
    }

    async fn authenticate(&self, _prompt: &str, proof: &UnlockProof) -> Result<()> {
        let state = self.state();
        if state.deny {
            return Err(VaultError::AuthenticationFailed {
                reason: "authentication cancelled".into(),
            });
        }
        match (&state.passphrase, proof) {
            (None, _) => Ok(()),
            (Some(expected), UnlockProof::Passphrase(given)) if expected == given => Ok(()),
            (Some(_), _) => Err(VaultError::AuthenticationFailed {
                reason: "passphrase rejected".into(),
            }),
        }
    }

    async fn seal(&self, handle: &KeyHandle, plaintext: &[u8]) -> Result<Envelope> {
        let key = self.key_for(handle)?;
        cipher::encrypt(plaintext, &key)
    }

    async fn open(&self, handle: &KeyHandle, envelope: &[u8]) -> Result<Vec<u8>> {
        let key = self.key_for(handle)?;
        cipher::decrypt(envelope, &key)
    }
}

fn keyring_err(err: keyring::Error) -> VaultError {
    match err {
        keyring::Error::NoStorageAccess(inner) => VaultError::AuthenticationFailed {
            reason: format!("keyring access denied: {inner}"),
        },
        other => VaultError::KeyUnavailable {
            reason: format!("keyring error: {other}"),
        },
    }
}

fn decode_key(secret: &str) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let bytes = Zeroizing::new(general_purpose::STANDARD.decode(secret).map_err(|e| {
        VaultError::KeyUnavailable {
            reason: format!("stored key is not base64: {e}"),
        }
    })?);

    if bytes.len() != KEY_LEN {
        return Err(VaultError::KeyUnavailable {
            reason: format!("expected {KEY_LEN} key bytes, got {}", bytes.len()),
        });
    }

    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    out.copy_from_slice(&bytes);
    Ok(out)
}
