//! Software-wrapped key backend for platforms without a credential store.
//!
//! Master keys are wrapped with the cipher codec under a key-encryption key (KEK)
//! derived from the operator passphrase with Argon2id. The KEK lives in memory only
//! between a successful `authenticate` and the next `forget`; unwrapped master keys
//! live only for the duration of one seal/open call.

use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::PathBuf,
    sync::{Mutex, MutexGuard},
};

use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use phivault_core::{Result, VaultError};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument};
use zeroize::Zeroizing;

use crate::{
    cipher::{self, Envelope, KEY_LEN},
    key_custodian::{KeyBackend, KeyHandle, UnlockProof},
};

const KEYSTORE_FILE: &str = "keystore.json";
const KEYSTORE_VERSION: u32 = 1;
const SALT_LEN: usize = 16;
const MIN_PASSPHRASE_LEN: usize = 8;
/// Sealed under the KEK so a passphrase can be checked before any key exists.
const CHECK_PLAINTEXT: &[u8] = b"phivault-kek-check";

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 64 * 1024,
            iterations: 3,
            parallelism: 1,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KeystoreFile {
    version: u32,
    salt: String,
    check: String,
    #[serde(default)]
    keys: BTreeMap<String, String>,
}

struct Session {
    kek: Zeroizing<[u8; KEY_LEN]>,
}

pub struct PassphraseFileBackend {
    dir: PathBuf,
    kdf: KdfParams,
    session: Mutex<Option<Session>>,
}

impl PassphraseFileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            kdf: KdfParams::default(),
            session: Mutex::new(None),
        }
    }

    pub fn with_kdf_params(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn keystore_path(&self) -> PathBuf {
        self.dir.join(KEYSTORE_FILE)
    }

    /// Whether a passphrase has been set on this installation.
    pub fn is_provisioned(&self) -> bool {
        self.keystore_path().exists()
    }

    fn read_keystore(&self) -> Result<Option<KeystoreFile>> {
        let bytes = match fs::read(self.keystore_path()) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(VaultError::io(err)),
        };
        let file: KeystoreFile =
            serde_json::from_slice(&bytes).map_err(|e| VaultError::KeyUnavailable {
                reason: format!("keystore unreadable: {e}"),
            })?;
        if file.version != KEYSTORE_VERSION {
            return Err(VaultError::KeyUnavailable {
                reason: format!("unsupported keystore version {}", file.version),
            });
        }
        Ok(Some(file))
    }

    fn write_keystore(&self, file: &KeystoreFile) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_vec_pretty(file).map_err(VaultError::io)?;
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(self.keystore_path())
            .map_err(|e| VaultError::io(e.error))?;
        Ok(())
    }

    fn kek(&self) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        self.session()
            .as_ref()
            .map(|s| s.kek.clone())
            .ok_or(VaultError::KeyLocked)
    }

    fn unwrap_key(&self, handle: &KeyHandle) -> Result<Zeroizing<[u8; KEY_LEN]>> {
        let kek = self.kek()?;
        let file = self.read_keystore()?.ok_or_else(|| VaultError::KeyUnavailable {
            reason: "keystore missing".into(),
        })?;
        let wrapped = file
            .keys
            .get(handle.alias())
            .ok_or_else(|| VaultError::KeyUnavailable {
                reason: format!("no key stored under alias {}", handle.alias()),
            })?;
        let raw = Zeroizing::new(
            cipher::decrypt(&decode(wrapped)?, &kek).map_err(|e| VaultError::KeyUnavailable {
                reason: format!("wrapped key does not open: {e}"),
            })?,
        );
        if raw.len() != KEY_LEN {
            return Err(VaultError::KeyUnavailable {
                reason: format!("expected {KEY_LEN} key bytes, got {}", raw.len()),
            });
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&raw);
        Ok(key)
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl KeyBackend for PassphraseFileBackend {
    fn name(&self) -> &'static str {
        "passphrase"
    }

    #[instrument(skip_all, fields(alias))]
    async fn generate_or_fetch_key(&self, alias: &str) -> Result<KeyHandle> {
        let kek = self.kek()?;
        let mut file = self.read_keystore()?.ok_or_else(|| VaultError::KeyUnavailable {
            reason: "keystore missing".into(),
        })?;
        if file.keys.contains_key(alias) {
            return Ok(KeyHandle::new(alias));
        }

        let key = cipher::generate_key();
        let wrapped = cipher::encrypt(key.as_slice(), &kek)?;
        file.keys
            .insert(alias.to_string(), STANDARD.encode(wrapped.as_bytes()));
        self.write_keystore(&file)?;
        info!("generated new wrapped master key");
        Ok(KeyHandle::new(alias))
    }

    async fn authenticate(&self, prompt: &str, proof: &UnlockProof) -> Result<()> {
        debug!(prompt, "verifying passphrase");
        let passphrase = match proof {
            UnlockProof::Passphrase(value) => value,
            UnlockProof::Presence => {
                return Err(VaultError::AuthenticationFailed {
                    reason: "passphrase required".into(),
                })
            }
        };

        let kek = match self.read_keystore()? {
            Some(file) => {
                let salt = decode(&file.salt)?;
                let kek = derive_kek(passphrase, &salt, self.kdf)?;
                let check = decode(&file.check)?;
                cipher::decrypt(&check, &kek).map_err(|err| match err {
                    VaultError::IntegrityFailure => VaultError::AuthenticationFailed {
                        reason: "passphrase rejected".into(),
                    },
                    other => VaultError::KeyUnavailable {
                        reason: format!("keystore check unreadable: {other}"),
                    },
                })?;
                kek
            }
            None => {
                validate_passphrase(passphrase)?;
                let mut salt = [0u8; SALT_LEN];
                OsRng.fill_bytes(&mut salt);
                let kek = derive_kek(passphrase, &salt, self.kdf)?;
                let check = cipher::encrypt(CHECK_PLAINTEXT, &kek)?;
                self.write_keystore(&KeystoreFile {
                    version: KEYSTORE_VERSION,
                    salt: STANDARD.encode(salt),
                    check: STANDARD.encode(check.as_bytes()),
                    keys: BTreeMap::new(),
                })?;
                info!(path = %self.keystore_path().display(), "provisioned passphrase keystore");
                kek
            }
        };

        *self.session() = Some(Session { kek });
        Ok(())
    }

    async fn seal(&self, handle: &KeyHandle, plaintext: &[u8]) -> Result<Envelope> {
        let key = self.unwrap_key(handle)?;
        cipher::encrypt(plaintext, &key)
    }

    async fn open(&self, handle: &KeyHandle, envelope: &[u8]) -> Result<Vec<u8>> {
        let key = self.unwrap_key(handle)?;
        cipher::decrypt(envelope, &key)
    }

    fn forget(&self) {
        *self.session() = None;
    }
}

/// Minimum requirements for a new passphrase: not blank, at least 8 characters.
pub fn validate_passphrase(passphrase: &str) -> Result<()> {
    if passphrase.trim().is_empty() {
        return Err(VaultError::InvalidInput {
            reason: "passphrase cannot be empty".into(),
        });
    }
    if passphrase.chars().count() < MIN_PASSPHRASE_LEN {
        return Err(VaultError::InvalidInput {
            reason: format!("passphrase must be at least {MIN_PASSPHRASE_LEN} characters"),
        });
    }
    Ok(())
}

fn derive_kek(passphrase: &str, salt: &[u8], kdf: KdfParams) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    let params = Params::new(
        kdf.memory_kib,
        kdf.iterations,
        kdf.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| VaultError::io(format!("argon2 params: {e}")))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut kek = Zeroizing::new([0u8; KEY_LEN]);
    argon
        .hash_password_into(passphrase.as_bytes(), salt, kek.as_mut_slice())
        .map_err(|e| VaultError::io(format!("argon2 derive: {e}")))?;
    Ok(kek)
}

fn decode(value: &str) -> Result<Vec<u8>> {
    STANDARD.decode(value).map_err(|e| VaultError::KeyUnavailable {
        reason: format!("keystore field is not base64: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    fn fast_kdf() -> KdfParams {
        KdfParams {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn backend(dir: &Path) -> PassphraseFileBackend {
        PassphraseFileBackend::new(dir).with_kdf_params(fast_kdf())
    }

    #[tokio::test]
    async fn provisions_then_reopens_with_same_passphrase() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = backend(dir.path());
        first
            .authenticate("unlock", &UnlockProof::passphrase("shift-passphrase"))
            .await
            .expect("provision");
        let handle = first.generate_or_fetch_key("master").await.expect("key");
        let sealed = first.seal(&handle, b"chart note").await.expect("seal");

        let second = backend(dir.path());
        second
            .authenticate("unlock", &UnlockProof::passphrase("shift-passphrase"))
            .await
            .expect("reopen");
        let again = second.generate_or_fetch_key("master").await.expect("fetch");
        assert_eq!(again, handle);
        assert_eq!(
            second.open(&again, sealed.as_bytes()).await.expect("open"),
            b"chart note"
        );
    }

    #[tokio::test]
    async fn wrong_passphrase_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        backend(dir.path())
            .authenticate("unlock", &UnlockProof::passphrase("shift-passphrase"))
            .await
            .expect("provision");

        let err = backend(dir.path())
            .authenticate("unlock", &UnlockProof::passphrase("other-passphrase"))
            .await
            .expect_err("wrong passphrase");
        assert!(matches!(err, VaultError::AuthenticationFailed { .. }));
    }

    #[tokio::test]
    async fn forget_drops_the_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = backend(dir.path());
        backend
            .authenticate("unlock", &UnlockProof::passphrase("shift-passphrase"))
            .await
            .expect("provision");
        let handle = backend.generate_or_fetch_key("master").await.expect("key");

        backend.forget();
        let err = backend.seal(&handle, b"x").await.expect_err("locked");
        assert_eq!(err, VaultError::KeyLocked);
    }

    #[tokio::test]
    async fn short_passphrase_cannot_provision() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = backend(dir.path())
            .authenticate("unlock", &UnlockProof::passphrase("short"))
            .await
            .expect_err("too short");
        assert!(matches!(err, VaultError::InvalidInput { .. }));
        assert!(!backend(dir.path()).is_provisioned());
    }

    #[tokio::test]
    async fn corrupt_keystore_is_key_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(KEYSTORE_FILE), b"{not json").expect("write");
        let err = backend(dir.path())
            .authenticate("unlock", &UnlockProof::passphrase("shift-passphrase"))
            .await
            .expect_err("corrupt");
        assert!(err.is_fatal());
    }

    #[test]
    fn passphrase_policy() {
        assert!(validate_passphrase("long enough").is_ok());
        assert!(validate_passphrase("   ").is_err());
        assert!(validate_passphrase("seven77").is_err());
    }
}
