//! Lifecycle and access gating for the installation's master key.
//!
//! The custodian never holds key bytes. It owns a [`KeyHandle`] and a pluggable
//! [`KeyBackend`] that performs "encrypt/decrypt with stored key" on request, and it
//! only hands out a [`MasterKey`] while an unlock window is open.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use phivault_core::{Result, VaultError};
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

use crate::cipher::Envelope;

/// One working shift.
pub const DEFAULT_UNLOCK_WINDOW: Duration = Duration::from_secs(12 * 60 * 60);
pub const DEFAULT_KEY_ALIAS: &str = "phivault-master";
const DEFAULT_PROMPT: &str = "Authenticate to access encrypted records";

/// Reference to a key living inside a backend. Carries no key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHandle {
    alias: String,
}

impl KeyHandle {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
        }
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }
}

/// What the operator presented to unlock.
pub enum UnlockProof {
    /// Platform-mediated presence (biometric, device credential, unlocked keychain).
    Presence,
    Passphrase(Zeroizing<String>),
}

impl UnlockProof {
    pub fn passphrase(value: impl Into<String>) -> Self {
        UnlockProof::Passphrase(Zeroizing::new(value.into()))
    }
}

impl fmt::Debug for UnlockProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnlockProof::Presence => f.write_str("Presence"),
            UnlockProof::Passphrase(_) => f.write_str("Passphrase([REDACTED])"),
        }
    }
}

/// Platform key storage (secure element, OS keychain, passphrase-wrapped file).
#[async_trait]
pub trait KeyBackend: Send + Sync {
    /// Short name used for logging and config.
    fn name(&self) -> &'static str;

    /// Return a handle to the key stored under `alias`, generating and persisting it first if absent.
    async fn generate_or_fetch_key(&self, alias: &str) -> Result<KeyHandle>;

    /// Verify the operator. `AuthenticationFailed` on rejection.
    async fn authenticate(&self, prompt: &str, proof: &UnlockProof) -> Result<()>;

    /// Encrypt with the stored key.
    async fn seal(&self, handle: &KeyHandle, plaintext: &[u8]) -> Result<Envelope>;

    /// Decrypt with the stored key.
    async fn open(&self, handle: &KeyHandle, envelope: &[u8]) -> Result<Vec<u8>>;

    /// Drop any session secret obtained during `authenticate`.
    fn forget(&self) {}
}

/// Observable custodian state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustodianState {
    Locked,
    Unlocking,
    Unlocked { remaining: Duration },
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Locked,
    Unlocking,
    Unlocked { since: Instant },
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    handle: Option<KeyHandle>,
    /// Bumped by every `lock`, so an unlock in flight can tell it was overtaken.
    locks: u64,
}

/// Gatekeeper for the master key. Construct once and share via `Arc`.
pub struct KeyCustodian {
    backend: Arc<dyn KeyBackend>,
    alias: String,
    prompt: String,
    unlock_window: Duration,
    inner: Mutex<Inner>,
}

impl KeyCustodian {
    pub fn new(backend: Arc<dyn KeyBackend>) -> Self {
        Self {
            backend,
            alias: DEFAULT_KEY_ALIAS.to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
            unlock_window: DEFAULT_UNLOCK_WINDOW,
            inner: Mutex::new(Inner {
                phase: Phase::Locked,
                handle: None,
                locks: 0,
            }),
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_unlock_window(mut self, window: Duration) -> Self {
        self.unlock_window = window;
        self
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn unlock_window(&self) -> Duration {
        self.unlock_window
    }

    /// Authenticate and open a fresh unlock window.
    ///
    /// An open window stays usable while re-authenticating and survives a failed attempt.
    /// A `lock` that lands while the backend is still authenticating wins.
    #[instrument(skip_all, fields(backend = self.backend.name()))]
    pub async fn unlock(&self, proof: UnlockProof) -> Result<()> {
        let locks = {
            let mut inner = self.inner();
            if !matches!(self.refresh(&mut inner), Phase::Unlocked { .. }) {
                inner.phase = Phase::Unlocking;
            }
            inner.locks
        };

        let outcome = match self.backend.authenticate(&self.prompt, &proof).await {
            Ok(()) => self.get_or_create_master_key().await,
            Err(err) => Err(err),
        };

        let mut inner = self.inner();
        if inner.locks != locks {
            drop(inner);
            self.backend.forget();
            warn!("locked while unlocking; authentication discarded");
            return match outcome {
                Ok(_) => Err(VaultError::KeyLocked),
                Err(err) => Err(err),
            };
        }
        match outcome {
            Ok(handle) => {
                inner.handle = Some(handle);
                inner.phase = Phase::Unlocked {
                    since: Instant::now(),
                };
                info!(window_secs = self.unlock_window.as_secs(), "master key unlocked");
                Ok(())
            }
            Err(err) if matches!(self.refresh(&mut inner), Phase::Unlocked { .. }) => {
                warn!(error = %err, "re-authentication failed; unlock window unchanged");
                Err(err)
            }
            Err(err) => {
                inner.phase = Phase::Locked;
                drop(inner);
                self.backend.forget();
                warn!(error = %err, "unlock failed");
                Err(err)
            }
        }
    }

    /// Close the unlock window immediately.
    pub fn lock(&self) {
        {
            let mut inner = self.inner();
            inner.phase = Phase::Locked;
            inner.locks = inner.locks.wrapping_add(1);
        }
        self.backend.forget();
        debug!("master key locked");
    }

    pub fn state(&self) -> CustodianState {
        let mut inner = self.inner();
        match self.refresh(&mut inner) {
            Phase::Locked => CustodianState::Locked,
            Phase::Unlocking => CustodianState::Unlocking,
            Phase::Unlocked { since } => CustodianState::Unlocked {
                remaining: self.unlock_window.saturating_sub(since.elapsed()),
            },
        }
    }

    /// Handle to the master key, only while unlocked. Fails fast with `KeyLocked` otherwise.
    pub fn current_key(&self) -> Result<MasterKey> {
        let mut inner = self.inner();
        match self.refresh(&mut inner) {
            Phase::Unlocked { .. } => {
                let handle = inner.handle.clone().ok_or(VaultError::KeyLocked)?;
                Ok(MasterKey {
                    handle,
                    backend: Arc::clone(&self.backend),
                })
            }
            Phase::Locked | Phase::Unlocking => Err(VaultError::KeyLocked),
        }
    }

    /// Idempotent: fetches the existing key handle or has the backend create one.
    pub async fn get_or_create_master_key(&self) -> Result<KeyHandle> {
        if let Some(handle) = self.inner().handle.clone() {
            return Ok(handle);
        }
        let handle = self.backend.generate_or_fetch_key(&self.alias).await?;
        self.inner().handle = Some(handle.clone());
        Ok(handle)
    }

    fn refresh(&self, inner: &mut Inner) -> Phase {
        if let Phase::Unlocked { since } = inner.phase {
            if since.elapsed() >= self.unlock_window {
                inner.phase = Phase::Locked;
                self.backend.forget();
                info!("unlock window expired");
            }
        }
        inner.phase
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Short-lived capability to encrypt/decrypt with the master key. Holds no key bytes.
#[derive(Clone)]
pub struct MasterKey {
    handle: KeyHandle,
    backend: Arc<dyn KeyBackend>,
}

impl MasterKey {
    pub async fn seal(&self, plaintext: &[u8]) -> Result<Envelope> {
        self.backend.seal(&self.handle, plaintext).await
    }

    pub async fn open(&self, envelope: &[u8]) -> Result<Vec<u8>> {
        self.backend.open(&self.handle, envelope).await
    }

    pub fn handle(&self) -> &KeyHandle {
        &self.handle
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MasterKey")
            .field("alias", &self.handle.alias)
            .field("backend", &self.backend.name())
            .finish()
    }
}
