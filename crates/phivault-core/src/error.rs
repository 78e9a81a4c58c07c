use thiserror::Error;

use crate::transcribe::TranscriptionError;

/// Result type alias for vault operations.
pub type Result<T> = std::result::Result<T, VaultError>;

/// Errors produced by the key custodian, the encrypted stores, and the save coordinator.
///
/// Expected conditions (`KeyLocked`, `NotFound`) are distinct from unexpected ones
/// (`IoFailure`) so callers can branch without string matching.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VaultError {
    /// The unlock proof was rejected; the custodian stays locked.
    #[error("authentication failed: {reason}")]
    AuthenticationFailed { reason: String },
    /// No unlocked master key; re-authenticate and resubmit.
    #[error("master key is locked")]
    KeyLocked,
    /// Backing key store is corrupted or was reset. Not retryable on this installation.
    #[error("master key unavailable: {reason}")]
    KeyUnavailable { reason: String },
    /// Authentication tag did not verify (tampered bytes or wrong key).
    #[error("integrity check failed")]
    IntegrityFailure,
    /// Envelope bytes do not follow the expected layout.
    #[error("malformed envelope: {reason}")]
    FormatError { reason: String },
    /// Requested blob does not exist.
    #[error("not found: {id}")]
    NotFound { id: String },
    /// Underlying filesystem or queue failure.
    #[error("i/o failure: {reason}")]
    IoFailure { reason: String },
    /// Caller supplied unusable input (empty display fields, bad id).
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },
    /// Operation is not allowed in the current session state.
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: String,
    },
    /// External transcription collaborator failed.
    #[error(transparent)]
    Transcription(#[from] TranscriptionError),
}

impl VaultError {
    pub fn io(err: impl ToString) -> Self {
        VaultError::IoFailure {
            reason: err.to_string(),
        }
    }

    pub fn format(reason: impl Into<String>) -> Self {
        VaultError::FormatError {
            reason: reason.into(),
        }
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        VaultError::NotFound { id: id.into() }
    }

    /// `KeyUnavailable` means the installation lost its key; nothing will fix it by retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VaultError::KeyUnavailable { .. })
    }

    /// Conditions an operator can clear by re-authenticating or trying again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VaultError::KeyLocked
                | VaultError::AuthenticationFailed { .. }
                | VaultError::IoFailure { .. }
                | VaultError::Transcription(_)
        )
    }
}

impl From<std::io::Error> for VaultError {
    fn from(err: std::io::Error) -> Self {
        VaultError::io(err)
    }
}
