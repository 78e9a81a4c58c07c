//! Concrete storage implementations with encryption at rest.
//! AES-256-GCM envelopes sealed with a master key held by a platform key backend
//! (OS keyring, passphrase-wrapped file, or an in-memory test double).

pub mod audit_ledger;
pub mod cipher;
pub mod export;
pub mod key_custodian;
pub mod key_provider;
pub mod metadata_index;
pub mod passphrase_backend;
pub mod secure_file_store;
pub mod vault;
pub mod worker;

pub use key_custodian::{CustodianState, KeyBackend, KeyCustodian, MasterKey, UnlockProof};
pub use secure_file_store::EncryptedFileStore;
pub use vault::{Vault, VaultLayout};
pub use worker::SerialQueue;
