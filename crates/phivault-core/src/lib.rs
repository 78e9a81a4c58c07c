//! Core contracts for phivault: error taxonomy, record and audit types, the
//! encrypted blob store contract, and the transcription collaborator seam.
//! This crate is intentionally small to keep dependency surface minimal.

pub mod audit;
pub mod error;
pub mod records;
pub mod storage;
pub mod transcribe;

pub use error::{Result, VaultError};
