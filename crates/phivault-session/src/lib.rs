//! Session layer: drives capture, auto-save, editing and deletion of encrypted
//! records through a single serialized write queue.

pub mod coordinator;

pub use coordinator::{CaptureId, LoadedRecord, RecordSummary, SaveCoordinator, SessionState};
