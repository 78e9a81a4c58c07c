use std::fmt;

use chrono::{DateTime, Utc};

/// Operation an audit row describes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AuditAction {
    CaptureStart,
    CaptureStop,
    TranscriptionHandoff,
    TranscriptionFailed,
    SaveEncryptedRecord,
    LoadRecord,
    DeleteEncryptedRecord,
    ReleaseCapture,
    PurgeCaptures,
    AuditPruned,
    AuditExported,
    Cleanup,
    /// Action written by a newer build; kept verbatim.
    Other(String),
}

impl AuditAction {
    pub fn as_str(&self) -> &str {
        match self {
            AuditAction::CaptureStart => "capture_start",
            AuditAction::CaptureStop => "capture_stop",
            AuditAction::TranscriptionHandoff => "transcription_handoff",
            AuditAction::TranscriptionFailed => "transcription_failed",
            AuditAction::SaveEncryptedRecord => "save_encrypted_record",
            AuditAction::LoadRecord => "load_record",
            AuditAction::DeleteEncryptedRecord => "delete_encrypted_record",
            AuditAction::ReleaseCapture => "release_capture",
            AuditAction::PurgeCaptures => "purge_captures",
            AuditAction::AuditPruned => "audit_pruned",
            AuditAction::AuditExported => "audit_exported",
            AuditAction::Cleanup => "cleanup",
            AuditAction::Other(raw) => raw,
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "capture_start" => AuditAction::CaptureStart,
            "capture_stop" => AuditAction::CaptureStop,
            "transcription_handoff" => AuditAction::TranscriptionHandoff,
            "transcription_failed" => AuditAction::TranscriptionFailed,
            "save_encrypted_record" => AuditAction::SaveEncryptedRecord,
            "load_record" => AuditAction::LoadRecord,
            "delete_encrypted_record" => AuditAction::DeleteEncryptedRecord,
            "release_capture" => AuditAction::ReleaseCapture,
            "purge_captures" => AuditAction::PurgeCaptures,
            "audit_pruned" => AuditAction::AuditPruned,
            "audit_exported" => AuditAction::AuditExported,
            "cleanup" => AuditAction::Cleanup,
            other => AuditAction::Other(other.to_string()),
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the audit ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    /// What the action touched (record id, capture id, document name).
    pub subject_reference: String,
    /// Who it concerns, typically the subject's display name.
    pub tag: String,
    pub details: String,
}

impl AuditEntry {
    pub fn new(action: AuditAction, subject_reference: impl Into<String>) -> Self {
        Self::at(Utc::now(), action, subject_reference)
    }

    pub fn at(
        timestamp: DateTime<Utc>,
        action: AuditAction,
        subject_reference: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            action,
            subject_reference: subject_reference.into(),
            tag: String::new(),
            details: String::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}
