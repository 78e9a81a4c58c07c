//! Capture-to-record session: auto-save on capture completion, then manual saves in place.
//!
//! A finished capture is written as an encrypted record before the operator is asked to
//! confirm anything, so closing the session at any later point loses nothing. The record
//! id minted for that auto-save stays bound to the session; manual saves overwrite it.

use std::{
    fmt,
    io::Write,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use chrono::Utc;
use phivault_core::{
    audit::{AuditAction, AuditEntry},
    records::{fallback_display_name, BlobId, DisplayFields, FileMetadata},
    storage::BlobStore,
    transcribe::{Transcriber, TranscriptionError},
    Result, VaultError,
};
use phivault_storage::{audit_ledger::AuditFailure, SerialQueue, Vault};
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

/// Id of a stashed raw capture artifact in the captures store.
pub type CaptureId = BlobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Capturing,
    PendingAutoSave,
    Editable,
    Saved,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Idle => "idle",
            SessionState::Capturing => "capturing",
            SessionState::PendingAutoSave => "pending auto-save",
            SessionState::Editable => "editable",
            SessionState::Saved => "saved",
        };
        f.write_str(label)
    }
}

/// A record decrypted for review or editing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedRecord {
    pub id: BlobId,
    pub content: String,
    pub metadata: Option<FileMetadata>,
    pub display_name: String,
}

/// One row of the record list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSummary {
    pub id: BlobId,
    pub display_name: String,
    pub metadata: Option<FileMetadata>,
}

#[derive(Debug)]
struct Session {
    state: SessionState,
    fields: DisplayFields,
    capture: Option<CaptureId>,
    bound: Option<BlobId>,
    content: Option<String>,
    /// Minted for an auto-save that has not committed yet; reused on retry.
    pending_id: Option<BlobId>,
}

impl Session {
    fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            fields: DisplayFields::default(),
            capture: None,
            bound: None,
            content: None,
            pending_id: None,
        }
    }

    fn require(&self, operation: &'static str, allowed: &[SessionState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(VaultError::InvalidState {
                operation,
                state: self.state.to_string(),
            })
        }
    }

    fn tag(&self) -> String {
        display_tag(&self.fields)
    }
}

pub struct SaveCoordinator<S> {
    vault: Arc<Vault<S>>,
    queue: SerialQueue,
    session: Mutex<Session>,
}

impl<S: BlobStore + 'static> SaveCoordinator<S> {
    /// Needs a running tokio runtime for the write queue.
    pub fn new(vault: Vault<S>) -> Self {
        Self::with_queue(Arc::new(vault), SerialQueue::spawn())
    }

    pub fn with_queue(vault: Arc<Vault<S>>, queue: SerialQueue) -> Self {
        Self {
            vault,
            queue,
            session: Mutex::new(Session::idle()),
        }
    }

    pub fn vault(&self) -> &Arc<Vault<S>> {
        &self.vault
    }

    pub fn state(&self) -> SessionState {
        self.session().state
    }

    pub fn bound_record(&self) -> Option<BlobId> {
        self.session().bound
    }

    pub fn content(&self) -> Option<String> {
        self.session().content.clone()
    }

    pub fn display_fields(&self) -> DisplayFields {
        self.session().fields.clone()
    }

    pub fn pending_capture(&self) -> Option<CaptureId> {
        self.session().capture
    }

    /// Replace the display fields used by the next save.
    pub fn set_display_fields(&self, fields: DisplayFields) {
        self.session().fields = fields;
    }

    pub fn subscribe_audit_failures(&self) -> broadcast::Receiver<AuditFailure> {
        self.vault.ledger.subscribe_failures()
    }

    /// Begin a new capture. Any bound record is released from the session first.
    pub async fn start_capture(&self, fields: DisplayFields) -> Result<()> {
        let tag = {
            let mut session = self.session();
            session.require(
                "start capture",
                &[SessionState::Idle, SessionState::Editable, SessionState::Saved],
            )?;
            *session = Session {
                state: SessionState::Capturing,
                fields,
                ..Session::idle()
            };
            session.tag()
        };
        self.audit(AuditEntry::new(AuditAction::CaptureStart, "session").with_tag(tag))
            .await;
        Ok(())
    }

    /// Stash the raw capture encrypted so it survives until its content is saved.
    #[instrument(skip_all, fields(bytes = raw.len()))]
    pub async fn stop_capture(&self, raw: &[u8]) -> Result<CaptureId> {
        let tag = {
            let session = self.session();
            session.require("stop capture", &[SessionState::Capturing])?;
            session.tag()
        };

        let capture = CaptureId::new();
        let vault = Arc::clone(&self.vault);
        let raw = raw.to_vec();
        let bytes = raw.len();
        self.queue
            .run(async move {
                vault
                    .captures
                    .save_encrypted(&capture.to_string(), &raw)
                    .await
            })
            .await??;

        {
            let mut session = self.session();
            session.capture = Some(capture);
            session.state = SessionState::PendingAutoSave;
        }
        self.audit(
            AuditEntry::new(AuditAction::CaptureStop, capture.to_string())
                .with_tag(tag)
                .with_details(format!("{bytes} bytes")),
        )
        .await;
        Ok(capture)
    }

    /// Hand the stashed capture to `transcriber` and auto-save the result.
    ///
    /// On failure or timeout the capture stays stashed and the session stays in
    /// `PendingAutoSave`, so the call can simply be repeated.
    pub async fn transcribe_capture(
        &self,
        transcriber: &dyn Transcriber,
        timeout: Duration,
    ) -> Result<BlobId> {
        let (capture, tag) = {
            let session = self.session();
            session.require("transcribe", &[SessionState::PendingAutoSave])?;
            let capture = session.capture.ok_or(VaultError::InvalidState {
                operation: "transcribe",
                state: "no capture stashed".into(),
            })?;
            (capture, session.tag())
        };

        let raw = self.vault.captures.load_encrypted(&capture.to_string()).await?;
        self.audit(
            AuditEntry::new(AuditAction::TranscriptionHandoff, capture.to_string())
                .with_tag(tag.clone())
                .with_details(transcriber.name()),
        )
        .await;

        let outcome = match tokio::time::timeout(timeout, transcriber.transcribe(&raw)).await {
            Ok(Ok(text)) if text.trim().is_empty() => Err(TranscriptionError::Empty),
            Ok(result) => result,
            Err(_) => Err(TranscriptionError::TimedOut(timeout)),
        };
        match outcome {
            Ok(text) => self.complete_capture(text).await,
            Err(err) => {
                warn!(error = %err, "transcription failed; capture kept for retry");
                self.audit(
                    AuditEntry::new(AuditAction::TranscriptionFailed, capture.to_string())
                        .with_tag(tag)
                        .with_details(err.to_string()),
                )
                .await;
                Err(err.into())
            }
        }
    }

    /// Auto-save produced content under a freshly minted id, then open it for editing.
    pub async fn complete_capture(&self, content: String) -> Result<BlobId> {
        {
            let mut session = self.session();
            session.require(
                "complete capture",
                &[SessionState::Capturing, SessionState::PendingAutoSave],
            )?;
            if session.pending_id.is_none() {
                session.pending_id = Some(BlobId::new());
            }
            session.content = Some(content);
            session.state = SessionState::PendingAutoSave;
        }
        self.auto_save().await
    }

    /// Re-run an auto-save that failed. The content was kept in memory.
    pub async fn retry_auto_save(&self) -> Result<BlobId> {
        {
            let session = self.session();
            session.require("retry auto-save", &[SessionState::PendingAutoSave])?;
            if session.pending_id.is_none() || session.content.is_none() {
                return Err(VaultError::InvalidState {
                    operation: "retry auto-save",
                    state: "nothing awaiting auto-save".into(),
                });
            }
        }
        self.auto_save().await
    }

    #[instrument(skip_all)]
    async fn auto_save(&self) -> Result<BlobId> {
        let (id, content, fields, capture) = {
            let session = self.session();
            let id = session.pending_id.ok_or(VaultError::InvalidState {
                operation: "auto-save",
                state: "no record id minted".into(),
            })?;
            (
                id,
                session.content.clone().unwrap_or_default(),
                session.fields.clone(),
                session.capture,
            )
        };

        let vault = Arc::clone(&self.vault);
        let job = async move {
            vault
                .records
                .save_encrypted(&id.to_string(), content.as_bytes())
                .await?;
            // Records without complete fields stay unindexed and list under a fallback name.
            let tag = display_tag(&fields);
            if fields.is_complete() {
                vault
                    .index
                    .upsert(id, FileMetadata::new(fields, Utc::now()))
                    .await?;
            }
            vault
                .ledger
                .record(
                    AuditEntry::new(AuditAction::SaveEncryptedRecord, id.to_string())
                        .with_tag(tag.clone())
                        .with_details("auto-save"),
                )
                .await;

            if let Some(capture) = capture {
                match vault.captures.delete_encrypted(&capture.to_string()).await {
                    Ok(_) => {
                        vault
                            .ledger
                            .record(
                                AuditEntry::new(AuditAction::ReleaseCapture, capture.to_string())
                                    .with_tag(tag)
                                    .with_details(format!("superseded by {id}")),
                            )
                            .await
                    }
                    // The record is safe; a leftover capture is removed by purge.
                    Err(err) => warn!(error = %err, "could not release raw capture"),
                }
            }
            Ok::<_, VaultError>(())
        };

        if let Err(err) = self.queue.run(job).await.and_then(|res| res) {
            warn!(error = %err, "auto-save failed; content kept in memory");
            return Err(err);
        }

        let mut session = self.session();
        session.bound = Some(id);
        session.pending_id = None;
        session.capture = None;
        session.state = SessionState::Editable;
        info!(record = %id.short(), "capture auto-saved");
        Ok(id)
    }

    /// Open an unsaved record typed directly, without a capture. Nothing is bound until the first save.
    pub fn start_draft(&self, fields: DisplayFields, content: impl Into<String>) -> Result<()> {
        let mut session = self.session();
        session.require(
            "start draft",
            &[SessionState::Idle, SessionState::Editable, SessionState::Saved],
        )?;
        *session = Session {
            state: SessionState::Editable,
            fields,
            content: Some(content.into()),
            ..Session::idle()
        };
        Ok(())
    }

    /// Replace the in-memory content of the open record.
    pub fn edit(&self, content: impl Into<String>) -> Result<()> {
        let mut session = self.session();
        session.require("edit", &[SessionState::Editable, SessionState::Saved])?;
        session.content = Some(content.into());
        session.state = SessionState::Editable;
        Ok(())
    }

    /// Overwrite the bound record with the current content.
    ///
    /// Mints an id only when nothing is bound, and keeps it across failed attempts.
    /// Requires a subject name and date of birth.
    pub async fn save(&self, fields: Option<DisplayFields>) -> Result<BlobId> {
        let (id, content, fields) = {
            let mut session = self.session();
            session.require("save", &[SessionState::Editable, SessionState::Saved])?;
            let fields = fields.unwrap_or_else(|| session.fields.clone());
            if !fields.is_complete() {
                return Err(VaultError::InvalidInput {
                    reason: "subject name and date of birth are required".into(),
                });
            }
            let id = match session.bound {
                Some(id) => id,
                None => *session.pending_id.get_or_insert_with(BlobId::new),
            };
            (id, session.content.clone().unwrap_or_default(), fields)
        };

        let vault = Arc::clone(&self.vault);
        let saved_fields = fields.clone();
        let job = async move {
            let now = Utc::now();
            let metadata = match vault.index.lookup(&id).await? {
                Some(existing) => existing.revised(fields, now),
                None => FileMetadata::new(fields, now),
            };
            let tag = metadata.rendered_display_name.clone();
            vault
                .records
                .save_encrypted(&id.to_string(), content.as_bytes())
                .await?;
            vault.index.upsert(id, metadata).await?;
            vault
                .ledger
                .record(
                    AuditEntry::new(AuditAction::SaveEncryptedRecord, id.to_string())
                        .with_tag(tag)
                        .with_details("manual save"),
                )
                .await;
            Ok::<_, VaultError>(())
        };
        self.queue.run(job).await??;

        let mut session = self.session();
        session.bound = Some(id);
        session.pending_id = None;
        session.fields = saved_fields;
        session.state = SessionState::Saved;
        Ok(id)
    }

    /// Decrypt a record and bind it so the next save updates it in place.
    pub async fn load_record(&self, id: BlobId) -> Result<LoadedRecord> {
        self.session().require(
            "load record",
            &[SessionState::Idle, SessionState::Editable, SessionState::Saved],
        )?;

        let bytes = self.vault.records.load_encrypted(&id.to_string()).await?;
        let content = String::from_utf8(bytes)
            .map_err(|e| VaultError::format(format!("record is not text: {e}")))?;
        let metadata = self.vault.index.lookup(&id).await?;
        let display_name = metadata
            .as_ref()
            .map(|m| m.rendered_display_name.clone())
            .unwrap_or_else(|| fallback_display_name(&id));

        {
            let mut session = self.session();
            *session = Session {
                state: SessionState::Editable,
                fields: metadata
                    .as_ref()
                    .map(|m| m.display_fields.clone())
                    .unwrap_or_default(),
                bound: Some(id),
                content: Some(content.clone()),
                ..Session::idle()
            };
        }
        self.audit(
            AuditEntry::new(AuditAction::LoadRecord, id.to_string())
                .with_tag(display_name.clone()),
        )
        .await;

        Ok(LoadedRecord {
            id,
            content,
            metadata,
            display_name,
        })
    }

    /// Remove a record and its index entry. Irreversible.
    ///
    /// The index entry goes first: a failure after it leaves an unindexed record,
    /// never an entry without a record.
    pub async fn delete_record(&self, id: BlobId) -> Result<()> {
        let vault = Arc::clone(&self.vault);
        let job = async move {
            let tag = vault.index.display_name_for(&id).await?;
            let had_entry = vault.index.remove(&id).await?;
            let had_blob = match vault.records.delete_encrypted(&id.to_string()).await {
                Ok(had_blob) => had_blob,
                Err(err) => {
                    if had_entry {
                        vault
                            .ledger
                            .record(
                                AuditEntry::new(
                                    AuditAction::DeleteEncryptedRecord,
                                    id.to_string(),
                                )
                                .with_tag(tag)
                                .with_details(format!("index entry removed; record kept: {err}")),
                            )
                            .await;
                    }
                    return Err(err);
                }
            };
            if !had_blob && !had_entry {
                return Err(VaultError::not_found(id.to_string()));
            }
            vault
                .ledger
                .record(
                    AuditEntry::new(AuditAction::DeleteEncryptedRecord, id.to_string())
                        .with_tag(tag),
                )
                .await;
            Ok::<_, VaultError>(())
        };
        self.queue.run(job).await??;

        let mut session = self.session();
        if session.bound == Some(id) {
            *session = Session::idle();
        }
        Ok(())
    }

    /// Every stored record, oldest first, named from the index or the fallback.
    pub async fn list_records(&self) -> Result<Vec<RecordSummary>> {
        let ids = self.vault.records.list_ids().await?;
        let mut index = self.vault.index.load().await?;
        let mut out = Vec::with_capacity(ids.len());
        for raw in ids {
            let Ok(id) = raw.parse::<BlobId>() else {
                warn!("skipping blob with a foreign id");
                continue;
            };
            let metadata = index.remove(&id);
            let display_name = metadata
                .as_ref()
                .map(|m| m.rendered_display_name.clone())
                .unwrap_or_else(|| fallback_display_name(&id));
            out.push(RecordSummary {
                id,
                display_name,
                metadata,
            });
        }
        Ok(out)
    }

    /// Delete every stashed raw capture. Refused while one is awaiting auto-save.
    pub async fn purge_captures(&self) -> Result<usize> {
        self.session().require(
            "purge captures",
            &[SessionState::Idle, SessionState::Editable, SessionState::Saved],
        )?;

        let vault = Arc::clone(&self.vault);
        let job = async move {
            let mut removed = 0;
            for id in vault.captures.list_ids().await? {
                if vault.captures.delete_encrypted(&id).await? {
                    removed += 1;
                }
            }
            vault
                .ledger
                .record(
                    AuditEntry::new(AuditAction::PurgeCaptures, "captures")
                        .with_details(format!("removed {removed}")),
                )
                .await;
            Ok::<_, VaultError>(removed)
        };
        self.queue.run(job).await?
    }

    /// Drop audit entries older than `retention`. Returns how many were removed.
    pub async fn prune_audit(&self, retention: Duration) -> Result<usize> {
        let retention = chrono::Duration::from_std(retention).map_err(|e| {
            VaultError::InvalidInput {
                reason: format!("retention out of range: {e}"),
            }
        })?;
        let cutoff = Utc::now() - retention;

        let vault = Arc::clone(&self.vault);
        let job = async move {
            let removed = vault.ledger.prune_older_than(cutoff).await?;
            vault
                .ledger
                .record(
                    AuditEntry::new(AuditAction::AuditPruned, "audit-ledger")
                        .with_details(format!("removed {removed} older than {cutoff}")),
                )
                .await;
            Ok::<_, VaultError>(removed)
        };
        self.queue.run(job).await?
    }

    /// Decrypt the ledger into `sink` for an external hand-off.
    pub async fn export_audit(&self, sink: &mut impl Write) -> Result<usize> {
        let count = self.vault.ledger.export_plaintext(sink).await?;
        self.audit(
            AuditEntry::new(AuditAction::AuditExported, "audit-ledger")
                .with_details(format!("{count} entries")),
        )
        .await;
        Ok(count)
    }

    async fn audit(&self, entry: AuditEntry) {
        let vault = Arc::clone(&self.vault);
        if let Err(err) = self
            .queue
            .run(async move { vault.ledger.record(entry).await })
            .await
        {
            warn!(error = %err, "audit entry dropped");
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn display_tag(fields: &DisplayFields) -> String {
    if fields.is_complete() {
        fields.render()
    } else {
        String::new()
    }
}
