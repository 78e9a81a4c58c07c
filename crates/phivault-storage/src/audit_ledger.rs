//! Encrypted append-only operational log.
//!
//! The ledger is a CSV document (`timestamp,action,subject,tag,details`) sealed as
//! one blob. Appends and prunes decrypt, rewrite and atomically replace the whole
//! document; entries are never reordered or edited in place.

use std::io::Write;

use chrono::{DateTime, SecondsFormat, Utc};
use phivault_core::{
    audit::{AuditAction, AuditEntry},
    storage::BlobStore,
    Result, VaultError,
};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument};

pub const LEDGER_DOCUMENT_ID: &str = "audit-ledger";
pub const LEDGER_HEADER: &str = "timestamp,action,subject,tag,details";
const COLUMNS: usize = 5;
const FAILURE_CHANNEL_CAPACITY: usize = 32;

/// Published when an audit row could not be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditFailure {
    pub action: AuditAction,
    pub subject_reference: String,
    pub reason: String,
}

pub struct AuditLedger<S> {
    store: S,
    failures: broadcast::Sender<AuditFailure>,
}

impl<S: BlobStore> AuditLedger<S> {
    pub fn new(store: S) -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self { store, failures }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Operator-visible notices for swallowed append failures.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<AuditFailure> {
        self.failures.subscribe()
    }

    pub async fn entries(&self) -> Result<Vec<AuditEntry>> {
        match self.load_document().await? {
            Some(text) => parse_document(&text),
            None => Ok(Vec::new()),
        }
    }

    #[instrument(skip_all, fields(action = %entry.action))]
    pub async fn append(&self, entry: AuditEntry) -> Result<()> {
        let mut text = self
            .load_document()
            .await?
            .unwrap_or_else(|| format!("{LEDGER_HEADER}\n"));
        push_row(&mut text, &entry);
        self.store
            .save_encrypted(LEDGER_DOCUMENT_ID, text.as_bytes())
            .await?;
        debug!("audit row appended");
        Ok(())
    }

    /// Append, reporting failure on the side channel instead of returning it.
    pub async fn record(&self, entry: AuditEntry) {
        let action = entry.action.clone();
        let subject_reference = entry.subject_reference.clone();
        if let Err(err) = self.append(entry).await {
            error!(%action, error = %err, "audit append failed");
            // No subscribers is fine; the error log above still stands.
            let _ = self.failures.send(AuditFailure {
                action,
                subject_reference,
                reason: err.to_string(),
            });
        }
    }

    /// Keep only entries at or after `cutoff`, in their original order. Returns how many were removed.
    #[instrument(skip_all, fields(cutoff = %cutoff))]
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let entries = self.entries().await?;
        let before = entries.len();
        let kept: Vec<AuditEntry> = entries
            .into_iter()
            .filter(|entry| entry.timestamp >= cutoff)
            .collect();
        let removed = before - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        let text = render_document(&kept);
        self.store
            .save_encrypted(LEDGER_DOCUMENT_ID, text.as_bytes())
            .await?;
        info!(removed, kept = kept.len(), "audit ledger pruned");
        Ok(removed)
    }

    /// Decrypt the ledger once into `sink`. Returns the number of entries written.
    pub async fn export_plaintext(&self, sink: &mut impl Write) -> Result<usize> {
        let text = self
            .load_document()
            .await?
            .unwrap_or_else(|| format!("{LEDGER_HEADER}\n"));
        let count = parse_document(&text)?.len();
        sink.write_all(text.as_bytes())?;
        sink.flush()?;
        Ok(count)
    }

    async fn load_document(&self) -> Result<Option<String>> {
        match self.store.load_encrypted(LEDGER_DOCUMENT_ID).await {
            Ok(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| VaultError::format(format!("audit ledger is not utf-8: {e}"))),
            Err(VaultError::NotFound { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

pub fn render_document(entries: &[AuditEntry]) -> String {
    let mut text = format!("{LEDGER_HEADER}\n");
    for entry in entries {
        push_row(&mut text, entry);
    }
    text
}

pub fn parse_document(text: &str) -> Result<Vec<AuditEntry>> {
    let mut rows = parse_rows(text)?.into_iter();
    match rows.next() {
        Some(header) if header.join(",") == LEDGER_HEADER => {}
        Some(_) => return Err(VaultError::format("audit ledger header missing")),
        None => return Ok(Vec::new()),
    }

    rows.enumerate()
        .map(|(idx, row)| -> Result<AuditEntry> {
            let [timestamp, action, subject, tag, details]: [String; COLUMNS] =
                row.try_into().map_err(|row: Vec<String>| {
                    VaultError::format(format!(
                        "audit row {} has {} fields, expected {COLUMNS}",
                        idx + 1,
                        row.len()
                    ))
                })?;
            let timestamp = DateTime::parse_from_rfc3339(&timestamp)
                .map_err(|e| VaultError::format(format!("audit row {}: {e}", idx + 1)))?
                .with_timezone(&Utc);
            Ok(AuditEntry::at(timestamp, AuditAction::parse(&action), subject)
                .with_tag(tag)
                .with_details(details))
        })
        .collect()
}

fn push_row(text: &mut String, entry: &AuditEntry) {
    let timestamp = entry.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
    let fields = [
        timestamp.as_str(),
        entry.action.as_str(),
        entry.subject_reference.as_str(),
        entry.tag.as_str(),
        entry.details.as_str(),
    ];
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            text.push(',');
        }
        push_field(text, field);
    }
    text.push('\n');
}

fn push_field(text: &mut String, field: &str) {
    if field.contains(&[',', '"', '\n', '\r'][..]) {
        text.push('"');
        text.push_str(&field.replace('"', "\"\""));
        text.push('"');
    } else {
        text.push_str(field);
    }
}

fn parse_rows(text: &str) -> Result<Vec<Vec<String>>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                other => field.push(other),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => in_quotes = true,
            ',' => row.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            other => field.push(other),
        }
    }

    if in_quotes {
        return Err(VaultError::format("audit ledger ends inside a quoted field"));
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    };

    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::{
        key_custodian::{KeyCustodian, UnlockProof},
        key_provider::InMemoryKeyBackend,
        secure_file_store::EncryptedFileStore,
    };

    async fn ledger(dir: &Path) -> AuditLedger<EncryptedFileStore> {
        let custodian = Arc::new(KeyCustodian::new(Arc::new(InMemoryKeyBackend::default())));
        custodian.unlock(UnlockProof::Presence).await.expect("unlock");
        AuditLedger::new(EncryptedFileStore::new(dir, custodian))
    }

    fn t(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 8, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn append_preserves_insertion_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger(dir.path()).await;
        assert!(ledger.entries().await.expect("empty").is_empty());

        ledger
            .append(AuditEntry::at(t(1), AuditAction::CaptureStart, "cap-1"))
            .await
            .expect("append");
        ledger
            .append(AuditEntry::at(t(2), AuditAction::CaptureStop, "cap-1"))
            .await
            .expect("append");

        let entries = ledger.entries().await.expect("entries");
        let actions: Vec<_> = entries.iter().map(|e| e.action.clone()).collect();
        assert_eq!(
            actions,
            vec![AuditAction::CaptureStart, AuditAction::CaptureStop]
        );
    }

    #[tokio::test]
    async fn prune_keeps_entries_at_or_after_cutoff() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger(dir.path()).await;
        for (minute, subject) in [(1, "first"), (2, "second"), (3, "third")] {
            ledger
                .append(AuditEntry::at(
                    t(minute),
                    AuditAction::SaveEncryptedRecord,
                    subject,
                ))
                .await
                .expect("append");
        }

        let removed = ledger
            .prune_older_than(t(1) + Duration::seconds(30))
            .await
            .expect("prune");
        assert_eq!(removed, 1);

        let subjects: Vec<_> = ledger
            .entries()
            .await
            .expect("entries")
            .into_iter()
            .map(|e| e.subject_reference)
            .collect();
        assert_eq!(subjects, vec!["second", "third"]);

        // cutoff equal to a timestamp keeps that entry
        assert_eq!(ledger.prune_older_than(t(2)).await.expect("prune"), 0);
    }

    #[tokio::test]
    async fn fields_with_separators_survive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger(dir.path()).await;
        let entry = AuditEntry::at(t(5), AuditAction::LoadRecord, "rec,1")
            .with_tag("Roe, Jane \"JR\"")
            .with_details("line one\nline two");
        ledger.append(entry.clone()).await.expect("append");

        assert_eq!(ledger.entries().await.expect("entries"), vec![entry]);
    }

    #[tokio::test]
    async fn export_writes_header_and_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = ledger(dir.path()).await;

        let mut empty = Vec::new();
        assert_eq!(ledger.export_plaintext(&mut empty).await.expect("export"), 0);
        assert_eq!(String::from_utf8(empty).unwrap(), format!("{LEDGER_HEADER}\n"));

        ledger
            .append(AuditEntry::at(t(0), AuditAction::Cleanup, "records").with_details("2"))
            .await
            .expect("append");
        let mut sink = Vec::new();
        assert_eq!(ledger.export_plaintext(&mut sink).await.expect("export"), 1);
        assert_eq!(
            String::from_utf8(sink).unwrap(),
            format!("{LEDGER_HEADER}\n2026-10-16T08:00:00.000Z,cleanup,records,,2\n")
        );
    }

    #[test]
    fn parser_rejects_wrong_column_count() {
        let text = format!("{LEDGER_HEADER}\n2026-10-16T08:00:00.000Z,cleanup\n");
        assert!(matches!(
            parse_document(&text),
            Err(VaultError::FormatError { .. })
        ));
    }

    #[test]
    fn parser_rejects_unterminated_quote() {
        let text = format!("{LEDGER_HEADER}\n2026-10-16T08:00:00.000Z,cleanup,\"open,,\n");
        assert!(parse_document(&text).is_err());
    }

    struct FailingStore {
        fail: AtomicBool,
    }

    #[async_trait]
    impl BlobStore for FailingStore {
        async fn save_encrypted(&self, _id: &str, _plaintext: &[u8]) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(VaultError::io("disk full"));
            }
            Ok(())
        }

        async fn load_encrypted(&self, id: &str) -> Result<Vec<u8>> {
            Err(VaultError::not_found(id))
        }

        async fn delete_encrypted(&self, _id: &str) -> Result<bool> {
            Ok(false)
        }

        async fn list_ids(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn record_swallows_failure_and_notifies() {
        let ledger = AuditLedger::new(FailingStore {
            fail: AtomicBool::new(true),
        });
        let mut failures = ledger.subscribe_failures();

        ledger
            .record(AuditEntry::new(AuditAction::DeleteEncryptedRecord, "rec-9"))
            .await;

        let notice = failures.recv().await.expect("notice");
        assert_eq!(notice.action, AuditAction::DeleteEncryptedRecord);
        assert_eq!(notice.subject_reference, "rec-9");
        assert!(notice.reason.contains("disk full"));

        ledger.store().fail.store(false, Ordering::SeqCst);
        ledger
            .record(AuditEntry::new(AuditAction::Cleanup, "records"))
            .await;
        assert!(failures.try_recv().is_err());
    }
}
