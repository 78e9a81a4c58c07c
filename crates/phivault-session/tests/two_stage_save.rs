use std::{path::Path, sync::Arc, time::Duration};

use chrono::{TimeZone, Utc};
use phivault_core::{
    audit::{AuditAction, AuditEntry},
    records::DisplayFields,
    storage::BlobStore,
    transcribe::EchoTranscriber,
    VaultError,
};
use phivault_session::{SaveCoordinator, SessionState};
use phivault_storage::{
    key_provider::InMemoryKeyBackend, EncryptedFileStore, KeyCustodian, UnlockProof, Vault,
    VaultLayout,
};

async fn open(
    dir: &Path,
    backend: &InMemoryKeyBackend,
) -> (SaveCoordinator<EncryptedFileStore>, Arc<KeyCustodian>) {
    let custodian = Arc::new(KeyCustodian::new(Arc::new(backend.clone())));
    custodian.unlock(UnlockProof::Presence).await.expect("unlock");
    let vault = Vault::open(&VaultLayout::new(dir), Arc::clone(&custodian))
        .await
        .expect("open vault");
    (SaveCoordinator::new(vault), custodian)
}

fn jane() -> DisplayFields {
    DisplayFields::new("Jane Roe", "19800214")
}

#[tokio::test]
async fn manual_save_overwrites_the_auto_saved_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = InMemoryKeyBackend::default();
    let (coordinator, _custodian) = open(dir.path(), &backend).await;

    coordinator.start_capture(jane()).await.expect("start");
    coordinator.stop_capture(b"draft v1").await.expect("stop");
    let id = coordinator
        .transcribe_capture(&EchoTranscriber, Duration::from_secs(5))
        .await
        .expect("auto-save");

    coordinator.edit("draft v2").expect("edit");
    let saved = coordinator.save(None).await.expect("manual save");
    assert_eq!(saved, id);
    assert_eq!(coordinator.state(), SessionState::Saved);

    let vault = coordinator.vault();
    assert_eq!(vault.records.list_ids().await.expect("list"), vec![id.to_string()]);
    assert_eq!(
        vault.records.load_encrypted(&id.to_string()).await.expect("load"),
        b"draft v2"
    );
    assert_eq!(vault.index.load().await.expect("index").len(), 1);
    assert!(vault.captures.list_ids().await.expect("captures").is_empty());
}

#[tokio::test]
async fn abandoned_session_still_has_a_durable_copy() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = InMemoryKeyBackend::default();

    let id = {
        let (coordinator, _custodian) = open(dir.path(), &backend).await;
        coordinator.start_capture(jane()).await.expect("start");
        coordinator.stop_capture(b"dictated note").await.expect("stop");
        coordinator
            .transcribe_capture(&EchoTranscriber, Duration::from_secs(5))
            .await
            .expect("auto-save")
        // operator walks away without saving
    };

    let (coordinator, _custodian) = open(dir.path(), &backend).await;
    let records = coordinator.list_records().await.expect("list");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, id);
    assert_eq!(records[0].display_name, "Jane Roe - 02/14/1980");

    let loaded = coordinator.load_record(id).await.expect("load");
    assert_eq!(loaded.content, "dictated note");
}

#[tokio::test]
async fn reloaded_record_saves_in_place() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = InMemoryKeyBackend::default();
    let (coordinator, _custodian) = open(dir.path(), &backend).await;

    coordinator.start_capture(jane()).await.expect("start");
    let id = coordinator
        .complete_capture("first".into())
        .await
        .expect("auto-save");
    let created = coordinator
        .vault()
        .index
        .lookup(&id)
        .await
        .expect("lookup")
        .expect("indexed")
        .created_at;

    coordinator.start_capture(jane()).await.expect("second capture");
    let other = coordinator
        .complete_capture("second".into())
        .await
        .expect("auto-save");
    assert_ne!(other, id);

    coordinator.load_record(id).await.expect("reload");
    assert_eq!(coordinator.bound_record(), Some(id));
    coordinator.edit("first, amended").expect("edit");
    coordinator
        .save(Some(DisplayFields::new("Jane A Roe", "19800214")))
        .await
        .expect("save");

    let records = coordinator.list_records().await.expect("list");
    assert_eq!(records.len(), 2);
    let meta = coordinator
        .vault()
        .index
        .lookup(&id)
        .await
        .expect("lookup")
        .expect("indexed");
    assert_eq!(meta.created_at, created);
    assert_eq!(meta.rendered_display_name, "Jane A Roe - 02/14/1980");
}

#[tokio::test]
async fn locked_key_fails_fast_and_keeps_content() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = InMemoryKeyBackend::default();
    let (coordinator, custodian) = open(dir.path(), &backend).await;

    coordinator.start_capture(jane()).await.expect("start");
    custodian.lock();
    let err = coordinator
        .complete_capture("unsaved work".into())
        .await
        .expect_err("locked");
    assert_eq!(err, VaultError::KeyLocked);
    assert_eq!(coordinator.content().as_deref(), Some("unsaved work"));
    assert_eq!(coordinator.state(), SessionState::PendingAutoSave);

    custodian.unlock(UnlockProof::Presence).await.expect("unlock");
    let id = coordinator.retry_auto_save().await.expect("retry");
    assert_eq!(
        coordinator
            .vault()
            .records
            .load_encrypted(&id.to_string())
            .await
            .expect("load"),
        b"unsaved work"
    );
}

#[tokio::test]
async fn delete_removes_blob_and_index_entry() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = InMemoryKeyBackend::default();
    let (coordinator, _custodian) = open(dir.path(), &backend).await;

    coordinator.start_capture(jane()).await.expect("start");
    let id = coordinator.complete_capture("note".into()).await.expect("save");
    coordinator.delete_record(id).await.expect("delete");

    let vault = coordinator.vault();
    assert!(vault.records.list_ids().await.expect("list").is_empty());
    assert_eq!(vault.index.lookup(&id).await.expect("lookup"), None);
    assert_eq!(
        vault.records.load_encrypted(&id.to_string()).await.unwrap_err(),
        VaultError::not_found(id.to_string())
    );

    let actions: Vec<_> = vault
        .ledger
        .entries()
        .await
        .expect("entries")
        .into_iter()
        .map(|e| e.action)
        .collect();
    assert_eq!(actions.last(), Some(&AuditAction::DeleteEncryptedRecord));
}

#[tokio::test]
async fn prune_keeps_the_two_newest_of_three() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = InMemoryKeyBackend::default();
    let (coordinator, _custodian) = open(dir.path(), &backend).await;
    let ledger = &coordinator.vault().ledger;

    let t1 = Utc.with_ymd_and_hms(2026, 10, 1, 8, 0, 0).unwrap();
    let t2 = Utc.with_ymd_and_hms(2026, 10, 2, 8, 0, 0).unwrap();
    let t3 = Utc.with_ymd_and_hms(2026, 10, 3, 8, 0, 0).unwrap();
    for (ts, subject) in [(t1, "one"), (t2, "two"), (t3, "three")] {
        ledger
            .append(AuditEntry::at(ts, AuditAction::LoadRecord, subject))
            .await
            .expect("append");
    }

    let cutoff = Utc.with_ymd_and_hms(2026, 10, 1, 20, 0, 0).unwrap();
    assert_eq!(ledger.prune_older_than(cutoff).await.expect("prune"), 1);
    let subjects: Vec<_> = ledger
        .entries()
        .await
        .expect("entries")
        .into_iter()
        .map(|e| e.subject_reference)
        .collect();
    assert_eq!(subjects, vec!["two", "three"]);
}

#[tokio::test]
async fn wiped_key_store_is_fatal_for_existing_records() {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = InMemoryKeyBackend::default();
    let (coordinator, _custodian) = open(dir.path(), &backend).await;

    coordinator.start_capture(jane()).await.expect("start");
    let id = coordinator.complete_capture("note".into()).await.expect("save");

    backend.reset();
    let err = coordinator.load_record(id).await.expect_err("key gone");
    assert!(err.is_fatal());
}
