use color_eyre::Result;
use phivault_core::{
    records::{BlobId, DisplayFields},
    storage::BlobStore,
    transcribe::EchoTranscriber,
};
use phivault_session::{RecordSummary, SaveCoordinator};

use crate::{
    cli::{CapturesCommand, RecordCommand, SubjectArgs},
    config::Config,
    input,
    storage::{self, Session},
};

/// Execute a record subcommand against the encrypted vault.
pub async fn handle(cmd: RecordCommand, config: &Config) -> Result<()> {
    let session = storage::open_session(config).await?;
    run(cmd, &session, config).await
}

pub async fn handle_captures(cmd: CapturesCommand, config: &Config) -> Result<()> {
    let session = storage::open_session(config).await?;
    match cmd {
        CapturesCommand::Purge { yes } => {
            if !input::confirm("Delete every stashed raw capture?", yes)? {
                println!("Nothing deleted.");
                return Ok(());
            }
            let removed = session.coordinator.purge_captures().await?;
            println!("Removed {removed} capture(s).");
        }
    }
    Ok(())
}

async fn run(cmd: RecordCommand, session: &Session, config: &Config) -> Result<()> {
    let coordinator = &session.coordinator;
    match cmd {
        RecordCommand::List => {
            let records = coordinator.list_records().await?;
            if records.is_empty() {
                println!("No records yet. Add one with `phivault record capture`.");
                return Ok(());
            }
            for record in &records {
                println!("{}", summary_line(record));
            }
        }
        RecordCommand::Show { id } => {
            let loaded = coordinator.load_record(id.parse()?).await?;
            println!("{} ({})", loaded.display_name, loaded.id);
            println!();
            println!("{}", loaded.content);
        }
        RecordCommand::Capture { subject, file } => {
            let raw = input::read_capture(file.as_deref())?;
            let id = capture(coordinator, fields(&subject), &raw, config).await?;
            println!("Saved capture as {id}");
        }
        RecordCommand::Save { subject, id, body } => {
            let body = input::read_body(body)?;
            let id = save(coordinator, fields(&subject), id.as_deref(), body).await?;
            println!("Saved record {id}");
        }
        RecordCommand::Delete { id, yes } => {
            let id: BlobId = id.parse()?;
            if !input::confirm(&format!("Delete record {id}? This cannot be undone."), yes)? {
                println!("Nothing deleted.");
                return Ok(());
            }
            coordinator.delete_record(id).await?;
            println!("Deleted {id}");
        }
    }
    Ok(())
}

async fn capture<S: BlobStore + 'static>(
    coordinator: &SaveCoordinator<S>,
    fields: DisplayFields,
    raw: &[u8],
    config: &Config,
) -> Result<BlobId> {
    coordinator.start_capture(fields).await?;
    coordinator.stop_capture(raw).await?;
    let id = coordinator
        .transcribe_capture(&EchoTranscriber, config.transcription_timeout())
        .await?;
    Ok(id)
}

async fn save<S: BlobStore + 'static>(
    coordinator: &SaveCoordinator<S>,
    fields: DisplayFields,
    id: Option<&str>,
    body: String,
) -> Result<BlobId> {
    match id {
        Some(id) => {
            coordinator.load_record(id.parse()?).await?;
            coordinator.edit(body)?;
        }
        None => coordinator.start_draft(fields.clone(), body)?,
    }
    Ok(coordinator.save(Some(fields)).await?)
}

fn fields(subject: &SubjectArgs) -> DisplayFields {
    DisplayFields::new(subject.name.trim(), subject.dob.trim())
}

fn summary_line(record: &RecordSummary) -> String {
    let when = record
        .metadata
        .as_ref()
        .map(|m| m.updated_at.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string());
    format!("{}  {:<16}  {}", record.id, when, record.display_name)
}
