use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "phivault",
    about = "Encrypted-at-rest custody for captured patient notes",
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print version and exit.
    Version,
    /// Unlock the key and round-trip a probe through the encrypted store.
    Health,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Provision the master key and create the data directory.
    Init,
    /// Work with encrypted records.
    #[command(subcommand)]
    Record(RecordCommand),
    /// Manage stashed raw captures.
    #[command(subcommand)]
    Captures(CapturesCommand),
    /// Export or prune the audit ledger.
    #[command(subcommand)]
    Audit(AuditCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct SubjectArgs {
    /// Subject name shown in record lists.
    #[arg(long)]
    pub name: String,
    /// Date of birth, YYYYMMDD.
    #[arg(long)]
    pub dob: String,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum RecordCommand {
    /// List stored records.
    List,
    /// Decrypt and print one record.
    Show { id: String },
    /// Ingest a raw capture, transcribe it and auto-save the result.
    Capture {
        #[command(flatten)]
        subject: SubjectArgs,
        /// Capture file; reads stdin when absent.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Save typed content, either as a new record or over an existing one.
    Save {
        #[command(flatten)]
        subject: SubjectArgs,
        /// Existing record to overwrite in place.
        #[arg(long)]
        id: Option<String>,
        /// Record content; reads stdin when absent.
        #[arg(long)]
        body: Option<String>,
    },
    /// Delete a record and its index entry. Irreversible.
    Delete {
        id: String,
        /// Skip the confirmation prompt.
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum CapturesCommand {
    /// Delete every stashed raw capture.
    Purge {
        #[arg(long)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum AuditCommand {
    /// Decrypt the ledger for a short-lived hand-off.
    Export {
        /// Write to stdout instead of a temporary file.
        #[arg(long)]
        stdout: bool,
    },
    /// Remove entries older than the retention window.
    Prune {
        /// Override the configured retention, in days.
        #[arg(long)]
        days: Option<u32>,
    },
}
