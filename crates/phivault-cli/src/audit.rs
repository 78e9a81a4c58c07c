use std::{io, time::Duration};

use color_eyre::Result;
use phivault_storage::export::PlaintextExport;
use tracing::warn;

use crate::{cli::AuditCommand, config::Config, storage};

const SECS_PER_DAY: u64 = 24 * 60 * 60;

pub async fn handle(cmd: AuditCommand, config: &Config) -> Result<()> {
    let session = storage::open_session(config).await?;
    let coordinator = &session.coordinator;

    match cmd {
        AuditCommand::Export { stdout: true } => {
            let mut out = io::stdout().lock();
            coordinator.export_audit(&mut out).await?;
        }
        AuditCommand::Export { stdout: false } => {
            let mut export = PlaintextExport::create(&session.layout.exports_dir(), "audit.csv")?;
            let count = coordinator.export_audit(&mut export).await?;
            let ttl = config.export_ttl();
            println!(
                "Exported {count} audit entries to {}",
                export.path().display()
            );
            println!(
                "The file is removed in {}s or on Ctrl-C, whichever comes first.",
                ttl.as_secs()
            );
            export
                .hold_until(ttl, async {
                    if let Err(err) = tokio::signal::ctrl_c().await {
                        warn!(error = %err, "cannot listen for Ctrl-C; waiting for the ttl");
                        std::future::pending::<()>().await;
                    }
                })
                .await?;
            println!("Export removed.");
        }
        AuditCommand::Prune { days } => {
            let days = days.unwrap_or_else(|| config.retention_days());
            let retention = Duration::from_secs(u64::from(days) * SECS_PER_DAY);
            let removed = coordinator.prune_audit(retention).await?;
            println!("Pruned {removed} audit entries older than {days} day(s).");
        }
    }
    Ok(())
}
