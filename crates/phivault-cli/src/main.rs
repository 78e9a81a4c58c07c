mod audit;
mod cli;
mod config;
mod input;
mod records;
mod storage;

use clap::Parser;
use color_eyre::Result;
use phivault_core::storage::BlobStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::cli::{Command, ConfigCommand};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    let cli = cli::Cli::parse();
    let config = config::load()?;
    match cli.command {
        Command::Version => print_version(),
        Command::Health => run_health_check(&config).await?,
        Command::Config(ConfigCommand::Init) => init_config(&config)?,
        Command::Init => init_vault(&config).await?,
        Command::Record(cmd) => records::handle(cmd, &config).await?,
        Command::Captures(cmd) => records::handle_captures(cmd, &config).await?,
        Command::Audit(cmd) => audit::handle(cmd, &config).await?,
    }

    Ok(())
}

fn init_tracing() {
    // Respect user-provided filters, default to info to avoid noisy stdout.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("phivault {}", env!("CARGO_PKG_VERSION"));
}

/// Unlocks the key and round-trips a probe through the encrypted record store.
async fn run_health_check(config: &config::Config) -> Result<()> {
    let session = storage::open_session(config).await?;
    run_store_health(&session.coordinator.vault().records).await?;
    println!(
        "Key backend: {} ({:?})",
        session.custodian.backend_name(),
        session.custodian.state()
    );
    println!("Storage: ok");
    Ok(())
}

async fn run_store_health<S: BlobStore>(store: &S) -> Result<()> {
    let probe_id = "health/probe";
    let payload = b"ok";
    store.save_encrypted(probe_id, payload).await?;
    let round_trip = store.load_encrypted(probe_id).await?;
    store.delete_encrypted(probe_id).await?;

    if round_trip != payload {
        color_eyre::eyre::bail!("storage round-trip failed");
    }
    Ok(())
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}

/// Creating the session provisions the master key (and the passphrase keystore when configured).
async fn init_vault(config: &config::Config) -> Result<()> {
    let session = storage::open_session(config).await?;
    println!(
        "Vault ready at {} (key backend: {})",
        session.layout.root().display(),
        session.custodian.backend_name()
    );
    Ok(())
}
