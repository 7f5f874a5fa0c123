use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use seqfold_kernel::{FileLogStore, LogConfig, Record, RecordStore, Sequence, SetStore};

/// Seqfold CLI
#[derive(Parser, Debug)]
#[command(name = "seqfold")]
#[command(about = "Inspect and edit keyed structures in a shared log", long_about = None)]
struct Cli {
    /// Path to log config JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the log file (overrides the config)
    #[arg(long)]
    log: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Last-writer-wins record
    #[command(subcommand)]
    Record(RecordCommand),

    /// Add/remove membership set
    #[command(subcommand)]
    Set(SetCommand),
}

#[derive(Subcommand, Debug)]
enum RecordCommand {
    /// Print the current record
    Get,

    /// Write fields given as key=value (value parsed as JSON if possible)
    Update {
        #[arg(required = true, value_parser = parse_field)]
        fields: Vec<(String, Value)>,

        /// Append even if nothing changes
        #[arg(long)]
        force: bool,
    },

    /// Rewrite blocking fields so the scan window shrinks
    Squeeze,

    /// Print window bookkeeping
    Stats,
}

#[derive(Subcommand, Debug)]
enum SetCommand {
    Add { item: String },
    Del { item: String },
    Has { item: String },
    /// Print present items
    Values,
    /// Re-add blocking items so the scan window shrinks
    Squeeze,
    /// Print window bookkeeping
    Stats,
}

/// Window bookkeeping output
#[derive(Debug, Serialize)]
struct Stats {
    oldest: Sequence,
    latest: Sequence,
    squeeze_potential: i64,
}

/// Outcome of a mutating command
#[derive(Debug, Serialize)]
struct Appended {
    appended: bool,
}

fn parse_field(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    if key.is_empty() {
        return Err(format!("empty key in `{raw}`"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.into()));
    Ok((key.to_string(), value))
}

fn print<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // ----------------------------
    // Load config
    // ----------------------------
    let mut config = if let Some(path) = &cli.config {
        let data = fs::read_to_string(path)?;
        serde_json::from_str::<LogConfig>(&data)?
    } else {
        LogConfig::default_config()
    };
    if let Some(path) = cli.log {
        config.path = path;
    }

    // ----------------------------
    // Open log
    // ----------------------------
    let log = Arc::new(FileLogStore::open(&config).await?);

    // ----------------------------
    // Run command
    // ----------------------------
    match cli.command {
        Command::Record(command) => {
            let store = RecordStore::load(log).await?;
            match command {
                RecordCommand::Get => print(&store.get().await?)?,
                RecordCommand::Update { fields, force } => {
                    let changes: Record = fields.into_iter().collect();
                    let appended = if force {
                        store.force_update(changes).await?
                    } else {
                        store.update(changes).await?
                    };
                    print(&Appended { appended })?
                }
                RecordCommand::Squeeze => print(&Appended {
                    appended: store.squeeze().await?,
                })?,
                RecordCommand::Stats => print(&Stats {
                    oldest: store.oldest().await?,
                    latest: store.latest().await?,
                    squeeze_potential: store.squeeze_potential().await?,
                })?,
            }
        }
        Command::Set(command) => {
            let store = SetStore::load(log).await?;
            match command {
                SetCommand::Add { item } => print(&Appended {
                    appended: store.add(&item).await?,
                })?,
                SetCommand::Del { item } => print(&Appended {
                    appended: store.del(&item).await?,
                })?,
                SetCommand::Has { item } => print(&store.has(&item).await?)?,
                SetCommand::Values => print(&store.values().await?)?,
                SetCommand::Squeeze => print(&Appended {
                    appended: store.squeeze().await?,
                })?,
                SetCommand::Stats => print(&Stats {
                    oldest: store.oldest().await?,
                    latest: store.latest().await?,
                    squeeze_potential: store.squeeze_potential().await?,
                })?,
            }
        }
    }

    Ok(())
}
