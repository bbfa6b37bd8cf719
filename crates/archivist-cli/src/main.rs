//! `archivist` maintenance binary.
//!
//! Reads `archivist.toml` (or the path given with `--config`), opens the
//! SQLite store of the selected database profile and runs one maintenance
//! command against it. Results are printed to stdout as JSON; logs go to
//! stderr.

mod commands;
mod settings;

use std::path::PathBuf;

use anyhow::Context as _;
use archivist_core::report::AttributeUpdate;
use archivist_store_sqlite::SqliteStore;
use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::settings::{ArchivistConfig, expand_tilde};

#[derive(Parser)]
#[command(author, version, about = "Archivist historian archive maintenance")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "archivist.toml")]
  config: PathBuf,

  /// Database profile to operate on; defaults to the first configured one.
  #[arg(short, long)]
  database: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Rebuild the hierarchy from a snapshot, keeping history by path.
  Reload {
    /// Snapshot document; defaults to the profile's `snapshot_path`.
    #[arg(long)]
    snapshot: Option<PathBuf>,
  },
  /// Write archive rows from a JSON array of
  /// `{attribute_id, timestamp, value}` objects.
  Ingest {
    #[arg(long)]
    file:       PathBuf,
    #[arg(long, default_value_t = 10_000)]
    batch_size: usize,
  },
  /// Create a derived attribute and backfill it.
  CreateDerived {
    #[arg(long)]
    element: i64,
    #[arg(long)]
    name:    String,
    #[arg(long)]
    kks:     Option<String>,
    /// Arithmetic over `$N` attribute ids, e.g. `($7 + $8) / 2`.
    #[arg(long)]
    formula: String,
  },
  /// Change the name, KKS code or formula of an attribute.
  UpdateAttribute {
    id:                  i64,
    #[arg(long)]
    name:                Option<String>,
    #[arg(long)]
    kks:                 Option<String>,
    #[arg(long)]
    formula:             Option<String>,
    /// Keep previously derived rows instead of recomputing them.
    #[arg(long)]
    no_recompute:        bool,
    /// Do not reinstall live recomputation for the new formula.
    #[arg(long)]
    no_recreate_trigger: bool,
  },
  /// Delete an attribute and its archive history.
  DeleteAttribute { id: i64 },
  /// Parse a formula and check its ids without changing anything.
  ValidateFormula { formula: String },
  /// Recompute the history of a derived attribute.
  Backfill { id: i64 },
  /// Find elements and attributes by name; `%` and `_` are wildcards.
  Lookup {
    pattern: String,
    /// Only search attributes on this element.
    #[arg(long)]
    element: Option<i64>,
  },
  /// Print the path → attribute id mapping used by the ingestion feed.
  AttributeMap,
  /// Print row counts and the newest archived timestamp.
  Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();

  let config = ArchivistConfig::load(&cli.config)?;
  let profile = config.profile(cli.database.as_deref())?;
  let store_config = config.store_config(profile);

  let store = SqliteStore::open_with_config(&store_config)
    .await
    .with_context(|| format!("failed to open store at {:?}", store_config.path))?;
  tracing::debug!(database = %profile.name, "store ready");

  let result = match cli.command {
    Command::Reload { snapshot } => {
      let path = snapshot
        .or_else(|| profile.snapshot_path.clone())
        .context("no --snapshot given and the profile has no snapshot_path")?;
      commands::reload(&store, &expand_tilde(&path)).await
    }
    Command::Ingest { file, batch_size } => commands::ingest(&store, &file, batch_size).await,
    Command::CreateDerived { element, name, kks, formula } => {
      commands::create_derived(&store, element, name, kks, formula).await
    }
    Command::UpdateAttribute {
      id,
      name,
      kks,
      formula,
      no_recompute,
      no_recreate_trigger,
    } => {
      let update = AttributeUpdate {
        name,
        kks,
        formula,
        recompute_archive: !no_recompute,
        recreate_trigger: !no_recreate_trigger,
      };
      commands::update_attribute(&store, id, update).await
    }
    Command::DeleteAttribute { id } => commands::delete_attribute(&store, id).await,
    Command::ValidateFormula { formula } => commands::validate_formula(&store, &formula).await,
    Command::Backfill { id } => commands::backfill(&store, id).await,
    Command::Lookup { pattern, element } => commands::lookup(&store, &pattern, element).await,
    Command::AttributeMap => commands::attribute_map(&store).await,
    Command::Stats => commands::stats(&store).await,
  };

  match result {
    Ok(output) => {
      println!("{}", serde_json::to_string_pretty(&output)?);
      Ok(())
    }
    Err(e) => {
      // A partially applied update still reports what it did.
      if let Some(archivist_store_sqlite::Error::PartialUpdate { report, .. }) =
        e.downcast_ref::<archivist_store_sqlite::Error>()
      {
        println!("{}", serde_json::to_string_pretty(report)?);
      }
      Err(e)
    }
  }
}
