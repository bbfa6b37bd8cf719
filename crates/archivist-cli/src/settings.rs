//! Configuration for the `archivist` binary.
//!
//! Loaded from a TOML file plus `ARCHIVIST_*` environment variables:
//!
//! ```toml
//! busy_timeout_ms = 10000
//!
//! [[databases]]
//! name          = "plant_a"
//! store_path    = "~/archivist/plant_a.db"
//! snapshot_path = "~/archivist/plant_a_tree.json"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context as _, bail};
use archivist_store_sqlite::StoreConfig;
use serde::Deserialize;

/// One historian database the binary can operate on.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseProfile {
  pub name:          String,
  pub store_path:    PathBuf,
  /// Default snapshot document for `reload`.
  #[serde(default)]
  pub snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArchivistConfig {
  #[serde(default)]
  pub databases:       Vec<DatabaseProfile>,
  #[serde(default)]
  pub busy_timeout_ms: Option<u64>,
}

impl ArchivistConfig {
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let settings = config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(config::Environment::with_prefix("ARCHIVIST"))
      .build()
      .context("failed to read config file")?;
    settings
      .try_deserialize()
      .context("failed to deserialise ArchivistConfig")
  }

  /// The profile named `name`, or the only/first profile when no name is
  /// given.
  pub fn profile(&self, name: Option<&str>) -> anyhow::Result<&DatabaseProfile> {
    match name {
      Some(name) => self
        .databases
        .iter()
        .find(|db| db.name == name)
        .with_context(|| format!("no database named {name:?} in configuration")),
      None => match self.databases.first() {
        Some(db) => Ok(db),
        None => bail!("no databases configured"),
      },
    }
  }

  pub fn store_config(&self, profile: &DatabaseProfile) -> StoreConfig {
    let mut store = StoreConfig::new(expand_tilde(&profile.store_path));
    if let Some(ms) = self.busy_timeout_ms {
      store.busy_timeout_ms = ms;
    }
    store
  }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
