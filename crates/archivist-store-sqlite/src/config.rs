//! Explicit store configuration, passed in at construction.

use std::{path::PathBuf, time::Duration};

use serde::Deserialize;

/// SQLite journal mode applied when the store is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
  /// Lets ingestion workers on separate connections read while one writes.
  #[default]
  Wal,
  Delete,
}

impl JournalMode {
  pub(crate) fn pragma_value(self) -> &'static str {
    match self {
      JournalMode::Wal => "WAL",
      JournalMode::Delete => "DELETE",
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
  pub path:            PathBuf,
  /// Upper bound on how long a statement waits for another connection's
  /// write lock before failing with `SQLITE_BUSY`.
  #[serde(default = "default_busy_timeout_ms")]
  pub busy_timeout_ms: u64,
  #[serde(default)]
  pub journal_mode:    JournalMode,
}

fn default_busy_timeout_ms() -> u64 { 10_000 }

impl StoreConfig {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path:            path.into(),
      busy_timeout_ms: default_busy_timeout_ms(),
      journal_mode:    JournalMode::default(),
    }
  }

  pub fn busy_timeout(&self) -> Duration { Duration::from_millis(self.busy_timeout_ms) }
}
