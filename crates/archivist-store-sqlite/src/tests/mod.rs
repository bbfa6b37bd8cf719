//! Integration tests for `SqliteStore`.
//!
//! The hierarchy can only be populated through a reload, so most tests start
//! from [`seeded`], which loads [`plant`] into an in-memory store.

mod derived;
mod hierarchy;

use archivist_core::{
  archive::{IngestRow, RecordQuery},
  hierarchy::{AttributeId, AttributePath},
  snapshot::{Snapshot, SnapshotNode},
  store::HistorianStore,
};
use chrono::{DateTime, TimeZone, Utc};

use crate::{SqliteStore, StoreConfig, reload as phases};

pub(super) async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

/// ```text
/// Plant
/// ├── Unit1  [Temp, Flow]
/// └── Unit2  [Temp]
/// ```
pub(super) fn plant() -> Snapshot {
  Snapshot::new(vec![
    SnapshotNode::new("Plant")
      .with_child(
        SnapshotNode::new("Unit1")
          .with_attribute("Temp", Some("10HFE10CT001"))
          .with_attribute("Flow", None),
      )
      .with_child(SnapshotNode::new("Unit2").with_attribute("Temp", None)),
  ])
}

pub(super) async fn seeded() -> SqliteStore {
  let s = store().await;
  s.reload(plant()).await.expect("initial load");
  s
}

pub(super) async fn file_store(dir: &tempfile::TempDir) -> SqliteStore {
  let mut config = StoreConfig::new(dir.path().join("archive.db"));
  config.busy_timeout_ms = 30_000;
  SqliteStore::open_with_config(&config)
    .await
    .expect("file store")
}

pub(super) async fn attr(s: &SqliteStore, path: &str) -> AttributeId {
  let path = AttributePath::parse(path).expect("valid path");
  s.find_attribute_by_path(&path)
    .await
    .unwrap()
    .unwrap_or_else(|| panic!("no attribute at {path}"))
    .attribute_id
}

pub(super) fn ts(minute: u32) -> DateTime<Utc> {
  Utc.with_ymd_and_hms(2024, 5, 1, 8, minute, 0).unwrap()
}

pub(super) async fn write(s: &SqliteStore, rows: &[(AttributeId, u32, f64)]) {
  let rows = rows
    .iter()
    .map(|(id, minute, v)| IngestRow::new(*id, ts(*minute), *v))
    .collect();
  s.write_records(rows).await.unwrap();
}

/// `(minute, value)` pairs for one attribute, in time order.
pub(super) async fn values(s: &SqliteStore, id: AttributeId) -> Vec<(u32, Option<f64>)> {
  s.get_records(RecordQuery::all(id))
    .await
    .unwrap()
    .into_iter()
    .map(|r| ((r.timestamp - ts(0)).num_minutes() as u32, r.value))
    .collect()
}

/// Leave the store as a reload that crashed right after tearing down the
/// hierarchy would.
pub(super) async fn interrupt_after_teardown(s: &SqliteStore) {
  let cache = s.registry.clone();
  s.conn
    .call(move |conn| Ok(phases::begin(conn, &cache).map(|_| ())))
    .await
    .unwrap()
    .unwrap();
  s.conn
    .call(|conn| Ok(phases::teardown(conn)))
    .await
    .unwrap()
    .unwrap();
}
