//! Subcommand implementations, generic over any [`HistorianStore`].
//!
//! Each command returns a JSON value; `main` prints it.

use std::{collections::HashMap, path::Path};

use anyhow::Context as _;
use archivist_core::{
  archive::IngestRow,
  hierarchy::{AttributeId, ElementId},
  report::{AttributeUpdate, NewDerivedAttribute},
  snapshot::Snapshot,
  store::HistorianStore,
};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

fn to_json(value: impl Serialize) -> anyhow::Result<Value> {
  serde_json::to_value(value).context("failed to serialise output")
}

fn read(path: &Path) -> anyhow::Result<String> {
  std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}

pub async fn reload<S: HistorianStore>(store: &S, snapshot_path: &Path) -> anyhow::Result<Value> {
  let snapshot = Snapshot::from_json(&read(snapshot_path)?)
    .with_context(|| format!("invalid snapshot document {}", snapshot_path.display()))?;
  info!(
    elements = snapshot.element_count(),
    attributes = snapshot.attribute_count(),
    "snapshot loaded"
  );
  to_json(store.reload(snapshot).await?)
}

/// Write a JSON array of rows in batches of `batch_size`, one transaction per
/// batch.
pub async fn ingest<S: HistorianStore>(
  store: &S,
  file: &Path,
  batch_size: usize,
) -> anyhow::Result<Value> {
  let rows: Vec<IngestRow> = serde_json::from_str(&read(file)?)
    .with_context(|| format!("invalid ingest file {}", file.display()))?;

  let mut totals = archivist_core::archive::WriteSummary::default();
  let mut rows = rows.into_iter().peekable();
  while rows.peek().is_some() {
    let batch: Vec<IngestRow> = rows.by_ref().take(batch_size.max(1)).collect();
    let summary = store.write_records(batch).await?;
    totals.received += summary.received;
    totals.duplicates += summary.duplicates;
    totals.skipped_unknown += summary.skipped_unknown;
    totals.skipped_derived += summary.skipped_derived;
    totals.written += summary.written;
    totals.unchanged += summary.unchanged;
    totals.derived_written += summary.derived_written;
    totals.derived_removed += summary.derived_removed;
  }
  to_json(totals)
}

pub async fn create_derived<S: HistorianStore>(
  store: &S,
  element_id: i64,
  name: String,
  kks: Option<String>,
  formula: String,
) -> anyhow::Result<Value> {
  let input = NewDerivedAttribute { element_id: ElementId(element_id), name, kks, formula };
  to_json(store.create_derived_attribute(input).await?)
}

pub async fn update_attribute<S: HistorianStore>(
  store: &S,
  id: i64,
  update: AttributeUpdate,
) -> anyhow::Result<Value> {
  to_json(store.update_attribute(AttributeId(id), update).await?)
}

pub async fn delete_attribute<S: HistorianStore>(store: &S, id: i64) -> anyhow::Result<Value> {
  to_json(store.delete_attribute(AttributeId(id)).await?)
}

pub async fn validate_formula<S: HistorianStore>(
  store: &S,
  formula: &str,
) -> anyhow::Result<Value> {
  let compiled = store.validate_formula(formula).await?;
  Ok(json!({
    "formula": compiled.text(),
    "sources": compiled.sources(),
  }))
}

pub async fn backfill<S: HistorianStore>(store: &S, id: i64) -> anyhow::Result<Value> {
  let changed = store.backfill(AttributeId(id)).await?;
  Ok(json!({ "attribute_id": id, "archive_records_changed": changed }))
}

pub async fn attribute_map<S: HistorianStore>(store: &S) -> anyhow::Result<Value> {
  to_json(store.attribute_map().await?)
}

/// Elements and attributes whose names match `pattern` (`%` and `_` are
/// wildcards). Attributes carry their full path when it is unambiguous.
pub async fn lookup<S: HistorianStore>(
  store: &S,
  pattern: &str,
  element: Option<i64>,
) -> anyhow::Result<Value> {
  let element = element.map(ElementId);
  // Narrowed to one element, only attributes are of interest.
  let elements = match element {
    Some(_) => Vec::new(),
    None => store.search_elements(pattern).await?,
  };
  let paths: HashMap<AttributeId, String> =
    store.attribute_map().await?.into_iter().map(|(path, id)| (id, path)).collect();
  let attributes: Vec<Value> = store
    .search_attributes(pattern, element)
    .await?
    .into_iter()
    .map(|a| {
      let path = paths.get(&a.attribute_id).cloned();
      json!({ "attribute": a, "path": path })
    })
    .collect();
  Ok(json!({ "elements": elements, "attributes": attributes }))
}

pub async fn stats<S: HistorianStore>(store: &S) -> anyhow::Result<Value> {
  let stats = store.stats().await?;
  let latest = store.latest_timestamp().await?;
  Ok(json!({ "stats": stats, "latest_timestamp": latest }))
}
