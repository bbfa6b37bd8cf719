//! The ingestion write path and archive reads.

use std::collections::HashMap;

use archivist_core::{
  archive::{ArchiveRecord, IngestRow, RecordQuery, WriteSummary, dedup_first_wins},
  hierarchy::AttributeId,
  registry::Registry,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, warn};

use crate::{
  Result,
  encode::{RawArchiveRecord, decode_ts, encode_ts},
  engine::{self, RegistryCache},
  hierarchy,
};

/// How an incoming row's attribute id is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
  Source,
  Derived,
  Unknown,
}

/// Classify `id` against the live hierarchy and, while a reload is running,
/// against the reload journal so values that arrive mid-reload are kept for
/// the remap.
fn classify(conn: &Connection, registry: &Registry, id: AttributeId) -> Result<Target> {
  if registry.is_derived(id) {
    return Ok(Target::Derived);
  }
  let mut derived = conn.prepare_cached(
    "SELECT 1 FROM reload_derived WHERE old_attribute_id = ?1 OR new_attribute_id = ?1",
  )?;
  if derived.exists(rusqlite::params![id.0])? {
    return Ok(Target::Derived);
  }
  if hierarchy::attribute_exists(conn, id)? {
    return Ok(Target::Source);
  }
  let mut journaled =
    conn.prepare_cached("SELECT 1 FROM reload_paths WHERE old_attribute_id = ?1")?;
  if journaled.exists(rusqlite::params![id.0])? {
    return Ok(Target::Source);
  }
  Ok(Target::Unknown)
}

/// Whether a reload has started and not yet finished.
pub fn reload_pending(conn: &Connection) -> Result<bool> {
  Ok(conn.prepare_cached("SELECT 1 FROM reload_runs")?.exists([])?)
}

/// Write one ingestion batch in a single transaction.
///
/// Rows are deduplicated (first occurrence wins), rows for unknown or derived
/// attributes are skipped and counted, and every changed source value is
/// followed by recomputation of the derived values that read it.
pub fn write_batch(
  conn: &mut Connection,
  cache: &RegistryCache,
  rows: Vec<IngestRow>,
) -> Result<WriteSummary> {
  // Rows for pre-reload ids are legal while a reload is running but fail the
  // foreign key, which SQLite only lets us toggle outside a transaction.
  let enforced: bool = conn.pragma_query_value(None, "foreign_keys", |r| r.get(0))?;
  let relax = enforced && reload_pending(conn)?;
  if relax {
    conn.pragma_update(None, "foreign_keys", false)?;
  }
  let result = write_in_transaction(conn, cache, rows);
  if relax {
    conn.pragma_update(None, "foreign_keys", true)?;
  }
  result
}

fn write_in_transaction(
  conn: &mut Connection,
  cache: &RegistryCache,
  rows: Vec<IngestRow>,
) -> Result<WriteSummary> {
  let mut summary = WriteSummary { received: rows.len(), ..WriteSummary::default() };
  let (rows, duplicates) = dedup_first_wins(rows);
  summary.duplicates = duplicates;

  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  let registry = cache.current(&tx)?;

  let mut targets: HashMap<AttributeId, Target> = HashMap::new();
  let mut changed = Vec::new();
  for row in rows {
    let target = match targets.get(&row.attribute_id) {
      Some(t) => *t,
      None => {
        let t = classify(&tx, &registry, row.attribute_id)?;
        targets.insert(row.attribute_id, t);
        t
      }
    };
    match target {
      Target::Unknown => summary.skipped_unknown += 1,
      Target::Derived => summary.skipped_derived += 1,
      Target::Source => {
        let ts = encode_ts(row.timestamp);
        if engine::upsert_value(&tx, row.attribute_id, &ts, row.numeric_value())? {
          summary.written += 1;
          changed.push((row.attribute_id, ts));
        } else {
          summary.unchanged += 1;
        }
      }
    }
  }

  engine::propagate(&tx, &registry, changed, &mut summary)?;
  tx.commit()?;

  if summary.skipped_unknown + summary.skipped_derived > 0 {
    warn!(
      unknown = summary.skipped_unknown,
      derived = summary.skipped_derived,
      "skipped rows that do not name a source attribute"
    );
  }
  debug!(
    received = summary.received,
    written = summary.written,
    derived_written = summary.derived_written,
    skipped = summary.skipped_unknown + summary.skipped_derived,
    "batch committed"
  );
  Ok(summary)
}

pub fn get_records(conn: &Connection, query: &RecordQuery) -> Result<Vec<ArchiveRecord>> {
  let start = query.start.map(encode_ts);
  let end = query.end.map(encode_ts);
  let mut stmt = conn.prepare(
    "SELECT archive_id, attribute_id, timestamp, value FROM archive
     WHERE attribute_id = ?1
       AND (?2 IS NULL OR timestamp >= ?2)
       AND (?3 IS NULL OR timestamp <= ?3)
     ORDER BY timestamp",
  )?;
  let raws = stmt
    .query_map(
      rusqlite::params![query.attribute_id.0, start, end],
      RawArchiveRecord::from_row,
    )?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  raws.into_iter().map(RawArchiveRecord::into_record).collect()
}

pub fn timestamp_range(
  conn: &Connection,
  id: AttributeId,
) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
  let (first, last): (Option<String>, Option<String>) = conn.query_row(
    "SELECT MIN(timestamp), MAX(timestamp) FROM archive WHERE attribute_id = ?1",
    rusqlite::params![id.0],
    |r| Ok((r.get(0)?, r.get(1)?)),
  )?;
  match (first, last) {
    (Some(first), Some(last)) => Ok(Some((decode_ts(&first)?, decode_ts(&last)?))),
    _ => Ok(None),
  }
}

pub fn latest_timestamp(conn: &Connection) -> Result<Option<DateTime<Utc>>> {
  let last: Option<String> =
    conn.query_row("SELECT MAX(timestamp) FROM archive", [], |r| r.get(0))?;
  last.as_deref().map(decode_ts).transpose()
}
