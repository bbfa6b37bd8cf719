//! Archive records and the ingestion feed's row shape.
//!
//! The archive is an upsert-only fact table keyed by
//! `(attribute_id, timestamp)`; at most one value exists per key.

use std::collections::HashSet;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::hierarchy::AttributeId;

/// Timestamps are kept at microsecond precision; anything finer is truncated
/// before it reaches a key comparison.
pub fn normalize_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> { ts.trunc_subsecs(6) }

// ─── Stored rows ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveRecord {
  pub archive_id:   i64,
  pub attribute_id: AttributeId,
  pub timestamp:    DateTime<Utc>,
  /// `None` when the historian reported no usable value.
  pub value:        Option<f64>,
}

/// Parameters for [`HistorianStore::get_records`](crate::store::HistorianStore::get_records).
/// Both bounds are inclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordQuery {
  pub attribute_id: AttributeId,
  pub start:        Option<DateTime<Utc>>,
  pub end:          Option<DateTime<Utc>>,
}

impl RecordQuery {
  pub fn all(attribute_id: AttributeId) -> Self {
    Self { attribute_id, start: None, end: None }
  }
}

// ─── Ingestion feed ──────────────────────────────────────────────────────────

/// A raw value as delivered by the historian.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IngestValue {
  Number(f64),
  Bool(bool),
  /// Anything else the historian sends (status objects, digital state
  /// strings, …).
  Other(serde_json::Value),
}

impl IngestValue {
  /// Numeric coercion: booleans map to 1/0, numeric strings are parsed, and
  /// everything else (including non-finite numbers) becomes `None`.
  pub fn as_f64(&self) -> Option<f64> {
    let v = match self {
      IngestValue::Number(n) => *n,
      IngestValue::Bool(b) => f64::from(u8::from(*b)),
      IngestValue::Other(serde_json::Value::String(s)) => s.trim().parse().ok()?,
      IngestValue::Other(_) => return None,
    };
    v.is_finite().then_some(v)
  }
}

impl From<f64> for IngestValue {
  fn from(v: f64) -> Self { IngestValue::Number(v) }
}

impl From<bool> for IngestValue {
  fn from(v: bool) -> Self { IngestValue::Bool(v) }
}

/// One `(attribute, timestamp, value)` row from the ingestion feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRow {
  pub attribute_id: AttributeId,
  pub timestamp:    DateTime<Utc>,
  #[serde(default)]
  pub value:        Option<IngestValue>,
}

impl IngestRow {
  pub fn new(
    attribute_id: AttributeId,
    timestamp: DateTime<Utc>,
    value: impl Into<IngestValue>,
  ) -> Self {
    Self { attribute_id, timestamp, value: Some(value.into()) }
  }

  pub fn numeric_value(&self) -> Option<f64> {
    self.value.as_ref().and_then(IngestValue::as_f64)
  }
}

/// Drop repeated `(attribute_id, timestamp)` keys, keeping the first
/// occurrence. Returns the surviving rows and the number removed.
pub fn dedup_first_wins(rows: Vec<IngestRow>) -> (Vec<IngestRow>, usize) {
  let before = rows.len();
  let mut seen = HashSet::with_capacity(before);
  let kept: Vec<IngestRow> = rows
    .into_iter()
    .map(|mut row| {
      row.timestamp = normalize_timestamp(row.timestamp);
      row
    })
    .filter(|row| seen.insert((row.attribute_id, row.timestamp)))
    .collect();
  let removed = before - kept.len();
  (kept, removed)
}

/// Outcome of one ingestion batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteSummary {
  pub received:        usize,
  /// Repeated keys dropped before writing.
  pub duplicates:      usize,
  /// Rows naming an attribute id that does not exist.
  pub skipped_unknown: usize,
  /// Rows naming a derived attribute; those values are computed, not fed.
  pub skipped_derived: usize,
  /// Source rows inserted or changed.
  pub written:         usize,
  /// Source rows identical to what was already stored.
  pub unchanged:       usize,
  /// Derived rows inserted or changed by live recomputation.
  pub derived_written: usize,
  /// Stale derived rows removed because a source became incomplete.
  pub derived_removed: usize,
}
