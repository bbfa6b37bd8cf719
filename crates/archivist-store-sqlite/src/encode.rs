//! Encoding and decoding helpers between domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! Timestamps are stored as RFC 3339 UTC strings with exactly six fractional
//! digits and a `Z` suffix. Paths are stored as compact JSON.

use archivist_core::{
  archive::{ArchiveRecord, normalize_timestamp},
  hierarchy::{Attribute, AttributeId, AttributePath, Element, ElementId},
};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Row;

use crate::{Error, Result};

// ─── DateTime<Utc> ───────────────────────────────────────────────────────────

pub fn encode_ts(ts: DateTime<Utc>) -> String {
  normalize_timestamp(ts).to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn decode_ts(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}

// ─── Paths ───────────────────────────────────────────────────────────────────

pub fn encode_path(path: &AttributePath) -> Result<String> { Ok(serde_json::to_string(path)?) }

pub fn decode_path(s: &str) -> Result<AttributePath> { Ok(serde_json::from_str(s)?) }

pub fn encode_element_path(path: &[String]) -> Result<String> {
  Ok(serde_json::to_string(path)?)
}

pub fn decode_element_path(s: &str) -> Result<Vec<String>> { Ok(serde_json::from_str(s)?) }

// ─── Row mappers ─────────────────────────────────────────────────────────────

pub const ELEMENT_COLUMNS: &str = "element_id, name, level, parent_id";

pub fn element_from_row(row: &Row<'_>) -> rusqlite::Result<Element> {
  Ok(Element {
    element_id: ElementId(row.get(0)?),
    name:       row.get(1)?,
    level:      row.get(2)?,
    parent_id:  row.get::<_, Option<i64>>(3)?.map(ElementId),
  })
}

pub const ATTRIBUTE_COLUMNS: &str = "attribute_id, element_id, name, kks";

pub fn attribute_from_row(row: &Row<'_>) -> rusqlite::Result<Attribute> {
  Ok(Attribute {
    attribute_id: AttributeId(row.get(0)?),
    element_id:   ElementId(row.get(1)?),
    name:         row.get(2)?,
    kks:          row.get(3)?,
  })
}

/// Raw values read directly from an `archive` row.
pub struct RawArchiveRecord {
  pub archive_id:   i64,
  pub attribute_id: i64,
  pub timestamp:    String,
  pub value:        Option<f64>,
}

impl RawArchiveRecord {
  pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      archive_id:   row.get(0)?,
      attribute_id: row.get(1)?,
      timestamp:    row.get(2)?,
      value:        row.get(3)?,
    })
  }

  pub fn into_record(self) -> Result<ArchiveRecord> {
    Ok(ArchiveRecord {
      archive_id:   self.archive_id,
      attribute_id: AttributeId(self.attribute_id),
      timestamp:    decode_ts(&self.timestamp)?,
      value:        self.value,
    })
  }
}
