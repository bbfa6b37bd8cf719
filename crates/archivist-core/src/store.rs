//! The `HistorianStore` trait.
//!
//! Implemented by storage backends (e.g. `archivist-store-sqlite`). The
//! maintenance binary and any front end depend on this abstraction, not on a
//! concrete backend.

use std::{collections::BTreeMap, future::Future};

use chrono::{DateTime, Utc};

use crate::{
  archive::{ArchiveRecord, IngestRow, RecordQuery, WriteSummary},
  formula::Formula,
  hierarchy::{Attribute, AttributeId, AttributePath, Element, ElementId},
  registry::Registration,
  report::{
    AttributeUpdate, CreateReport, DeleteReport, NewDerivedAttribute, ReloadReport,
    StoreStats, UpdateReport,
  },
  snapshot::Snapshot,
};

/// Abstraction over a historian archive backend.
///
/// All methods return `Send` futures so the trait can be used in
/// multi-threaded async runtimes.
pub trait HistorianStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Hierarchy ─────────────────────────────────────────────────────────

  fn list_elements(
    &self,
  ) -> impl Future<Output = Result<Vec<Element>, Self::Error>> + Send + '_;

  fn get_element(
    &self,
    id: ElementId,
  ) -> impl Future<Output = Result<Option<Element>, Self::Error>> + Send + '_;

  /// All attributes, or only those on `element`.
  fn list_attributes(
    &self,
    element: Option<ElementId>,
  ) -> impl Future<Output = Result<Vec<Attribute>, Self::Error>> + Send + '_;

  fn get_attribute(
    &self,
    id: AttributeId,
  ) -> impl Future<Output = Result<Option<Attribute>, Self::Error>> + Send + '_;

  fn find_attribute_by_path<'a>(
    &'a self,
    path: &'a AttributePath,
  ) -> impl Future<Output = Result<Option<Attribute>, Self::Error>> + Send + 'a;

  /// Elements whose name matches a SQL `LIKE` pattern (`Fan%`, `%Motor%`),
  /// ignoring ASCII case. A pattern without wildcards is a name lookup.
  fn search_elements<'a>(
    &'a self,
    pattern: &'a str,
  ) -> impl Future<Output = Result<Vec<Element>, Self::Error>> + Send + 'a;

  /// Attributes whose name matches a `LIKE` pattern, optionally only those on
  /// `element`.
  fn search_attributes<'a>(
    &'a self,
    pattern: &'a str,
    element: Option<ElementId>,
  ) -> impl Future<Output = Result<Vec<Attribute>, Self::Error>> + Send + 'a;

  /// Full path (`Root|…|Attribute`) → attribute id, for resolving feed paths.
  fn attribute_map(
    &self,
  ) -> impl Future<Output = Result<BTreeMap<String, AttributeId>, Self::Error>> + Send + '_;

  // ── Archive ───────────────────────────────────────────────────────────

  /// Upsert a batch of source values and recompute affected derived values
  /// in the same transaction.
  fn write_records(
    &self,
    rows: Vec<IngestRow>,
  ) -> impl Future<Output = Result<WriteSummary, Self::Error>> + Send + '_;

  fn get_records(
    &self,
    query: RecordQuery,
  ) -> impl Future<Output = Result<Vec<ArchiveRecord>, Self::Error>> + Send + '_;

  fn timestamp_range(
    &self,
    id: AttributeId,
  ) -> impl Future<Output = Result<Option<(DateTime<Utc>, DateTime<Utc>)>, Self::Error>>
  + Send
  + '_;

  /// The newest timestamp in the whole archive; ingestion resumes after it.
  fn latest_timestamp(
    &self,
  ) -> impl Future<Output = Result<Option<DateTime<Utc>>, Self::Error>> + Send + '_;

  // ── Derived attributes ────────────────────────────────────────────────

  /// Parse `formula` and check that every referenced id exists. No mutation.
  fn validate_formula<'a>(
    &'a self,
    formula: &'a str,
  ) -> impl Future<Output = Result<Formula, Self::Error>> + Send + 'a;

  /// Insert the attribute, backfill it and activate live recomputation.
  fn create_derived_attribute(
    &self,
    input: NewDerivedAttribute,
  ) -> impl Future<Output = Result<CreateReport, Self::Error>> + Send + '_;

  fn update_attribute(
    &self,
    id: AttributeId,
    update: AttributeUpdate,
  ) -> impl Future<Output = Result<UpdateReport, Self::Error>> + Send + '_;

  fn delete_attribute(
    &self,
    id: AttributeId,
  ) -> impl Future<Output = Result<DeleteReport, Self::Error>> + Send + '_;

  /// Recompute every historical value of a derived attribute (and of the
  /// derived attributes built on it). Returns the number of rows changed.
  fn backfill(
    &self,
    id: AttributeId,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  fn get_registration(
    &self,
    id: AttributeId,
  ) -> impl Future<Output = Result<Option<Registration>, Self::Error>> + Send + '_;

  fn list_registrations(
    &self,
  ) -> impl Future<Output = Result<Vec<Registration>, Self::Error>> + Send + '_;

  // ── Maintenance ───────────────────────────────────────────────────────

  /// Rebuild the hierarchy from `snapshot`, carrying archive history and
  /// derived attributes across by path.
  fn reload(
    &self,
    snapshot: Snapshot,
  ) -> impl Future<Output = Result<ReloadReport, Self::Error>> + Send + '_;

  fn stats(&self) -> impl Future<Output = Result<StoreStats, Self::Error>> + Send + '_;
}
