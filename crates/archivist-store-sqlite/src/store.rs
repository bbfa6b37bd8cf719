//! [`SqliteStore`] — the SQLite implementation of [`HistorianStore`].

use std::{collections::BTreeMap, path::Path, sync::Arc, time::Duration};

use archivist_core::{
  archive::{ArchiveRecord, IngestRow, RecordQuery, WriteSummary},
  formula::Formula,
  hierarchy::{Attribute, AttributeId, AttributePath, Element, ElementId},
  registry::Registration,
  report::{
    AttributeUpdate, CreateReport, DeleteReport, NewDerivedAttribute, ReloadReport,
    StoreStats, UpdateReport,
  },
  snapshot::Snapshot,
  store::HistorianStore,
};
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::{Instrument as _, Span, debug, error, field, info, info_span, warn};

use crate::{
  Error, Result,
  archive,
  config::{JournalMode, StoreConfig},
  derived,
  engine::{self, RegistryCache},
  hierarchy::{self, PathIndex},
  reload,
  schema::{HIERARCHY, SCHEMA},
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A historian archive backed by a single SQLite file.
///
/// Cloning is cheap: the connection, registry cache and maintenance lock are
/// all shared. Separate `open` calls on the same file get separate
/// connections; they stay consistent through the database, but a reload only
/// excludes concurrent hierarchy changes made through the same store.
#[derive(Clone)]
pub struct SqliteStore {
  pub(crate) conn:        tokio_rusqlite::Connection,
  pub(crate) registry:    RegistryCache,
  /// Held exclusively by a reload, shared by hierarchy and formula changes.
  /// Archive writes do not take it.
  pub(crate) maintenance: Arc<RwLock<()>>,
  /// Held for the whole of a reload.
  pub(crate) reload_gate: Arc<Mutex<()>>,
}

impl SqliteStore {
  /// Open (or create) a store at `path` with default settings.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    Self::open_with_config(&StoreConfig::new(path.as_ref())).await
  }

  pub async fn open_with_config(config: &StoreConfig) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(&config.path).await?;
    let store = Self::from_connection(conn);
    store
      .init_schema(config.busy_timeout(), Some(config.journal_mode))
      .await?;
    debug!(path = %config.path.display(), "store opened");
    Ok(store)
  }

  /// Open an in-memory store — useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self::from_connection(conn);
    store.init_schema(Duration::ZERO, None).await?;
    Ok(store)
  }

  fn from_connection(conn: tokio_rusqlite::Connection) -> Self {
    Self {
      conn,
      registry: RegistryCache::default(),
      maintenance: Arc::new(RwLock::new(())),
      reload_gate: Arc::new(Mutex::new(())),
    }
  }

  async fn init_schema(&self, busy_timeout: Duration, journal: Option<JournalMode>) -> Result<()> {
    self
      .conn
      .call(move |conn| {
        conn.busy_timeout(busy_timeout)?;
        if let Some(mode) = journal {
          conn.pragma_update_and_check(None, "journal_mode", mode.pragma_value(), |r| {
            r.get::<_, String>(0)
          })?;
        }
        conn.execute_batch(HIERARCHY)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Reload phases ─────────────────────────────────────────────────────────

  async fn run_reload(&self, snapshot: Snapshot, span: &Span) -> Result<ReloadReport> {
    let cache = self.registry.clone();
    let run = self
      .conn
      .call(move |conn| Ok(reload::begin(conn, &cache)))
      .await??;
    span.record("run_id", field::display(run.run_id));
    if run.resumed {
      warn!("resuming an interrupted reload from its journal");
    }
    info!(resumed = run.resumed, roots = snapshot.roots.len(), "reload started");

    let result = self.reload_phases(snapshot, run).await;
    if result.is_err() {
      let restored = self
        .conn
        .call(|conn| {
          conn.pragma_update(None, "foreign_keys", true)?;
          Ok(())
        })
        .await;
      if let Err(e) = restored {
        error!(error = %e, "could not re-enable foreign keys after a failed reload");
      }
    }
    result
  }

  async fn reload_phases(&self, snapshot: Snapshot, run: reload::RunState) -> Result<ReloadReport> {
    self.conn.call(|conn| Ok(reload::teardown(conn))).await??;
    info!("hierarchy torn down");

    let (mut elements, mut attributes) = (0, 0);
    for root in snapshot.roots {
      let name = root.name.clone();
      let (e, a) = self
        .conn
        .call(move |conn| Ok(reload::rebuild_root(conn, &root)))
        .await??;
      debug!(root = %name, elements = e, attributes = a, "root rebuilt");
      elements += e;
      attributes += a;
    }
    info!(elements, attributes, "hierarchy rebuilt");

    let derived_restored = self.conn.call(|conn| Ok(reload::restore_derived(conn))).await??;
    let finalized = self.conn.call(|conn| Ok(reload::finalize(conn))).await??;
    self
      .conn
      .call(|conn| Ok(reload::enforce_foreign_keys(conn)))
      .await??;

    if finalized.orphaned > 0 {
      warn!(rows = finalized.orphaned, "deleted archive rows whose paths left the hierarchy");
    }
    for dropped in &finalized.dropped {
      warn!(
        name = %dropped.name,
        path = %dropped.path,
        reason = %dropped.reason,
        "derived attribute not reactivated"
      );
    }
    info!(
      remapped = finalized.remapped,
      orphaned = finalized.orphaned,
      restored = derived_restored,
      reactivated = finalized.reactivated,
      "reload complete"
    );

    Ok(ReloadReport {
      run_id: run.run_id,
      resumed: run.resumed,
      elements_count: finalized.elements,
      attributes_count: finalized.attributes,
      archive_records_remapped: finalized.remapped,
      archive_records_orphaned_deleted: finalized.orphaned,
      derived_restored,
      derived_reactivated: finalized.reactivated,
      dropped_registrations: finalized.dropped,
    })
  }
}

// ─── HistorianStore impl ─────────────────────────────────────────────────────

impl HistorianStore for SqliteStore {
  type Error = Error;

  // ── Hierarchy ─────────────────────────────────────────────────────────────

  async fn list_elements(&self) -> Result<Vec<Element>> {
    self.conn.call(|conn| Ok(hierarchy::list_elements(conn))).await?
  }

  async fn get_element(&self, id: ElementId) -> Result<Option<Element>> {
    self.conn.call(move |conn| Ok(hierarchy::get_element(conn, id))).await?
  }

  async fn list_attributes(&self, element: Option<ElementId>) -> Result<Vec<Attribute>> {
    self
      .conn
      .call(move |conn| Ok(hierarchy::list_attributes(conn, element)))
      .await?
  }

  async fn get_attribute(&self, id: AttributeId) -> Result<Option<Attribute>> {
    self.conn.call(move |conn| Ok(hierarchy::get_attribute(conn, id))).await?
  }

  async fn find_attribute_by_path<'a>(
    &'a self,
    path: &'a AttributePath,
  ) -> Result<Option<Attribute>> {
    let path = path.clone();
    self
      .conn
      .call(move |conn| Ok(hierarchy::find_attribute_by_path(conn, &path)))
      .await?
  }

  async fn search_elements<'a>(&'a self, pattern: &'a str) -> Result<Vec<Element>> {
    let pattern = pattern.to_owned();
    self
      .conn
      .call(move |conn| Ok(hierarchy::search_elements(conn, &pattern)))
      .await?
  }

  async fn search_attributes<'a>(
    &'a self,
    pattern: &'a str,
    element: Option<ElementId>,
  ) -> Result<Vec<Attribute>> {
    let pattern = pattern.to_owned();
    self
      .conn
      .call(move |conn| Ok(hierarchy::search_attributes(conn, &pattern, element)))
      .await?
  }

  async fn attribute_map(&self) -> Result<BTreeMap<String, AttributeId>> {
    self
      .conn
      .call(|conn| Ok(PathIndex::load(conn).map(PathIndex::into_text_map)))
      .await?
  }

  // ── Archive ───────────────────────────────────────────────────────────────

  async fn write_records(&self, rows: Vec<IngestRow>) -> Result<WriteSummary> {
    if rows.is_empty() {
      return Ok(WriteSummary::default());
    }
    let cache = self.registry.clone();
    self
      .conn
      .call(move |conn| Ok(archive::write_batch(conn, &cache, rows)))
      .await?
  }

  async fn get_records(&self, query: RecordQuery) -> Result<Vec<ArchiveRecord>> {
    self.conn.call(move |conn| Ok(archive::get_records(conn, &query))).await?
  }

  async fn timestamp_range(
    &self,
    id: AttributeId,
  ) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
    self.conn.call(move |conn| Ok(archive::timestamp_range(conn, id))).await?
  }

  async fn latest_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
    self.conn.call(|conn| Ok(archive::latest_timestamp(conn))).await?
  }

  // ── Derived attributes ────────────────────────────────────────────────────

  async fn validate_formula<'a>(&'a self, formula: &'a str) -> Result<Formula> {
    let text = formula.to_owned();
    self.conn.call(move |conn| Ok(engine::compile(conn, &text))).await?
  }

  #[tracing::instrument(skip_all, fields(element = %input.element_id, name = %input.name))]
  async fn create_derived_attribute(&self, input: NewDerivedAttribute) -> Result<CreateReport> {
    let _maintenance = self.maintenance.read().await;

    let (attribute, formula) = self
      .conn
      .call(move |conn| Ok(derived::insert_attribute(conn, input)))
      .await??;
    let attribute_id = attribute.attribute_id;
    info!(attribute = %attribute_id, formula = %formula, "derived attribute inserted");

    let cache = self.registry.clone();
    let registration = Registration::new(attribute_id, formula);
    let activated = match self
      .conn
      .call(move |conn| Ok(derived::activate(conn, &cache, registration)))
      .await
    {
      Ok(result) => result,
      Err(e) => Err(e.into()),
    };

    match activated {
      Ok(filled) => {
        info!(
          attribute = %attribute_id,
          backfilled = filled.written,
          "derived attribute activated"
        );
        Ok(CreateReport { attribute, archive_records_inserted: filled.written })
      }
      Err(source) => {
        warn!(
          attribute = %attribute_id,
          error = %source,
          "activation failed; attribute left inert"
        );
        Err(Error::ActivationFailed { attribute_id, source: Box::new(source) })
      }
    }
  }

  #[tracing::instrument(skip_all, fields(attribute = %id))]
  async fn update_attribute(
    &self,
    id: AttributeId,
    update: AttributeUpdate,
  ) -> Result<UpdateReport> {
    if update.is_empty() {
      return Err(archivist_core::Error::NoFieldsProvided.into());
    }
    let _maintenance = self.maintenance.read().await;

    let cache = self.registry.clone();
    let recompute = update.recompute_archive;
    let reinstall = update.recreate_trigger;
    let (mut report, formula) = self
      .conn
      .call(move |conn| Ok(derived::update_metadata(conn, &cache, id, &update)))
      .await??;
    debug!(fields = ?report.updated_fields, "attribute metadata updated");

    let Some(formula) = formula else {
      return Ok(report);
    };
    if !recompute && !reinstall {
      warn!("formula replaced without reinstall; attribute is no longer derived");
      return Ok(report);
    }

    let cache = self.registry.clone();
    let registration = Registration::new(id, formula);
    let applied = match self
      .conn
      .call(move |conn| {
        Ok(derived::apply_formula(conn, &cache, registration, recompute, reinstall))
      })
      .await
    {
      Ok(result) => result,
      Err(e) => Err(e.into()),
    };

    match applied {
      Ok(applied) => {
        report.archive_records_deleted = applied.deleted;
        report.archive_records_inserted = applied.inserted;
        report.trigger_installed = applied.installed;
        info!(
          deleted = ?applied.deleted,
          inserted = ?applied.inserted,
          "formula updated"
        );
        Ok(report)
      }
      Err(source) => {
        warn!(error = %source, "formula update partially applied");
        Err(Error::PartialUpdate { report: Box::new(report), source: Box::new(source) })
      }
    }
  }

  #[tracing::instrument(skip_all, fields(attribute = %id))]
  async fn delete_attribute(&self, id: AttributeId) -> Result<DeleteReport> {
    let _maintenance = self.maintenance.read().await;
    let cache = self.registry.clone();
    let report = self
      .conn
      .call(move |conn| Ok(derived::delete(conn, &cache, id)))
      .await??;
    info!(
      archive_records = report.archive_records_deleted,
      trigger_dropped = report.trigger_dropped,
      "attribute deleted"
    );
    Ok(report)
  }

  #[tracing::instrument(skip_all, fields(attribute = %id))]
  async fn backfill(&self, id: AttributeId) -> Result<usize> {
    let _maintenance = self.maintenance.read().await;
    let cache = self.registry.clone();
    self
      .conn
      .call(move |conn| Ok(derived::backfill(conn, &cache, id)))
      .await?
  }

  async fn get_registration(&self, id: AttributeId) -> Result<Option<Registration>> {
    let cache = self.registry.clone();
    self
      .conn
      .call(move |conn| {
        Ok(
          cache
            .current(conn)
            .map(|registry| registry.get(id).map(|r| Registration::clone(r))),
        )
      })
      .await?
  }

  async fn list_registrations(&self) -> Result<Vec<Registration>> {
    let cache = self.registry.clone();
    self
      .conn
      .call(move |conn| {
        Ok(cache.current(conn).map(|registry| {
          registry
            .registrations()
            .iter()
            .map(|r| Registration::clone(r))
            .collect()
        }))
      })
      .await?
  }

  // ── Maintenance ───────────────────────────────────────────────────────────

  async fn reload(&self, snapshot: Snapshot) -> Result<ReloadReport> {
    snapshot.validate()?;
    let Ok(_running) = self.reload_gate.try_lock() else {
      return Err(Error::ReloadInProgress);
    };
    // Attribute changes already in flight finish first; later ones wait.
    let _exclusive = self.maintenance.write().await;
    let span = info_span!("reload", run_id = field::Empty);
    self
      .run_reload(snapshot, &span)
      .instrument(span.clone())
      .await
  }

  async fn stats(&self) -> Result<StoreStats> {
    self.conn.call(|conn| Ok(hierarchy::stats(conn))).await?
  }
}
