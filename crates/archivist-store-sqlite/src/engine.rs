//! The derived-attribute engine: registry persistence, formula compilation,
//! backfill and live recomputation.
//!
//! Everything here is synchronous and runs against an open transaction, so
//! a backfill, the registration change it accompanies, and the source write
//! that triggers a live recomputation commit or roll back together.

use std::{
  collections::{HashMap, HashSet, VecDeque},
  sync::{Arc, Mutex, PoisonError},
};

use archivist_core::{
  archive::WriteSummary,
  formula::Formula,
  hierarchy::AttributeId,
  registry::{Registration, Registry},
};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension as _};
use tracing::debug;

use crate::{Result, encode::encode_ts};

// ─── Registry cache ──────────────────────────────────────────────────────────

#[derive(Default)]
struct CachedRegistry {
  generation: Option<i64>,
  registry:   Arc<Registry>,
}

/// Per-store copy of the persisted registrations.
///
/// Reads compare the stored `registry_generation` with the one the cache was
/// loaded at; another connection changing a registration bumps it.
#[derive(Clone, Default)]
pub struct RegistryCache {
  inner: Arc<Mutex<CachedRegistry>>,
}

impl RegistryCache {
  /// The registry as of `conn`'s current transaction.
  pub fn current(&self, conn: &Connection) -> Result<Arc<Registry>> {
    let generation = registry_generation(conn)?;
    {
      let cached = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
      if cached.generation == Some(generation) {
        return Ok(cached.registry.clone());
      }
    }

    let registry = Arc::new(load_registry(conn)?);
    debug!(generation, registrations = registry.len(), "registry reloaded");
    let mut cached = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
    cached.generation = Some(generation);
    cached.registry = registry.clone();
    Ok(registry)
  }
}

fn registry_generation(conn: &Connection) -> Result<i64> {
  let mut stmt =
    conn.prepare_cached("SELECT value FROM store_meta WHERE key = 'registry_generation'")?;
  Ok(stmt.query_row([], |r| r.get(0))?)
}

pub fn bump_generation(conn: &Connection) -> Result<()> {
  conn.execute(
    "UPDATE store_meta SET value = value + 1 WHERE key = 'registry_generation'",
    [],
  )?;
  Ok(())
}

fn load_registry(conn: &Connection) -> Result<Registry> {
  let mut stmt =
    conn.prepare("SELECT attribute_id, formula FROM derived_formulas ORDER BY attribute_id")?;
  let rows = stmt
    .query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?)))?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  let mut registrations = Vec::with_capacity(rows.len());
  for (id, text) in rows {
    registrations.push(Registration::new(AttributeId(id), Formula::parse(&text)?));
  }
  Ok(Registry::from_registrations(registrations))
}

/// Persist `registration`, replacing any previous formula for the same id.
pub fn install(conn: &Connection, registration: &Registration) -> Result<()> {
  conn.execute(
    "INSERT INTO derived_formulas (attribute_id, formula, installed_at)
     VALUES (?1, ?2, ?3)
     ON CONFLICT (attribute_id) DO UPDATE
       SET formula = excluded.formula, installed_at = excluded.installed_at",
    rusqlite::params![
      registration.derived_id.0,
      registration.formula.text(),
      encode_ts(Utc::now())
    ],
  )?;
  bump_generation(conn)?;
  Ok(())
}

/// Remove the registration for `id`. Returns whether one existed.
pub fn deregister(conn: &Connection, id: AttributeId) -> Result<bool> {
  let removed =
    conn.execute("DELETE FROM derived_formulas WHERE attribute_id = ?1", rusqlite::params![id.0])?;
  if removed > 0 {
    bump_generation(conn)?;
  }
  Ok(removed > 0)
}

// ─── Compilation ─────────────────────────────────────────────────────────────

/// Parse `text` and check that every `$N` names an existing attribute.
pub fn compile(conn: &Connection, text: &str) -> Result<Formula> {
  let formula = Formula::parse(text)?;
  let mut stmt = conn.prepare_cached("SELECT 1 FROM attributes WHERE attribute_id = ?1")?;
  let mut missing = Vec::new();
  for id in formula.sources() {
    if !stmt.exists(rusqlite::params![id.0])? {
      missing.push(*id);
    }
  }
  if !missing.is_empty() {
    return Err(archivist_core::Error::UnknownAttribute(missing).into());
  }
  Ok(formula)
}

// ─── Archive primitives ──────────────────────────────────────────────────────

/// Insert or overwrite one archive value. Returns `false` when the stored
/// value was already identical.
pub fn upsert_value(
  conn: &Connection,
  id: AttributeId,
  timestamp: &str,
  value: Option<f64>,
) -> Result<bool> {
  let mut stmt = conn.prepare_cached(
    "INSERT INTO archive (attribute_id, timestamp, value) VALUES (?1, ?2, ?3)
     ON CONFLICT (attribute_id, timestamp) DO UPDATE
       SET value = excluded.value
       WHERE archive.value IS NOT excluded.value",
  )?;
  Ok(stmt.execute(rusqlite::params![id.0, timestamp, value])? > 0)
}

fn delete_value(conn: &Connection, id: AttributeId, timestamp: &str) -> Result<bool> {
  let mut stmt =
    conn.prepare_cached("DELETE FROM archive WHERE attribute_id = ?1 AND timestamp = ?2")?;
  Ok(stmt.execute(rusqlite::params![id.0, timestamp])? > 0)
}

fn value_at(conn: &Connection, id: AttributeId, timestamp: &str) -> Result<Option<f64>> {
  let mut stmt = conn
    .prepare_cached("SELECT value FROM archive WHERE attribute_id = ?1 AND timestamp = ?2")?;
  Ok(
    stmt
      .query_row(rusqlite::params![id.0, timestamp], |r| r.get::<_, Option<f64>>(0))
      .optional()?
      .flatten(),
  )
}

pub fn delete_all_values(conn: &Connection, id: AttributeId) -> Result<usize> {
  Ok(conn.execute("DELETE FROM archive WHERE attribute_id = ?1", rusqlite::params![id.0])?)
}

// ─── Live recomputation ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recomputed {
  Written,
  Unchanged,
  Removed,
  Absent,
}

/// Bring the derived value of `registration` at `timestamp` in line with its
/// sources: write it when every source has a value, otherwise make sure no
/// row exists.
fn recompute_at(
  conn: &Connection,
  registration: &Registration,
  timestamp: &str,
) -> Result<Recomputed> {
  let mut values = HashMap::with_capacity(registration.formula.sources().len());
  for source in registration.formula.sources() {
    if let Some(v) = value_at(conn, *source, timestamp)? {
      values.insert(*source, v);
    }
  }

  match registration.formula.evaluate(|id| values.get(&id).copied()) {
    Some(v) => {
      if upsert_value(conn, registration.derived_id, timestamp, Some(v))? {
        Ok(Recomputed::Written)
      } else {
        Ok(Recomputed::Unchanged)
      }
    }
    None if delete_value(conn, registration.derived_id, timestamp)? => Ok(Recomputed::Removed),
    None => Ok(Recomputed::Absent),
  }
}

/// Recompute every derived value affected by the changed `(source, timestamp)`
/// keys, following derived-of-derived chains.
pub fn propagate(
  conn: &Connection,
  registry: &Registry,
  changed: impl IntoIterator<Item = (AttributeId, String)>,
  summary: &mut WriteSummary,
) -> Result<()> {
  let mut queue: VecDeque<(AttributeId, String)> = VecDeque::new();
  let mut pending: HashSet<(AttributeId, String)> = HashSet::new();
  for (source, ts) in changed {
    for derived in registry.dependents(source) {
      if pending.insert((*derived, ts.clone())) {
        queue.push_back((*derived, ts.clone()));
      }
    }
  }

  while let Some(key) = queue.pop_front() {
    pending.remove(&key);
    let (derived, ts) = key;
    let Some(registration) = registry.get(derived) else { continue };

    let outcome = recompute_at(conn, registration, &ts)?;
    match outcome {
      Recomputed::Written => summary.derived_written += 1,
      Recomputed::Removed => summary.derived_removed += 1,
      Recomputed::Unchanged | Recomputed::Absent => continue,
    }
    for next in registry.dependents(derived) {
      if pending.insert((*next, ts.clone())) {
        queue.push_back((*next, ts.clone()));
      }
    }
  }
  Ok(())
}

// ─── Backfill ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Backfilled {
  /// Derived rows inserted or changed.
  pub written: usize,
  /// Derived rows removed because their sources are no longer complete.
  pub removed: usize,
}

impl std::ops::AddAssign for Backfilled {
  fn add_assign(&mut self, rhs: Self) {
    self.written += rhs.written;
    self.removed += rhs.removed;
  }
}

/// Reconcile every stored value of one derived attribute with its sources.
///
/// Scans all non-null source values in timestamp order, evaluates the formula
/// at each timestamp where every source is present, and upserts the result.
/// Derived rows at any other timestamp are removed. Running it twice changes
/// nothing the second time.
pub fn backfill(conn: &Connection, registration: &Registration) -> Result<Backfilled> {
  let sources: Vec<AttributeId> = registration.formula.sources().iter().copied().collect();
  let placeholders = vec!["?"; sources.len()].join(", ");
  let mut stmt = conn.prepare(&format!(
    "SELECT timestamp, attribute_id, value FROM archive
     WHERE attribute_id IN ({placeholders}) AND value IS NOT NULL
     ORDER BY timestamp"
  ))?;
  let rows = stmt
    .query_map(rusqlite::params_from_iter(sources.iter().map(|s| s.0)), |r| {
      Ok((r.get::<_, String>(0)?, AttributeId(r.get(1)?), r.get::<_, f64>(2)?))
    })?
    .collect::<rusqlite::Result<Vec<_>>>()?;

  let mut outcome = Backfilled::default();
  let mut computed: HashSet<String> = HashSet::new();
  let mut values: HashMap<AttributeId, f64> = HashMap::with_capacity(sources.len());
  let mut rows = rows.into_iter().peekable();
  while let Some((ts, id, v)) = rows.next() {
    values.clear();
    values.insert(id, v);
    while let Some((_, id, v)) = rows.next_if(|(next, ..)| *next == ts) {
      values.insert(id, v);
    }
    if values.len() < sources.len() {
      continue;
    }
    let Some(result) = registration.formula.evaluate(|id| values.get(&id).copied()) else {
      continue;
    };
    if upsert_value(conn, registration.derived_id, &ts, Some(result))? {
      outcome.written += 1;
    }
    computed.insert(ts);
  }

  let mut stmt = conn.prepare("SELECT timestamp FROM archive WHERE attribute_id = ?1")?;
  let stale: Vec<String> = stmt
    .query_map(rusqlite::params![registration.derived_id.0], |r| r.get::<_, String>(0))?
    .filter(|ts| ts.as_ref().map_or(true, |ts| !computed.contains(ts)))
    .collect::<rusqlite::Result<Vec<_>>>()?;
  for ts in &stale {
    if delete_value(conn, registration.derived_id, ts)? {
      outcome.removed += 1;
    }
  }

  debug!(
    derived = %registration.derived_id,
    written = outcome.written,
    removed = outcome.removed,
    "backfill complete"
  );
  Ok(outcome)
}

/// Backfill every derived attribute built on `root`, directly or through
/// other derived attributes, in dependency order.
pub fn backfill_dependents(
  conn: &Connection,
  registry: &Registry,
  root: AttributeId,
) -> Result<Backfilled> {
  let mut total = Backfilled::default();
  for dependent in registry.transitive_dependents(root) {
    if let Some(registration) = registry.get(dependent) {
      total += backfill(conn, registration)?;
    }
  }
  Ok(total)
}
