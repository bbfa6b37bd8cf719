//! Identity-preserving reload of the hierarchy.
//!
//! Numeric ids are reassigned on every rebuild; attribute paths are the only
//! identity that survives. Each phase below is its own transaction and the
//! state needed to finish is journaled in `reload_*` tables first, so a run
//! interrupted at any point is completed by the next one.
//!
//! ```text
//! begin            journal old id → path, derived metadata + formulas
//! teardown         foreign keys off, recreate elements/attributes
//! rebuild_root     one transaction per snapshot root, depth-first
//! restore_derived  re-insert derived attributes under their old paths
//! finalize         remap archive ids, delete orphans, reactivate formulas,
//!                  clear the journal (single transaction)
//! enforce          foreign keys on, verify
//! ```
//!
//! Pre-reload ids are never reused because both tables are `AUTOINCREMENT`
//! and teardown carries the sequence forward, so old and new ids cannot
//! collide during the remap.

use std::collections::{HashMap, HashSet};

use archivist_core::{
  formula::Formula,
  hierarchy::{AttributeId, AttributePath, ElementId, Hierarchy, validate_name},
  registry::{Registration, Registry},
  report::DroppedRegistration,
  snapshot::SnapshotNode,
};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension as _, TransactionBehavior};
use uuid::Uuid;

use crate::{
  Error, Result,
  encode::{decode_element_path, decode_path, encode_element_path, encode_path, encode_ts},
  engine::{self, RegistryCache},
  hierarchy::{self, PathIndex},
  schema::HIERARCHY,
};

pub struct RunState {
  pub run_id:  Uuid,
  pub resumed: bool,
}

/// Start a run, or pick up the journal of an unfinished one.
pub fn begin(conn: &mut Connection, cache: &RegistryCache) -> Result<RunState> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  let existing: Option<String> = tx
    .query_row("SELECT run_id FROM reload_runs LIMIT 1", [], |r| r.get(0))
    .optional()?;
  if let Some(run_id) = existing {
    return Ok(RunState { run_id: Uuid::parse_str(&run_id)?, resumed: true });
  }

  let registry = cache.current(&tx)?;
  let index = PathIndex::load(&tx)?;
  {
    let mut insert =
      tx.prepare("INSERT INTO reload_paths (old_attribute_id, path) VALUES (?1, ?2)")?;
    for (id, path) in &index.paths {
      insert.execute(rusqlite::params![id.0, encode_path(path)?])?;
    }

    let mut insert = tx.prepare(
      "INSERT INTO reload_derived (old_attribute_id, name, kks, element_path, formula)
       VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for registration in registry.registrations() {
      let Some(attribute) = hierarchy::get_attribute(&tx, registration.derived_id)? else {
        continue;
      };
      let Some(element_path) = index.hierarchy.element_path(attribute.element_id) else {
        continue;
      };
      insert.execute(rusqlite::params![
        attribute.attribute_id.0,
        attribute.name,
        attribute.kks,
        encode_element_path(&element_path)?,
        registration.formula.text(),
      ])?;
    }
  }

  let run_id = Uuid::new_v4();
  tx.execute(
    "INSERT INTO reload_runs (run_id, started_at) VALUES (?1, ?2)",
    rusqlite::params![run_id.hyphenated().to_string(), encode_ts(Utc::now())],
  )?;
  tx.commit()?;
  Ok(RunState { run_id, resumed: false })
}

/// Suspend foreign keys and recreate the hierarchy tables empty.
///
/// Archive rows keep their old ids; registrations are cleared since they name
/// ids that are about to disappear.
pub fn teardown(conn: &mut Connection) -> Result<()> {
  conn.pragma_update(None, "foreign_keys", false)?;

  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  let attribute_mark: Option<i64> = tx.query_row(
    "SELECT MAX(id) FROM (
       SELECT seq AS id FROM sqlite_sequence WHERE name = 'attributes'
       UNION ALL SELECT MAX(attribute_id) FROM attributes
       UNION ALL SELECT MAX(attribute_id) FROM archive
       UNION ALL SELECT MAX(old_attribute_id) FROM reload_paths
     )",
    [],
    |r| r.get(0),
  )?;
  let element_mark: Option<i64> = tx.query_row(
    "SELECT MAX(id) FROM (
       SELECT seq AS id FROM sqlite_sequence WHERE name = 'elements'
       UNION ALL SELECT MAX(element_id) FROM elements
     )",
    [],
    |r| r.get(0),
  )?;

  tx.execute_batch(
    "DROP TABLE IF EXISTS attributes;
     DROP TABLE IF EXISTS elements;
     DELETE FROM derived_formulas;",
  )?;
  tx.execute_batch(HIERARCHY)?;
  tx.execute(
    "DELETE FROM sqlite_sequence WHERE name IN ('elements', 'attributes')",
    [],
  )?;
  tx.execute(
    "INSERT INTO sqlite_sequence (name, seq) VALUES ('elements', ?1), ('attributes', ?2)",
    rusqlite::params![element_mark.unwrap_or(0), attribute_mark.unwrap_or(0)],
  )?;
  engine::bump_generation(&tx)?;
  tx.commit()?;
  Ok(())
}

/// Insert one snapshot root and everything under it. Returns the number of
/// elements and attributes inserted.
pub fn rebuild_root(conn: &mut Connection, root: &SnapshotNode) -> Result<(usize, usize)> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  let (mut elements, mut attributes) = (0, 0);
  let mut stack: Vec<(&SnapshotNode, Option<ElementId>, u32)> = vec![(root, None, 0)];
  while let Some((node, parent, level)) = stack.pop() {
    let id = hierarchy::insert_element(&tx, validate_name(&node.name)?, level, parent)?;
    elements += 1;
    for attribute in &node.attributes {
      let name = validate_name(&attribute.name)?;
      hierarchy::insert_attribute(&tx, id, name, attribute.kks.as_deref())?;
      attributes += 1;
    }
    // Reversed so children are inserted in document order.
    for child in node.children.iter().rev() {
      stack.push((child, Some(id), level + 1));
    }
  }
  tx.commit()?;
  Ok((elements, attributes))
}

/// Re-insert journaled derived attributes under their old element paths.
/// Returns how many were restored.
pub fn restore_derived(conn: &mut Connection) -> Result<usize> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  let hierarchy = Hierarchy::new(hierarchy::list_elements(&tx)?);
  let journal = {
    let mut stmt = tx.prepare(
      "SELECT old_attribute_id, name, kks, element_path FROM reload_derived
       ORDER BY old_attribute_id",
    )?;
    stmt
      .query_map([], |r| {
        Ok((
          r.get::<_, i64>(0)?,
          r.get::<_, String>(1)?,
          r.get::<_, Option<String>>(2)?,
          r.get::<_, String>(3)?,
        ))
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?
  };

  let mut restored = 0;
  for (old_id, name, kks, element_path) in journal {
    let element_path = decode_element_path(&element_path)?;
    let (new_id, reason) = match hierarchy.find_element(&element_path) {
      None => (None, Some("owning element is missing from the new hierarchy".to_owned())),
      Some(element) => match hierarchy::find_on_element(&tx, element, &name)? {
        Some(_) => (
          None,
          Some("the new hierarchy supplies a source attribute at this path".to_owned()),
        ),
        None => {
          let attribute = hierarchy::insert_attribute(&tx, element, &name, kks.as_deref())?;
          restored += 1;
          (Some(attribute.attribute_id.0), None)
        }
      },
    };
    tx.execute(
      "UPDATE reload_derived SET new_attribute_id = ?2, dropped_reason = ?3
       WHERE old_attribute_id = ?1",
      rusqlite::params![old_id, new_id, reason],
    )?;
  }
  tx.commit()?;
  Ok(restored)
}

pub struct Finalized {
  pub elements:    usize,
  pub attributes:  usize,
  pub remapped:    usize,
  pub orphaned:    usize,
  pub reactivated: usize,
  pub dropped:     Vec<DroppedRegistration>,
}

struct JournaledDerived {
  old_id:         AttributeId,
  path:           AttributePath,
  formula:        String,
  new_id:         Option<AttributeId>,
  dropped_reason: Option<String>,
}

/// Remap archive ids by path, delete orphans, reactivate formulas and clear
/// the journal, all in one transaction.
pub fn finalize(conn: &mut Connection) -> Result<Finalized> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

  let derived: Vec<JournaledDerived> = {
    let mut stmt = tx.prepare(
      "SELECT old_attribute_id, name, element_path, formula, new_attribute_id, dropped_reason
       FROM reload_derived ORDER BY old_attribute_id",
    )?;
    let rows = stmt
      .query_map([], |r| {
        Ok((
          r.get::<_, i64>(0)?,
          r.get::<_, String>(1)?,
          r.get::<_, String>(2)?,
          r.get::<_, String>(3)?,
          r.get::<_, Option<i64>>(4)?,
          r.get::<_, Option<String>>(5)?,
        ))
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    rows
      .into_iter()
      .map(|(old_id, name, element_path, formula, new_id, dropped_reason)| {
        Ok(JournaledDerived {
          old_id: AttributeId(old_id),
          path: AttributePath::new(decode_element_path(&element_path)?, name),
          formula,
          new_id: new_id.map(AttributeId),
          dropped_reason,
        })
      })
      .collect::<Result<_>>()?
  };

  // ── Remap ────────────────────────────────────────────────────────────────
  let index = PathIndex::load(&tx)?;
  let by_path = index.by_path();
  let unrestored: Vec<AttributeId> =
    derived.iter().filter(|d| d.new_id.is_none()).map(|d| d.old_id).collect();

  let journal_paths: Vec<(i64, String)> = {
    let mut stmt =
      tx.prepare("SELECT old_attribute_id, path FROM reload_paths ORDER BY old_attribute_id")?;
    stmt
      .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
      .collect::<rusqlite::Result<Vec<_>>>()?
  };
  let mut mapping: HashMap<AttributeId, AttributeId> = HashMap::new();
  let mut claimed: HashSet<AttributePath> = HashSet::new();
  for (old_id, path) in journal_paths {
    let old_id = AttributeId(old_id);
    // A derived attribute that was not restored must not have its history
    // land on whatever now occupies its path.
    if unrestored.contains(&old_id) {
      continue;
    }
    // With duplicate old paths only the lowest id carries its history over;
    // the rest are left to orphan cleanup.
    let path = decode_path(&path)?;
    let Some(new_id) = by_path.get(&path).copied() else { continue };
    if claimed.insert(path) {
      mapping.insert(old_id, new_id);
    }
  }

  tx.execute_batch(
    "CREATE TEMP TABLE IF NOT EXISTS reload_remap (
         old_id INTEGER PRIMARY KEY,
         new_id INTEGER NOT NULL
     );
     DELETE FROM temp.reload_remap;",
  )?;
  {
    let mut insert = tx.prepare("INSERT INTO temp.reload_remap (old_id, new_id) VALUES (?1, ?2)")?;
    for (old_id, new_id) in &mapping {
      if old_id != new_id {
        insert.execute(rusqlite::params![old_id.0, new_id.0])?;
      }
    }
  }
  // A value written against the new id while the rebuild ran loses to the
  // carried-over history at the same timestamp.
  let remapped = tx.execute(
    "UPDATE OR REPLACE archive
     SET attribute_id = (SELECT new_id FROM temp.reload_remap WHERE old_id = archive.attribute_id)
     WHERE attribute_id IN (SELECT old_id FROM temp.reload_remap)",
    [],
  )?;
  let orphaned = tx.execute(
    "DELETE FROM archive WHERE attribute_id NOT IN (SELECT attribute_id FROM attributes)",
    [],
  )?;
  tx.execute("DROP TABLE temp.reload_remap", [])?;

  // ── Reactivate ───────────────────────────────────────────────────────────
  let mut registry = Registry::new();
  let mut dropped = Vec::new();
  for entry in derived {
    let drop_with = |reason: String| DroppedRegistration {
      name: entry.path.name.clone(),
      path: entry.path.to_string(),
      reason,
    };
    if let Some(reason) = entry.dropped_reason.clone() {
      dropped.push(drop_with(reason));
      continue;
    }
    let Some(new_id) = entry.new_id else {
      dropped.push(drop_with("attribute was not restored".to_owned()));
      continue;
    };
    let formula = match Formula::parse(&entry.formula) {
      Ok(f) => f,
      Err(e) => {
        dropped.push(drop_with(e.to_string()));
        continue;
      }
    };
    match formula.remap(&mapping) {
      Ok(formula) if registry.would_cycle(new_id, formula.sources()) => {
        dropped.push(drop_with(format!("formula {formula} would depend on itself")));
      }
      Ok(formula) => {
        registry.insert(Registration::new(new_id, formula));
      }
      Err(missing) => {
        let ids: Vec<String> = missing.iter().map(ToString::to_string).collect();
        dropped.push(drop_with(format!(
          "source attributes ${} have no path in the new hierarchy",
          ids.join(", $")
        )));
      }
    }
  }

  for id in registry.topological_order() {
    if let Some(registration) = registry.get(id) {
      engine::install(&tx, registration)?;
      engine::backfill(&tx, registration)?;
    }
  }

  tx.execute_batch(
    "DELETE FROM reload_paths;
     DELETE FROM reload_derived;
     DELETE FROM reload_runs;",
  )?;

  let finalized = Finalized {
    elements: hierarchy::count_rows(&tx, "elements")?,
    attributes: hierarchy::count_rows(&tx, "attributes")?,
    remapped,
    orphaned,
    reactivated: registry.len(),
    dropped,
  };
  tx.commit()?;
  Ok(finalized)
}

/// Re-enable foreign keys and verify nothing dangles.
pub fn enforce_foreign_keys(conn: &mut Connection) -> Result<()> {
  conn.pragma_update(None, "foreign_keys", true)?;
  let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
  let violations = stmt.query_map([], |_| Ok(()))?.count();
  if violations > 0 {
    return Err(Error::ForeignKeyViolations(violations));
  }
  Ok(())
}
