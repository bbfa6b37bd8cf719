//! Transactions behind the derived-attribute CRUD operations.
//!
//! `Create` and formula `Update` are staged: the caller runs the steps here as
//! separate transactions and reports which of them committed.

use archivist_core::{
  formula::Formula,
  hierarchy::{Attribute, AttributeId, validate_name},
  registry::Registration,
  report::{AttributeUpdate, DeleteReport, NewDerivedAttribute, UpdateReport, UpdatedField},
};
use rusqlite::{Connection, TransactionBehavior};

use crate::{
  Result,
  engine::{self, Backfilled, RegistryCache},
  hierarchy,
};

/// Step one of `Create`: validate everything and insert the (still inert)
/// attribute row.
pub fn insert_attribute(
  conn: &mut Connection,
  input: NewDerivedAttribute,
) -> Result<(Attribute, Formula)> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  let name = validate_name(&input.name)?;
  let formula = engine::compile(&tx, &input.formula)?;
  if hierarchy::get_element(&tx, input.element_id)?.is_none() {
    return Err(archivist_core::Error::ElementNotFound(input.element_id).into());
  }
  if hierarchy::find_on_element(&tx, input.element_id, name)?.is_some() {
    return Err(
      archivist_core::Error::DuplicateAttribute {
        element_id: input.element_id,
        name:       name.to_owned(),
      }
      .into(),
    );
  }
  let kks = input.kks.as_deref().map(str::trim).filter(|k| !k.is_empty());
  let attribute = hierarchy::insert_attribute(&tx, input.element_id, name, kks)?;
  tx.commit()?;
  Ok((attribute, formula))
}

/// Install `registration` and backfill it (plus anything built on it) in one
/// transaction, so no source write can slip between the two.
pub fn activate(
  conn: &mut Connection,
  cache: &RegistryCache,
  registration: Registration,
) -> Result<Backfilled> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  let mut registry = (*cache.current(&tx)?).clone();
  let id = registration.derived_id;
  if registry.would_cycle(id, registration.formula.sources()) {
    return Err(archivist_core::Error::CircularFormula(id).into());
  }
  engine::install(&tx, &registration)?;
  let filled = engine::backfill(&tx, &registration)?;
  registry.insert(registration);
  engine::backfill_dependents(&tx, &registry, id)?;
  tx.commit()?;
  Ok(filled)
}

/// Step one of `Update`: validate, apply name/kks and, when a new formula is
/// given, drop the old registration. Nothing is written unless every check
/// passes.
pub fn update_metadata(
  conn: &mut Connection,
  cache: &RegistryCache,
  id: AttributeId,
  update: &AttributeUpdate,
) -> Result<(UpdateReport, Option<Formula>)> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  let attribute = hierarchy::get_attribute(&tx, id)?
    .ok_or(archivist_core::Error::AttributeNotFound(id))?;
  let registry = cache.current(&tx)?;

  let formula = match update.formula() {
    Some(text) => {
      if !registry.is_derived(id) {
        return Err(archivist_core::Error::NotDerived(id).into());
      }
      let formula = engine::compile(&tx, text)?;
      if registry.would_cycle(id, formula.sources()) {
        return Err(archivist_core::Error::CircularFormula(id).into());
      }
      Some(formula)
    }
    None => None,
  };

  let name = update.name().map(validate_name).transpose()?;
  if let Some(name) = name.filter(|n| *n != attribute.name) {
    if hierarchy::find_on_element(&tx, attribute.element_id, name)?.is_some() {
      return Err(
        archivist_core::Error::DuplicateAttribute {
          element_id: attribute.element_id,
          name:       name.to_owned(),
        }
        .into(),
      );
    }
  }

  let mut report = UpdateReport::new(id);
  let kks = update.kks();
  if name.is_some() || kks.is_some() {
    tx.execute(
      "UPDATE attributes SET name = COALESCE(?2, name), kks = COALESCE(?3, kks)
       WHERE attribute_id = ?1",
      rusqlite::params![id.0, name, kks],
    )?;
  }
  if name.is_some() {
    report.updated_fields.push(UpdatedField::Name);
  }
  if kks.is_some() {
    report.updated_fields.push(UpdatedField::Kks);
  }
  if formula.is_some() {
    report.updated_fields.push(UpdatedField::Formula);
    report.trigger_dropped = Some(engine::deregister(&tx, id)?);
  }
  tx.commit()?;
  Ok((report, formula))
}

/// What step two of a formula `Update` did.
pub struct FormulaApplied {
  pub deleted:   Option<usize>,
  pub inserted:  Option<usize>,
  pub installed: Option<bool>,
}

/// Step two of `Update`: optionally reinstall the registration and recompute
/// history with the new formula.
pub fn apply_formula(
  conn: &mut Connection,
  cache: &RegistryCache,
  registration: Registration,
  recompute: bool,
  reinstall: bool,
) -> Result<FormulaApplied> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  let mut registry = (*cache.current(&tx)?).clone();
  let id = registration.derived_id;
  let mut applied = FormulaApplied { deleted: None, inserted: None, installed: None };

  if reinstall {
    engine::install(&tx, &registration)?;
    applied.installed = Some(true);
  }
  if recompute {
    applied.deleted = Some(engine::delete_all_values(&tx, id)?);
    applied.inserted = Some(engine::backfill(&tx, &registration)?.written);
  }
  if reinstall {
    registry.insert(registration);
  }
  if recompute {
    engine::backfill_dependents(&tx, &registry, id)?;
  }
  tx.commit()?;
  Ok(applied)
}

pub fn delete(
  conn: &mut Connection,
  cache: &RegistryCache,
  id: AttributeId,
) -> Result<DeleteReport> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  if !hierarchy::attribute_exists(&tx, id)? {
    return Err(archivist_core::Error::AttributeNotFound(id).into());
  }
  let registry = cache.current(&tx)?;
  let dependents = registry.dependents(id);
  if !dependents.is_empty() {
    return Err(
      archivist_core::Error::AttributeInUse {
        attribute_id: id,
        dependents:   dependents.to_vec(),
      }
      .into(),
    );
  }

  let trigger_dropped = engine::deregister(&tx, id)?;
  let archive_records_deleted = engine::delete_all_values(&tx, id)?;
  let attributes_deleted =
    tx.execute("DELETE FROM attributes WHERE attribute_id = ?1", rusqlite::params![id.0])?;
  tx.commit()?;
  Ok(DeleteReport {
    attribute_id: id,
    attributes_deleted,
    archive_records_deleted,
    trigger_dropped,
  })
}

/// Re-run the backfill of a derived attribute and of everything built on it.
/// Returns the number of rows written or removed.
pub fn backfill(conn: &mut Connection, cache: &RegistryCache, id: AttributeId) -> Result<usize> {
  let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
  let registry = cache.current(&tx)?;
  let Some(registration) = registry.get(id) else {
    return Err(if hierarchy::attribute_exists(&tx, id)? {
      archivist_core::Error::NotDerived(id).into()
    } else {
      archivist_core::Error::AttributeNotFound(id).into()
    });
  };
  let mut filled = engine::backfill(&tx, registration)?;
  filled += engine::backfill_dependents(&tx, &registry, id)?;
  tx.commit()?;
  Ok(filled.written + filled.removed)
}
