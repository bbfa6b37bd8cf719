//! In-process rule registry for derived attributes.
//!
//! Maps each source attribute to the derived attributes that read it, so a
//! committed source write can be followed by recomputation of exactly the
//! affected derived values. The registry is plain data; the store decides
//! when to load it and when to invalidate it.

use std::{
  collections::{BTreeSet, HashMap, HashSet},
  sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::{formula::Formula, hierarchy::AttributeId};

/// An active derived attribute: its id and the compiled formula bound to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
  pub derived_id: AttributeId,
  pub formula:    Formula,
}

impl Registration {
  pub fn new(derived_id: AttributeId, formula: Formula) -> Self {
    Self { derived_id, formula }
  }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
  by_derived: HashMap<AttributeId, Arc<Registration>>,
  /// source id → derived ids, kept sorted for deterministic evaluation order.
  by_source:  HashMap<AttributeId, Vec<AttributeId>>,
}

impl Registry {
  pub fn new() -> Self { Self::default() }

  pub fn from_registrations(registrations: impl IntoIterator<Item = Registration>) -> Self {
    let mut registry = Self::new();
    for r in registrations {
      registry.insert(r);
    }
    registry
  }

  pub fn len(&self) -> usize { self.by_derived.len() }

  pub fn is_empty(&self) -> bool { self.by_derived.is_empty() }

  /// Install or replace the registration for `registration.derived_id`.
  pub fn insert(&mut self, registration: Registration) -> Option<Arc<Registration>> {
    let derived = registration.derived_id;
    let previous = self.remove(derived);
    for source in registration.formula.sources() {
      let list = self.by_source.entry(*source).or_default();
      if let Err(slot) = list.binary_search(&derived) {
        list.insert(slot, derived);
      }
    }
    self.by_derived.insert(derived, Arc::new(registration));
    previous
  }

  pub fn remove(&mut self, derived: AttributeId) -> Option<Arc<Registration>> {
    let previous = self.by_derived.remove(&derived)?;
    for source in previous.formula.sources() {
      if let Some(list) = self.by_source.get_mut(source) {
        list.retain(|d| *d != derived);
        if list.is_empty() {
          self.by_source.remove(source);
        }
      }
    }
    Some(previous)
  }

  pub fn get(&self, derived: AttributeId) -> Option<&Arc<Registration>> {
    self.by_derived.get(&derived)
  }

  pub fn is_derived(&self, id: AttributeId) -> bool { self.by_derived.contains_key(&id) }

  /// Derived attributes that read `source` directly.
  pub fn dependents(&self, source: AttributeId) -> &[AttributeId] {
    self.by_source.get(&source).map(Vec::as_slice).unwrap_or(&[])
  }

  /// All registrations, ordered by derived id.
  pub fn registrations(&self) -> Vec<Arc<Registration>> {
    let mut all: Vec<_> = self.by_derived.values().cloned().collect();
    all.sort_by_key(|r| r.derived_id);
    all
  }

  /// Would binding `derived` to a formula over `sources` create a cycle?
  ///
  /// True when `derived` is among `sources` or is reachable from any of them
  /// by following source links through other registrations.
  pub fn would_cycle(&self, derived: AttributeId, sources: &BTreeSet<AttributeId>) -> bool {
    let mut stack: Vec<AttributeId> = sources.iter().copied().collect();
    let mut seen = HashSet::new();
    while let Some(id) = stack.pop() {
      if id == derived {
        return true;
      }
      if !seen.insert(id) {
        continue;
      }
      if let Some(reg) = self.by_derived.get(&id) {
        stack.extend(reg.formula.sources().iter().copied());
      }
    }
    false
  }

  /// Every derived attribute that depends on `root`, directly or through other
  /// derived attributes, ordered so each appears after all of its own derived
  /// sources within the set.
  pub fn transitive_dependents(&self, root: AttributeId) -> Vec<AttributeId> {
    let mut reachable = BTreeSet::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
      for d in self.dependents(id) {
        if reachable.insert(*d) {
          stack.push(*d);
        }
      }
    }

    let mut ordered = Vec::with_capacity(reachable.len());
    let mut placed = HashSet::new();
    for id in &reachable {
      self.place(*id, &reachable, &mut placed, &mut ordered);
    }
    ordered
  }

  /// Every registered derived id, each after the derived attributes it reads.
  pub fn topological_order(&self) -> Vec<AttributeId> {
    let all: BTreeSet<AttributeId> = self.by_derived.keys().copied().collect();
    let mut ordered = Vec::with_capacity(all.len());
    let mut placed = HashSet::new();
    for id in &all {
      self.place(*id, &all, &mut placed, &mut ordered);
    }
    ordered
  }

  fn place(
    &self,
    id: AttributeId,
    within: &BTreeSet<AttributeId>,
    placed: &mut HashSet<AttributeId>,
    ordered: &mut Vec<AttributeId>,
  ) {
    if !placed.insert(id) {
      return;
    }
    if let Some(reg) = self.by_derived.get(&id) {
      for source in reg.formula.sources() {
        if within.contains(source) {
          self.place(*source, within, placed, ordered);
        }
      }
    }
    ordered.push(id);
  }
}
