//! Request and report types for the mutating operations.
//!
//! Reports are deliberately granular: `Create` and formula `Update` are staged
//! operations, and a caller diagnosing a partial failure needs to know which
//! sub-steps were applied.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hierarchy::{Attribute, AttributeId, ElementId};

fn default_true() -> bool { true }

// ─── Create ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDerivedAttribute {
  pub element_id: ElementId,
  pub name:       String,
  #[serde(default)]
  pub kks:        Option<String>,
  /// `$N` formula over existing attribute ids.
  pub formula:    String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReport {
  pub attribute:                Attribute,
  pub archive_records_inserted: usize,
}

// ─── Update ──────────────────────────────────────────────────────────────────

/// Fields to change on an attribute. Empty strings count as "not provided".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributeUpdate {
  #[serde(default)]
  pub name:              Option<String>,
  #[serde(default)]
  pub kks:               Option<String>,
  /// Only accepted for attributes that are already derived.
  #[serde(default)]
  pub formula:           Option<String>,
  /// Delete previously derived rows and backfill with the new formula.
  #[serde(default = "default_true")]
  pub recompute_archive: bool,
  /// Reinstall live recomputation for the new formula.
  #[serde(default = "default_true")]
  pub recreate_trigger:  bool,
}

impl Default for AttributeUpdate {
  fn default() -> Self {
    Self {
      name:              None,
      kks:               None,
      formula:           None,
      recompute_archive: true,
      recreate_trigger:  true,
    }
  }
}

impl AttributeUpdate {
  pub fn name(&self) -> Option<&str> { non_empty(&self.name) }

  pub fn kks(&self) -> Option<&str> { non_empty(&self.kks) }

  pub fn formula(&self) -> Option<&str> { non_empty(&self.formula) }

  pub fn is_empty(&self) -> bool {
    self.name().is_none() && self.kks().is_none() && self.formula().is_none()
  }
}

fn non_empty(field: &Option<String>) -> Option<&str> {
  field.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatedField {
  Name,
  Kks,
  Formula,
}

/// Which parts of an update were applied. `None` means the step was not
/// attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReport {
  pub attribute_id:             AttributeId,
  pub updated_fields:           Vec<UpdatedField>,
  pub trigger_dropped:          Option<bool>,
  pub archive_records_deleted:  Option<usize>,
  pub archive_records_inserted: Option<usize>,
  pub trigger_installed:        Option<bool>,
}

impl UpdateReport {
  pub fn new(attribute_id: AttributeId) -> Self {
    Self {
      attribute_id,
      updated_fields: Vec::new(),
      trigger_dropped: None,
      archive_records_deleted: None,
      archive_records_inserted: None,
      trigger_installed: None,
    }
  }
}

// ─── Delete ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteReport {
  pub attribute_id:            AttributeId,
  pub attributes_deleted:      usize,
  pub archive_records_deleted: usize,
  /// Whether a live registration existed and was removed.
  pub trigger_dropped:         bool,
}

// ─── Reload ──────────────────────────────────────────────────────────────────

/// A derived attribute whose formula could not be carried across a reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedRegistration {
  pub name:   String,
  /// Full attribute path before the reload.
  pub path:   String,
  pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadReport {
  pub run_id:                           Uuid,
  /// The run picked up the journal of an earlier, interrupted run.
  pub resumed:                          bool,
  pub elements_count:                   usize,
  pub attributes_count:                 usize,
  pub archive_records_remapped:         usize,
  pub archive_records_orphaned_deleted: usize,
  pub derived_restored:                 usize,
  pub derived_reactivated:              usize,
  pub dropped_registrations:            Vec<DroppedRegistration>,
}

// ─── Stats ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
  pub elements:           usize,
  pub attributes:         usize,
  pub archive_records:    usize,
  pub derived_attributes: usize,
}
