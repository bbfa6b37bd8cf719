//! Error types for `archivist-core`.

use thiserror::Error;

use crate::hierarchy::{AttributeId, ElementId};

/// Coarse classification used by callers to pick a retry/report policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  /// Bad input (formula, missing fields, unknown id); nothing was mutated.
  Validation,
  /// The request contradicts current state; nothing was mutated.
  Conflict,
  /// Some sub-steps were applied before the failure; see the attached report.
  PartialFailure,
  /// Connection or transport failure; retry according to the caller's policy.
  Storage,
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("invalid formula {formula:?}: {reason}")]
  InvalidFormula { formula: String, reason: String },

  #[error("formula references unknown attribute ids: {0:?}")]
  UnknownAttribute(Vec<AttributeId>),

  #[error("attribute not found: {0}")]
  AttributeNotFound(AttributeId),

  #[error("element not found: {0}")]
  ElementNotFound(ElementId),

  /// A formula was supplied for an attribute with no active registration.
  #[error("attribute {0} is not a derived attribute")]
  NotDerived(AttributeId),

  #[error("invalid name {name:?}: {reason}")]
  InvalidName { name: String, reason: String },

  #[error("at least one of name, kks or formula must be provided")]
  NoFieldsProvided,

  #[error("element {element_id} already has an attribute named {name:?}")]
  DuplicateAttribute { element_id: ElementId, name: String },

  #[error("formula for attribute {0} would depend on itself")]
  CircularFormula(AttributeId),

  #[error("attribute {attribute_id} is a source of derived attributes {dependents:?}")]
  AttributeInUse {
    attribute_id: AttributeId,
    dependents:   Vec<AttributeId>,
  },

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl Error {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Error::InvalidFormula { .. }
      | Error::UnknownAttribute(_)
      | Error::AttributeNotFound(_)
      | Error::ElementNotFound(_)
      | Error::InvalidName { .. }
      | Error::NoFieldsProvided
      | Error::CircularFormula(_)
      | Error::Serialization(_) => ErrorKind::Validation,
      Error::NotDerived(_)
      | Error::DuplicateAttribute { .. }
      | Error::AttributeInUse { .. } => ErrorKind::Conflict,
    }
  }

  pub(crate) fn invalid_formula(formula: &str, reason: impl Into<String>) -> Self {
    Error::InvalidFormula { formula: formula.to_owned(), reason: reason.into() }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
