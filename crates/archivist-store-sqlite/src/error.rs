//! Error type for `archivist-store-sqlite`.

use archivist_core::{
  error::ErrorKind,
  hierarchy::AttributeId,
  report::UpdateReport,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] archivist_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  #[error("uuid error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("a reload is already running on this store")]
  ReloadInProgress,

  /// The foreign-key check after a reload found rows it could not account
  /// for.
  #[error("{0} rows violate foreign keys after reload")]
  ForeignKeyViolations(usize),

  /// `Create` committed the attribute row but could not activate its formula.
  /// The attribute exists as an inert (non-derived) attribute.
  #[error("attribute {attribute_id} was created but its formula was not activated: {source}")]
  ActivationFailed {
    attribute_id: AttributeId,
    #[source]
    source:       Box<Error>,
  },

  /// A formula update failed after some sub-steps were applied.
  #[error("update of attribute {} partially applied: {source}", report.attribute_id)]
  PartialUpdate {
    report: Box<UpdateReport>,
    #[source]
    source: Box<Error>,
  },
}

impl Error {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Error::Core(e) => e.kind(),
      Error::ReloadInProgress => ErrorKind::Conflict,
      Error::ActivationFailed { .. } | Error::PartialUpdate { .. } => {
        ErrorKind::PartialFailure
      }
      Error::Database(_)
      | Error::Sqlite(_)
      | Error::Json(_)
      | Error::DateParse(_)
      | Error::Uuid(_)
      | Error::ForeignKeyViolations(_) => ErrorKind::Storage,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn staged_failures_are_partial() {
    let inner = Error::Sqlite(rusqlite::Error::QueryReturnedNoRows);
    assert_eq!(inner.kind(), ErrorKind::Storage);

    let err = Error::ActivationFailed { attribute_id: AttributeId(4), source: Box::new(inner) };
    assert_eq!(err.kind(), ErrorKind::PartialFailure);

    let err = Error::PartialUpdate {
      report: Box::new(UpdateReport::new(AttributeId(4))),
      source: Box::new(Error::ReloadInProgress),
    };
    assert_eq!(err.kind(), ErrorKind::PartialFailure);
  }

  #[test]
  fn core_errors_keep_their_kind() {
    let err: Error = archivist_core::Error::NotDerived(AttributeId(1)).into();
    assert_eq!(err.kind(), ErrorKind::Conflict);
  }
}
