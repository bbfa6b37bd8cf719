use archivist_core::{
  archive::IngestRow,
  error::ErrorKind,
  hierarchy::{AttributeId, ElementId},
  report::{AttributeUpdate, NewDerivedAttribute, UpdatedField},
  store::HistorianStore,
};

use super::{attr, file_store, seeded, ts, values, write};
use crate::{Error, SqliteStore};

async fn element_of(s: &SqliteStore, id: AttributeId) -> ElementId {
  s.get_attribute(id).await.unwrap().unwrap().element_id
}

async fn create(s: &SqliteStore, on: AttributeId, name: &str, formula: String) -> AttributeId {
  let element_id = element_of(s, on).await;
  s.create_derived_attribute(NewDerivedAttribute {
    element_id,
    name: name.into(),
    kks: None,
    formula,
  })
  .await
  .unwrap()
  .attribute
  .attribute_id
}

/// Make every insert into `derived_formulas` fail, so the activation step of
/// a create or formula update aborts after the first step has committed.
async fn block_installs(s: &SqliteStore) {
  s.conn
    .call(|conn| {
      conn.execute_batch(
        "CREATE TRIGGER block_installs BEFORE INSERT ON derived_formulas
         BEGIN SELECT RAISE(ABORT, 'installs blocked'); END;",
      )?;
      Ok(())
    })
    .await
    .unwrap();
}

fn core(e: Error) -> archivist_core::Error {
  match e {
    Error::Core(e) => e,
    other => panic!("expected a core error, got {other:?}"),
  }
}

// ─── Create ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn create_backfills_only_where_every_source_has_a_value() {
  let s = seeded().await;
  let temp = attr(&s, "Plant|Unit1|Temp").await;
  let flow = attr(&s, "Plant|Unit1|Flow").await;
  write(&s, &[(temp, 0, 10.0), (temp, 1, 11.0), (temp, 2, 12.0)]).await;
  write(&s, &[(flow, 1, 1.0), (flow, 2, 2.0), (flow, 3, 3.0)]).await;

  let report = s
    .create_derived_attribute(NewDerivedAttribute {
      element_id: element_of(&s, temp).await,
      name:       "Sum".into(),
      kks:        Some("10HFE10CE901".into()),
      formula:    format!("${temp} + ${flow}"),
    })
    .await
    .unwrap();

  assert_eq!(report.archive_records_inserted, 2);
  assert_eq!(report.attribute.kks.as_deref(), Some("10HFE10CE901"));
  let sum = report.attribute.attribute_id;
  assert_eq!(values(&s, sum).await, vec![(1, Some(12.0)), (2, Some(14.0))]);
  assert!(s.get_registration(sum).await.unwrap().is_some());
}

#[tokio::test]
async fn null_sources_and_non_finite_results_produce_no_row() {
  let s = seeded().await;
  let temp = attr(&s, "Plant|Unit1|Temp").await;
  let flow = attr(&s, "Plant|Unit1|Flow").await;
  write(&s, &[(temp, 0, 10.0), (temp, 1, 10.0), (flow, 1, 0.0), (flow, 2, 5.0)]).await;
  s.write_records(vec![IngestRow { attribute_id: temp, timestamp: ts(2), value: None }])
    .await
    .unwrap();

  let ratio = create(&s, temp, "Ratio", format!("${temp} / ${flow}")).await;

  // minute 0: no flow; minute 1: division by zero; minute 2: temp is null
  assert!(values(&s, ratio).await.is_empty());
}

#[tokio::test]
async fn live_recomputation_follows_source_writes() {
  let s = seeded().await;
  let temp = attr(&s, "Plant|Unit1|Temp").await;
  let flow = attr(&s, "Plant|Unit1|Flow").await;
  let sum = create(&s, temp, "Sum", format!("${temp} + ${flow}")).await;

  write(&s, &[(temp, 0, 1.0)]).await;
  assert!(values(&s, sum).await.is_empty());

  let summary = s
    .write_records(vec![IngestRow::new(flow, ts(0), 2.0)])
    .await
    .unwrap();
  assert_eq!(summary.derived_written, 1);
  assert_eq!(values(&s, sum).await, vec![(0, Some(3.0))]);

  write(&s, &[(temp, 0, 10.0)]).await;
  assert_eq!(values(&s, sum).await, vec![(0, Some(12.0))]);
}

#[tokio::test]
async fn derived_row_is_removed_when_a_source_turns_null() {
  let s = seeded().await;
  let temp = attr(&s, "Plant|Unit1|Temp").await;
  let flow = attr(&s, "Plant|Unit1|Flow").await;
  write(&s, &[(temp, 0, 1.0), (flow, 0, 2.0)]).await;
  let sum = create(&s, temp, "Sum", format!("${temp} + ${flow}")).await;
  assert_eq!(values(&s, sum).await.len(), 1);

  let summary = s
    .write_records(vec![IngestRow { attribute_id: flow, timestamp: ts(0), value: None }])
    .await
    .unwrap();
  assert_eq!(summary.derived_removed, 1);
  assert!(values(&s, sum).await.is_empty());
}

#[tokio::test]
async fn chains_of_derived_attributes_stay_current() {
  let s = seeded().await;
  let temp = attr(&s, "Plant|Unit1|Temp").await;
  let double = create(&s, temp, "Double", format!("${temp} * 2")).await;
  let plus_one = create(&s, temp, "DoublePlusOne", format!("${double} + 1")).await;

  write(&s, &[(temp, 0, 5.0)]).await;
  assert_eq!(values(&s, double).await, vec![(0, Some(10.0))]);
  assert_eq!(values(&s, plus_one).await, vec![(0, Some(11.0))]);
}

#[tokio::test]
async fn create_and_write_order_does_not_matter() {
  let rows = |temp, flow| {
    vec![
      (temp, 0, 1.0),
      (flow, 0, 2.0),
      (temp, 1, 3.0),
      (flow, 2, 4.0),
      (temp, 2, 5.0),
    ]
  };

  let early = seeded().await;
  let (t, f) = (attr(&early, "Plant|Unit1|Temp").await, attr(&early, "Plant|Unit1|Flow").await);
  let early_sum = create(&early, t, "Sum", format!("${t} * ${f}")).await;
  write(&early, &rows(t, f)).await;

  let late = seeded().await;
  write(&late, &rows(t, f)).await;
  let late_sum = create(&late, t, "Sum", format!("${t} * ${f}")).await;

  assert_eq!(values(&early, early_sum).await, values(&late, late_sum).await);
  assert_eq!(values(&late, late_sum).await, vec![(0, Some(2.0)), (2, Some(20.0))]);
}

#[tokio::test]
async fn backfill_is_idempotent() {
  let s = seeded().await;
  let temp = attr(&s, "Plant|Unit1|Temp").await;
  write(&s, &[(temp, 0, 1.0), (temp, 1, 2.0)]).await;
  let double = create(&s, temp, "Double", format!("${temp} * 2")).await;
  let before = values(&s, double).await;

  assert_eq!(s.backfill(double).await.unwrap(), 0);
  assert_eq!(values(&s, double).await, before);
}

#[tokio::test]
async fn backfill_requires_a_derived_attribute() {
  let s = seeded().await;
  let temp = attr(&s, "Plant|Unit1|Temp").await;
  assert!(matches!(
    core(s.backfill(temp).await.unwrap_err()),
    archivist_core::Error::NotDerived(_)
  ));
  assert!(matches!(
    core(s.backfill(AttributeId(9_999)).await.unwrap_err()),
    archivist_core::Error::AttributeNotFound(_)
  ));
}

#[tokio::test]
async fn create_rejects_bad_input_without_inserting() {
  let s = seeded().await;
  let temp = attr(&s, "Plant|Unit1|Temp").await;
  let unit1 = element_of(&s, temp).await;
  let before = s.stats().await.unwrap();

  let attempt = |name: &str, formula: &str, element_id| NewDerivedAttribute {
    element_id,
    name: name.into(),
    kks: None,
    formula: formula.into(),
  };

  let err = s
    .create_derived_attribute(attempt("X", "$9999 + 1", unit1))
    .await
    .unwrap_err();
  assert!(matches!(
    core(err),
    archivist_core::Error::UnknownAttribute(ids) if ids == vec![AttributeId(9_999)]
  ));

  let err = s
    .create_derived_attribute(attempt("X", &format!("${temp} +"), unit1))
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Validation);
  assert!(matches!(core(err), archivist_core::Error::InvalidFormula { .. }));

  let err = s
    .create_derived_attribute(attempt("Temp", &format!("${temp} * 2"), unit1))
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Conflict);

  let err = s
    .create_derived_attribute(attempt("X", &format!("${temp} * 2"), ElementId(9_999)))
    .await
    .unwrap_err();
  assert!(matches!(core(err), archivist_core::Error::ElementNotFound(_)));

  let err = s
    .create_derived_attribute(attempt("  ", &format!("${temp} * 2"), unit1))
    .await
    .unwrap_err();
  assert!(matches!(core(err), archivist_core::Error::InvalidName { .. }));

  assert_eq!(s.stats().await.unwrap(), before);
}

#[tokio::test]
async fn validate_formula_checks_ids_without_mutating() {
  let s = seeded().await;
  let temp = attr(&s, "Plant|Unit1|Temp").await;

  let formula = s.validate_formula(&format!("(${temp} + 1) / 2")).await.unwrap();
  assert_eq!(formula.sources().len(), 1);
  assert!(s.validate_formula("$9999").await.is_err());
  assert!(s.list_registrations().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_activation_leaves_an_inert_attribute() {
  let s = seeded().await;
  let temp = attr(&s, "Plant|Unit1|Temp").await;
  write(&s, &[(temp, 0, 1.0)]).await;
  block_installs(&s).await;

  let err = s
    .create_derived_attribute(NewDerivedAttribute {
      element_id: element_of(&s, temp).await,
      name:       "Double".into(),
      kks:        None,
      formula:    format!("${temp} * 2"),
    })
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::PartialFailure);
  let attribute_id = match err {
    Error::ActivationFailed { attribute_id, .. } => attribute_id,
    other => panic!("expected an activation failure, got {other:?}"),
  };

  // The row from the first step stays, but nothing computes into it.
  assert_eq!(attr(&s, "Plant|Unit1|Double").await, attribute_id);
  assert!(s.get_registration(attribute_id).await.unwrap().is_none());
  assert!(values(&s, attribute_id).await.is_empty());
  write(&s, &[(temp, 1, 2.0)]).await;
  assert!(values(&s, attribute_id).await.is_empty());
}

// ─── Update ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn update_formula_recomputes_history() {
  let s = seeded().await;
  let temp = attr(&s, "Plant|Unit1|Temp").await;
  let flow = attr(&s, "Plant|Unit1|Flow").await;
  write(&s, &[(temp, 0, 1.0), (temp, 1, 2.0), (flow, 1, 10.0)]).await;
  let derived = create(&s, temp, "Derived", format!("${temp} * 2")).await;
  assert_eq!(values(&s, derived).await.len(), 2);

  let report = s
    .update_attribute(derived, AttributeUpdate {
      formula: Some(format!("${temp} + ${flow}")),
      ..AttributeUpdate::default()
    })
    .await
    .unwrap();

  assert_eq!(report.updated_fields, vec![UpdatedField::Formula]);
  assert_eq!(report.trigger_dropped, Some(true));
  assert_eq!(report.archive_records_deleted, Some(2));
  assert_eq!(report.archive_records_inserted, Some(1));
  assert_eq!(report.trigger_installed, Some(true));
  assert_eq!(values(&s, derived).await, vec![(1, Some(12.0))]);

  // The new registration is live.
  write(&s, &[(flow, 0, 5.0)]).await;
  assert_eq!(values(&s, derived).await, vec![(0, Some(6.0)), (1, Some(12.0))]);
}

#[tokio::test]
async fn update_without_recompute_keeps_old_rows() {
  let s = seeded().await;
  let temp = attr(&s, "Plant|Unit1|Temp").await;
  write(&s, &[(temp, 0, 1.0)]).await;
  let derived = create(&s, temp, "Derived", format!("${temp} * 2")).await;

  let report = s
    .update_attribute(derived, AttributeUpdate {
      formula: Some(format!("${temp} * 3")),
      recompute_archive: false,
      ..AttributeUpdate::default()
    })
    .await
    .unwrap();

  assert_eq!(report.archive_records_deleted, None);
  assert_eq!(report.trigger_installed, Some(true));
  assert_eq!(values(&s, derived).await, vec![(0, Some(2.0))]);

  write(&s, &[(temp, 1, 1.0)]).await;
  assert_eq!(values(&s, derived).await, vec![(0, Some(2.0)), (1, Some(3.0))]);
}

#[tokio::test]
async fn failed_formula_install_reports_the_applied_steps() {
  let s = seeded().await;
  let temp = attr(&s, "Plant|Unit1|Temp").await;
  write(&s, &[(temp, 0, 1.0)]).await;
  let derived = create(&s, temp, "Derived", format!("${temp} * 2")).await;
  block_installs(&s).await;

  let err = s
    .update_attribute(derived, AttributeUpdate {
      name: Some("Tripled".into()),
      formula: Some(format!("${temp} * 3")),
      ..AttributeUpdate::default()
    })
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::PartialFailure);
  let report = match err {
    Error::PartialUpdate { report, .. } => report,
    other => panic!("expected a partial update, got {other:?}"),
  };
  assert_eq!(report.updated_fields, vec![UpdatedField::Name, UpdatedField::Formula]);
  assert_eq!(report.trigger_dropped, Some(true));
  assert_eq!(report.archive_records_deleted, None);
  assert_eq!(report.archive_records_inserted, None);
  assert_eq!(report.trigger_installed, None);

  // The first step committed: renamed and no longer derived. The second rolled
  // back whole, so the old rows are untouched.
  assert_eq!(attr(&s, "Plant|Unit1|Tripled").await, derived);
  assert!(s.get_registration(derived).await.unwrap().is_none());
  assert_eq!(values(&s, derived).await, vec![(0, Some(2.0))]);
}

#[tokio::test]
async fn formula_update_on_source_attribute_changes_nothing() {
  let s = seeded().await;
  let temp = attr(&s, "Plant|Unit1|Temp").await;
  let flow = attr(&s, "Plant|Unit1|Flow").await;
  write(&s, &[(temp, 0, 1.0)]).await;

  let err = s
    .update_attribute(temp, AttributeUpdate {
      name: Some("Renamed".into()),
      formula: Some(format!("${flow} * 2")),
      ..AttributeUpdate::default()
    })
    .await
    .unwrap_err();

  assert_eq!(err.kind(), ErrorKind::Conflict);
  assert!(matches!(core(err), archivist_core::Error::NotDerived(id) if id == temp));
  assert_eq!(s.get_attribute(temp).await.unwrap().unwrap().name, "Temp");
  assert_eq!(values(&s, temp).await, vec![(0, Some(1.0))]);
}

#[tokio::test]
async fn metadata_only_update() {
  let s = seeded().await;
  let temp = attr(&s, "Plant|Unit1|Temp").await;

  let report = s
    .update_attribute(temp, AttributeUpdate {
      name: Some("Temperature".into()),
      kks: Some("10HFE10CT002".into()),
      ..AttributeUpdate::default()
    })
    .await
    .unwrap();

  assert_eq!(report.updated_fields, vec![UpdatedField::Name, UpdatedField::Kks]);
  assert_eq!(report.trigger_dropped, None);
  let updated = s.get_attribute(temp).await.unwrap().unwrap();
  assert_eq!(updated.name, "Temperature");
  assert_eq!(updated.kks.as_deref(), Some("10HFE10CT002"));
}

#[tokio::test]
async fn update_rejects_empty_requests_and_name_clashes() {
  let s = seeded().await;
  let temp = attr(&s, "Plant|Unit1|Temp").await;

  let err = s.update_attribute(temp, AttributeUpdate::default()).await.unwrap_err();
  assert!(matches!(core(err), archivist_core::Error::NoFieldsProvided));

  let err = s
    .update_attribute(temp, AttributeUpdate {
      name: Some("Flow".into()),
      ..AttributeUpdate::default()
    })
    .await
    .unwrap_err();
  assert!(matches!(core(err), archivist_core::Error::DuplicateAttribute { .. }));

  let err = s
    .update_attribute(AttributeId(9_999), AttributeUpdate {
      name: Some("X".into()),
      ..AttributeUpdate::default()
    })
    .await
    .unwrap_err();
  assert!(matches!(core(err), archivist_core::Error::AttributeNotFound(_)));
}

#[tokio::test]
async fn formula_cycles_are_rejected() {
  let s = seeded().await;
  let temp = attr(&s, "Plant|Unit1|Temp").await;
  let a = create(&s, temp, "A", format!("${temp} + 1")).await;
  let b = create(&s, temp, "B", format!("${a} * 2")).await;

  for formula in [format!("${b} - 1"), format!("${a} + 1")] {
    let err = s
      .update_attribute(a, AttributeUpdate {
        formula: Some(formula),
        ..AttributeUpdate::default()
      })
      .await
      .unwrap_err();
    assert!(matches!(core(err), archivist_core::Error::CircularFormula(id) if id == a));
  }
  // The original registration survived the rejected updates.
  assert_eq!(
    s.get_registration(a).await.unwrap().unwrap().formula.text(),
    format!("${temp} + 1")
  );
}

// ─── Delete ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn delete_removes_row_history_and_registration() {
  let s = seeded().await;
  let temp = attr(&s, "Plant|Unit1|Temp").await;
  write(&s, &[(temp, 0, 1.0), (temp, 1, 2.0)]).await;
  let derived = create(&s, temp, "Double", format!("${temp} * 2")).await;

  let report = s.delete_attribute(derived).await.unwrap();
  assert_eq!(report.attributes_deleted, 1);
  assert_eq!(report.archive_records_deleted, 2);
  assert!(report.trigger_dropped);
  assert!(s.get_attribute(derived).await.unwrap().is_none());
  assert!(s.get_registration(derived).await.unwrap().is_none());

  // Source writes no longer produce anything for the deleted id.
  let summary = s
    .write_records(vec![IngestRow::new(temp, ts(5), 1.0)])
    .await
    .unwrap();
  assert_eq!(summary.derived_written, 0);
}

#[tokio::test]
async fn delete_refuses_sources_that_are_in_use() {
  let s = seeded().await;
  let temp = attr(&s, "Plant|Unit1|Temp").await;
  let derived = create(&s, temp, "Double", format!("${temp} * 2")).await;

  let err = s.delete_attribute(temp).await.unwrap_err();
  assert!(matches!(
    core(err),
    archivist_core::Error::AttributeInUse { dependents, .. } if dependents == vec![derived]
  ));

  s.delete_attribute(derived).await.unwrap();
  let report = s.delete_attribute(temp).await.unwrap();
  assert!(!report.trigger_dropped);
}

#[tokio::test]
async fn delete_unknown_attribute() {
  let s = seeded().await;
  let err = s.delete_attribute(AttributeId(9_999)).await.unwrap_err();
  assert!(matches!(core(err), archivist_core::Error::AttributeNotFound(_)));
}

// ─── Several connections ─────────────────────────────────────────────────────

#[tokio::test]
async fn registrations_are_visible_to_other_connections() {
  let dir = tempfile::tempdir().unwrap();
  let a = file_store(&dir).await;
  a.reload(super::plant()).await.unwrap();
  let b = file_store(&dir).await;

  let temp = attr(&a, "Plant|Unit1|Temp").await;
  // Prime b's registry cache before the registration exists.
  assert!(b.list_registrations().await.unwrap().is_empty());

  let double = create(&a, temp, "Double", format!("${temp} * 2")).await;
  write(&b, &[(temp, 0, 4.0)]).await;

  assert_eq!(values(&a, double).await, vec![(0, Some(8.0))]);
}

#[tokio::test]
async fn concurrent_writers_converge() {
  let dir = tempfile::tempdir().unwrap();
  let a = file_store(&dir).await;
  a.reload(super::plant()).await.unwrap();
  let b = file_store(&dir).await;

  let temp = attr(&a, "Plant|Unit1|Temp").await;
  let flow = attr(&a, "Plant|Unit1|Flow").await;
  let sum = create(&a, temp, "Sum", format!("${temp} + ${flow}")).await;

  let minutes: Vec<u32> = (0..40).collect();
  let temps = {
    let a = a.clone();
    let minutes = minutes.clone();
    tokio::spawn(async move {
      for m in minutes {
        write(&a, &[(temp, m, f64::from(m))]).await;
      }
    })
  };
  let flows = {
    let b = b.clone();
    let minutes = minutes.clone();
    tokio::spawn(async move {
      for m in minutes.into_iter().rev() {
        write(&b, &[(flow, m, 100.0)]).await;
      }
    })
  };
  temps.await.unwrap();
  flows.await.unwrap();

  let expected: Vec<(u32, Option<f64>)> =
    minutes.iter().map(|m| (*m, Some(f64::from(*m) + 100.0))).collect();
  assert_eq!(values(&a, sum).await, expected);
  assert_eq!(values(&b, sum).await, expected);
}
