use archivist_core::store::HistorianStore;

use super::{attr, seeded};

#[tokio::test]
async fn search_elements_by_pattern() {
  let s = seeded().await;

  let units: Vec<String> =
    s.search_elements("unit%").await.unwrap().into_iter().map(|e| e.name).collect();
  assert_eq!(units, vec!["Unit1", "Unit2"]);

  let exact = s.search_elements("Plant").await.unwrap();
  assert_eq!(exact.len(), 1);
  assert_eq!(exact[0].parent_id, None);

  assert!(s.search_elements("Boiler%").await.unwrap().is_empty());
}

#[tokio::test]
async fn search_attributes_optionally_within_an_element() {
  let s = seeded().await;
  let unit1_temp = attr(&s, "Plant|Unit1|Temp").await;
  let unit2_temp = attr(&s, "Plant|Unit2|Temp").await;

  let temps: Vec<_> = s
    .search_attributes("TEMP", None)
    .await
    .unwrap()
    .into_iter()
    .map(|a| a.attribute_id)
    .collect();
  assert_eq!(temps, vec![unit1_temp, unit2_temp]);

  let unit1 = s.get_attribute(unit1_temp).await.unwrap().unwrap().element_id;
  let on_unit1: Vec<String> = s
    .search_attributes("%", Some(unit1))
    .await
    .unwrap()
    .into_iter()
    .map(|a| a.name)
    .collect();
  assert_eq!(on_unit1, vec!["Flow", "Temp"]);

  assert_eq!(s.search_attributes("Fl_w", None).await.unwrap().len(), 1);
}
