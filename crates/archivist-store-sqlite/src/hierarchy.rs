//! Synchronous hierarchy queries, run inside `Connection::call` closures or
//! open transactions.

use std::collections::{BTreeMap, HashMap};

use archivist_core::{
  hierarchy::{Attribute, AttributeId, AttributePath, Element, ElementId, Hierarchy},
  report::StoreStats,
};
use rusqlite::{Connection, OptionalExtension as _};

use crate::{
  Result,
  encode::{ATTRIBUTE_COLUMNS, ELEMENT_COLUMNS, attribute_from_row, element_from_row},
};

pub fn list_elements(conn: &Connection) -> Result<Vec<Element>> {
  let mut stmt =
    conn.prepare(&format!("SELECT {ELEMENT_COLUMNS} FROM elements ORDER BY element_id"))?;
  let rows = stmt
    .query_map([], element_from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(rows)
}

pub fn get_element(conn: &Connection, id: ElementId) -> Result<Option<Element>> {
  Ok(
    conn
      .query_row(
        &format!("SELECT {ELEMENT_COLUMNS} FROM elements WHERE element_id = ?1"),
        rusqlite::params![id.0],
        element_from_row,
      )
      .optional()?,
  )
}

pub fn list_attributes(conn: &Connection, element: Option<ElementId>) -> Result<Vec<Attribute>> {
  let rows = if let Some(e) = element {
    let mut stmt = conn.prepare(&format!(
      "SELECT {ATTRIBUTE_COLUMNS} FROM attributes WHERE element_id = ?1 ORDER BY attribute_id"
    ))?;
    stmt
      .query_map(rusqlite::params![e.0], attribute_from_row)?
      .collect::<rusqlite::Result<Vec<_>>>()?
  } else {
    let mut stmt = conn.prepare(&format!(
      "SELECT {ATTRIBUTE_COLUMNS} FROM attributes ORDER BY attribute_id"
    ))?;
    stmt
      .query_map([], attribute_from_row)?
      .collect::<rusqlite::Result<Vec<_>>>()?
  };
  Ok(rows)
}

/// Elements whose name matches the `LIKE` pattern (`%`, `_`; ASCII case is
/// ignored), ordered by name.
pub fn search_elements(conn: &Connection, pattern: &str) -> Result<Vec<Element>> {
  let mut stmt = conn.prepare(&format!(
    "SELECT {ELEMENT_COLUMNS} FROM elements WHERE name LIKE ?1 ORDER BY name, element_id"
  ))?;
  let rows = stmt
    .query_map(rusqlite::params![pattern], element_from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(rows)
}

pub fn search_attributes(
  conn: &Connection,
  pattern: &str,
  element: Option<ElementId>,
) -> Result<Vec<Attribute>> {
  let mut stmt = conn.prepare(&format!(
    "SELECT {ATTRIBUTE_COLUMNS} FROM attributes
     WHERE name LIKE ?1 AND (?2 IS NULL OR element_id = ?2)
     ORDER BY name, attribute_id"
  ))?;
  let rows = stmt
    .query_map(rusqlite::params![pattern, element.map(|e| e.0)], attribute_from_row)?
    .collect::<rusqlite::Result<Vec<_>>>()?;
  Ok(rows)
}

pub fn get_attribute(conn: &Connection, id: AttributeId) -> Result<Option<Attribute>> {
  Ok(
    conn
      .query_row(
        &format!("SELECT {ATTRIBUTE_COLUMNS} FROM attributes WHERE attribute_id = ?1"),
        rusqlite::params![id.0],
        attribute_from_row,
      )
      .optional()?,
  )
}

pub fn attribute_exists(conn: &Connection, id: AttributeId) -> Result<bool> {
  let mut stmt = conn.prepare_cached("SELECT 1 FROM attributes WHERE attribute_id = ?1")?;
  Ok(stmt.exists(rusqlite::params![id.0])?)
}

/// Lowest-id attribute named `name` on `element`.
pub fn find_on_element(
  conn: &Connection,
  element: ElementId,
  name: &str,
) -> Result<Option<AttributeId>> {
  Ok(
    conn
      .query_row(
        "SELECT MIN(attribute_id) FROM attributes WHERE element_id = ?1 AND name = ?2",
        rusqlite::params![element.0, name],
        |r| r.get::<_, Option<i64>>(0),
      )?
      .map(AttributeId),
  )
}

pub fn insert_element(
  conn: &Connection,
  name: &str,
  level: u32,
  parent: Option<ElementId>,
) -> Result<ElementId> {
  let mut stmt = conn.prepare_cached(
    "INSERT INTO elements (name, level, parent_id) VALUES (?1, ?2, ?3) RETURNING element_id",
  )?;
  let id = stmt.query_row(rusqlite::params![name, level, parent.map(|p| p.0)], |r| {
    r.get(0)
  })?;
  Ok(ElementId(id))
}

pub fn insert_attribute(
  conn: &Connection,
  element: ElementId,
  name: &str,
  kks: Option<&str>,
) -> Result<Attribute> {
  let mut stmt = conn.prepare_cached(
    "INSERT INTO attributes (element_id, name, kks) VALUES (?1, ?2, ?3) RETURNING attribute_id",
  )?;
  let id = stmt.query_row(rusqlite::params![element.0, name, kks], |r| r.get(0))?;
  Ok(Attribute {
    attribute_id: AttributeId(id),
    element_id:   element,
    name:         name.to_owned(),
    kks:          kks.map(str::to_owned),
  })
}

// ─── Path resolution ─────────────────────────────────────────────────────────

/// The hierarchy together with every attribute and its resolved path.
pub struct PathIndex {
  pub hierarchy: Hierarchy,
  pub paths:     Vec<(AttributeId, AttributePath)>,
}

impl PathIndex {
  pub fn load(conn: &Connection) -> Result<Self> {
    let hierarchy = Hierarchy::new(list_elements(conn)?);
    let attributes = list_attributes(conn, None)?;
    let paths = hierarchy.attribute_paths(&attributes);
    Ok(Self { hierarchy, paths })
  }

  /// Path → id. Attributes are visited in id order, so on a duplicate path
  /// the lowest id wins.
  pub fn by_path(&self) -> HashMap<&AttributePath, AttributeId> {
    let mut map = HashMap::with_capacity(self.paths.len());
    for (id, path) in &self.paths {
      map.entry(path).or_insert(*id);
    }
    map
  }

  pub fn into_text_map(self) -> BTreeMap<String, AttributeId> {
    let mut map = BTreeMap::new();
    for (id, path) in self.paths {
      map.entry(path.to_string()).or_insert(id);
    }
    map
  }
}

pub fn find_attribute_by_path(
  conn: &Connection,
  path: &AttributePath,
) -> Result<Option<Attribute>> {
  let hierarchy = Hierarchy::new(list_elements(conn)?);
  let Some(element) = hierarchy.find_element(&path.elements) else {
    return Ok(None);
  };
  match find_on_element(conn, element, &path.name)? {
    Some(id) => get_attribute(conn, id),
    None => Ok(None),
  }
}

pub fn count_rows(conn: &Connection, table: &str) -> Result<usize> {
  let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
  Ok(usize::try_from(n).unwrap_or_default())
}

pub fn stats(conn: &Connection) -> Result<StoreStats> {
  Ok(StoreStats {
    elements:           count_rows(conn, "elements")?,
    attributes:         count_rows(conn, "attributes")?,
    archive_records:    count_rows(conn, "archive")?,
    derived_attributes: count_rows(conn, "derived_formulas")?,
  })
}
