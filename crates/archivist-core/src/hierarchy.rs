//! The plant hierarchy: elements, the attributes attached to them, and the
//! path identity that survives a reload.
//!
//! Numeric ids are ephemeral; a reload reassigns all of them. The only stable
//! identity is the path `Root|Child|…|Attribute`, computed here from an arena
//! of elements indexed by id.

use std::{collections::HashMap, fmt};

use serde::{Deserialize, Serialize};

/// Separator between path segments in the textual path form.
pub const PATH_SEPARATOR: char = '|';

// ─── Ids ─────────────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ElementId(pub i64);

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct AttributeId(pub i64);

impl fmt::Display for ElementId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

impl fmt::Display for AttributeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

// ─── Rows ────────────────────────────────────────────────────────────────────

/// A hierarchy node. `level` is the depth from its root (roots are level 0).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
  pub element_id: ElementId,
  pub name:       String,
  pub level:      u32,
  pub parent_id:  Option<ElementId>,
}

/// A measurement slot on an element. Whether it is derived is decided by the
/// presence of a registration, not by a column on this row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
  pub attribute_id: AttributeId,
  pub element_id:   ElementId,
  pub name:         String,
  pub kks:          Option<String>,
}

// ─── Paths ───────────────────────────────────────────────────────────────────

/// Reload-stable identity of an attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttributePath {
  /// Element names from the root down to the owning element.
  pub elements: Vec<String>,
  pub name:     String,
}

impl AttributePath {
  pub fn new(elements: Vec<String>, name: impl Into<String>) -> Self {
    Self { elements, name: name.into() }
  }

  /// Parse the textual form. At least one element segment is required.
  pub fn parse(s: &str) -> Option<Self> {
    let mut parts: Vec<String> =
      s.split(PATH_SEPARATOR).map(str::to_owned).collect();
    if parts.len() < 2 || parts.iter().any(String::is_empty) {
      return None;
    }
    let name = parts.pop()?;
    Some(Self { elements: parts, name })
  }
}

impl fmt::Display for AttributePath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for segment in &self.elements {
      write!(f, "{segment}{PATH_SEPARATOR}")?;
    }
    f.write_str(&self.name)
  }
}

/// Element and attribute names become path segments, so they must be non-empty
/// and free of the separator.
pub fn validate_name(name: &str) -> crate::Result<&str> {
  let trimmed = name.trim();
  let reason = if trimmed.is_empty() {
    "name must not be empty"
  } else if trimmed.contains(PATH_SEPARATOR) {
    "name must not contain '|'"
  } else {
    return Ok(trimmed);
  };
  Err(crate::Error::InvalidName { name: name.to_owned(), reason: reason.to_owned() })
}

// ─── Arena ───────────────────────────────────────────────────────────────────

/// Elements indexed by id; paths are computed by walking parent links.
#[derive(Debug, Clone, Default)]
pub struct Hierarchy {
  elements: Vec<Element>,
  index:    HashMap<ElementId, usize>,
}

impl Hierarchy {
  pub fn new(elements: Vec<Element>) -> Self {
    let index = elements
      .iter()
      .enumerate()
      .map(|(slot, e)| (e.element_id, slot))
      .collect();
    Self { elements, index }
  }

  pub fn get(&self, id: ElementId) -> Option<&Element> {
    self.index.get(&id).map(|&slot| &self.elements[slot])
  }

  /// Names from the root down to `id`.
  ///
  /// Returns `None` if `id` is unknown, a parent link dangles, or the parent
  /// links form a cycle.
  pub fn element_path(&self, id: ElementId) -> Option<Vec<String>> {
    let mut names = Vec::new();
    let mut current = Some(id);
    while let Some(cur) = current {
      if names.len() > self.elements.len() {
        return None;
      }
      let element = self.get(cur)?;
      names.push(element.name.clone());
      current = element.parent_id;
    }
    names.reverse();
    Some(names)
  }

  pub fn attribute_path(&self, attribute: &Attribute) -> Option<AttributePath> {
    self
      .element_path(attribute.element_id)
      .map(|elements| AttributePath::new(elements, attribute.name.clone()))
  }

  /// Paths for every attribute whose element chain resolves; unresolvable
  /// attributes are left out.
  pub fn attribute_paths<'a>(
    &self,
    attributes: impl IntoIterator<Item = &'a Attribute>,
  ) -> Vec<(AttributeId, AttributePath)> {
    attributes
      .into_iter()
      .filter_map(|a| self.attribute_path(a).map(|p| (a.attribute_id, p)))
      .collect()
  }

  /// The element at `path`. With duplicate sibling names, the lowest id wins.
  pub fn find_element(&self, path: &[String]) -> Option<ElementId> {
    let leaf = path.last()?;
    self
      .elements
      .iter()
      .filter(|e| e.name == *leaf)
      .filter(|e| self.element_path(e.element_id).as_deref() == Some(path))
      .map(|e| e.element_id)
      .min()
  }
}
