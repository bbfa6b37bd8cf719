//! The hierarchy snapshot consumed by a reload.
//!
//! Produced externally by crawling the historian's asset tree. Either a single
//! root node or a list of roots; vendor fields beyond `name`, `children`,
//! `attributes` and `kks` are ignored.

use serde::{Deserialize, Serialize};

use crate::{Result, hierarchy::validate_name};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotAttribute {
  pub name: String,
  #[serde(default)]
  pub kks:  Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotNode {
  pub name:       String,
  #[serde(default)]
  pub children:   Vec<SnapshotNode>,
  #[serde(default)]
  pub attributes: Vec<SnapshotAttribute>,
}

impl SnapshotNode {
  pub fn new(name: impl Into<String>) -> Self {
    Self { name: name.into(), children: Vec::new(), attributes: Vec::new() }
  }

  pub fn with_child(mut self, child: SnapshotNode) -> Self {
    self.children.push(child);
    self
  }

  pub fn with_attribute(mut self, name: impl Into<String>, kks: Option<&str>) -> Self {
    self.attributes.push(SnapshotAttribute {
      name: name.into(),
      kks:  kks.map(str::to_owned),
    });
    self
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SnapshotDocument", into = "Vec<SnapshotNode>")]
pub struct Snapshot {
  pub roots: Vec<SnapshotNode>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SnapshotDocument {
  Forest(Vec<SnapshotNode>),
  Tree(SnapshotNode),
}

impl From<SnapshotDocument> for Snapshot {
  fn from(doc: SnapshotDocument) -> Self {
    match doc {
      SnapshotDocument::Forest(roots) => Snapshot { roots },
      SnapshotDocument::Tree(root) => Snapshot { roots: vec![root] },
    }
  }
}

impl From<Snapshot> for Vec<SnapshotNode> {
  fn from(s: Snapshot) -> Self { s.roots }
}

impl Snapshot {
  pub fn new(roots: Vec<SnapshotNode>) -> Self { Self { roots } }

  pub fn from_json(json: &str) -> Result<Self> { Ok(serde_json::from_str(json)?) }

  pub fn element_count(&self) -> usize {
    fn count(n: &SnapshotNode) -> usize { 1 + n.children.iter().map(count).sum::<usize>() }
    self.roots.iter().map(count).sum()
  }

  /// Check every element and attribute name before anything is torn down.
  /// Names become path segments, so they must be non-empty and free of `|`.
  pub fn validate(&self) -> Result<()> {
    let mut stack: Vec<&SnapshotNode> = self.roots.iter().collect();
    while let Some(node) = stack.pop() {
      validate_name(&node.name)?;
      for attribute in &node.attributes {
        validate_name(&attribute.name)?;
      }
      stack.extend(&node.children);
    }
    Ok(())
  }

  pub fn attribute_count(&self) -> usize {
    fn count(n: &SnapshotNode) -> usize {
      n.attributes.len() + n.children.iter().map(count).sum::<usize>()
    }
    self.roots.iter().map(count).sum()
  }
}
