//! Artifacts: named, typed, optionally partitioned dataset descriptors.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::descriptor::{FormatSpec, StorageSpec, TypeSpec};
use crate::fingerprint::Fingerprint;
use crate::partition::{PartitionDims, PartitionKey};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid path `{path}`: {reason}")]
pub struct PathError {
  pub path: String,
  pub reason: &'static str,
}

/// A dotted path in a graph's namespace, e.g. `vendor.transactions`.
///
/// Segments are non-empty and made of ASCII alphanumerics, `_` and `-`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodePath(String);

impl NodePath {
  pub fn parse(path: &str) -> Result<Self, PathError> {
    let err = |reason| PathError {
      path: path.to_string(),
      reason,
    };
    if path.is_empty() {
      return Err(err("path is empty"));
    }
    for segment in path.split('.') {
      if segment.is_empty() {
        return Err(err("empty segment"));
      }
      if !segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(err("segments may only contain ASCII letters, digits, `_` and `-`"));
      }
    }
    Ok(Self(path.to_string()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  pub fn segments(&self) -> impl Iterator<Item = &str> {
    self.0.split('.')
  }

  /// The enclosing namespace, if any: `vendor` for `vendor.transactions`.
  pub fn parent(&self) -> Option<NodePath> {
    self.0.rsplit_once('.').map(|(parent, _)| NodePath(parent.to_string()))
  }

  pub fn fingerprint(&self) -> Fingerprint {
    Fingerprint::of_str(&self.0)
  }
}

impl fmt::Display for NodePath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl FromStr for NodePath {
  type Err = PathError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

impl TryFrom<String> for NodePath {
  type Error = PathError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    Self::parse(&value)
  }
}

impl From<NodePath> for String {
  fn from(path: NodePath) -> Self {
    path.0
  }
}

/// Static, human-supplied metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
  pub key: String,
  pub value: Value,
}

/// Derived, time-varying metadata. The engine carries it but never reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistic {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub value: Option<Value>,
}

/// Describes an existing or produced dataset.
///
/// Everything here is fixed once the graph is sealed. The per-partition build state lives in
/// the ledger, keyed by the artifact's path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
  pub path: NodePath,
  #[serde(rename = "type")]
  pub type_spec: TypeSpec,
  pub format: FormatSpec,
  pub storage: StorageSpec,
  #[serde(default, skip_serializing_if = "PartitionDims::is_empty")]
  pub partition_by: PartitionDims,
  /// Partitions known to exist ahead of any build (for source artifacts).
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub partitions: Vec<PartitionKey>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub annotations: Vec<Annotation>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub statistics: Vec<Statistic>,
}

impl Artifact {
  /// An unpartitioned JSON artifact of type `any` with default storage.
  pub fn new(path: NodePath) -> Self {
    let storage = StorageSpec::default_for(path.as_str(), &PartitionDims::new());
    Self {
      path,
      type_spec: TypeSpec::any(),
      format: FormatSpec::json(),
      storage,
      partition_by: PartitionDims::new(),
      partitions: Vec::new(),
      annotations: Vec::new(),
      statistics: Vec::new(),
    }
  }

  pub fn with_type(mut self, type_spec: TypeSpec) -> Self {
    self.type_spec = type_spec;
    self
  }

  pub fn with_format(mut self, format: FormatSpec) -> Self {
    self.format = format;
    self
  }

  pub fn with_storage(mut self, storage: StorageSpec) -> Self {
    self.storage = storage;
    self
  }

  /// Partition by the given dimensions. Resets the storage template to the default layout if it
  /// was still the default.
  pub fn partitioned_by<I, S>(mut self, dims: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let was_default = self.storage == StorageSpec::default_for(self.path.as_str(), &self.partition_by);
    self.partition_by = dims.into_iter().map(Into::into).collect();
    if was_default {
      self.storage = StorageSpec::default_for(self.path.as_str(), &self.partition_by);
    }
    self
  }

  pub fn with_partitions(mut self, partitions: impl IntoIterator<Item = PartitionKey>) -> Self {
    self.partitions.extend(partitions);
    self
  }

  pub fn with_annotation(mut self, key: impl Into<String>, value: Value) -> Self {
    self.annotations.push(Annotation { key: key.into(), value });
    self
  }

  pub fn with_statistic(mut self, name: impl Into<String>) -> Self {
    self.statistics.push(Statistic {
      name: name.into(),
      value: None,
    });
    self
  }

  pub fn is_partitioned(&self) -> bool {
    !self.partition_by.is_empty()
  }

  /// Identity of the descriptor (path, type, format, storage and partitioning). Annotations and
  /// statistics do not contribute.
  pub fn fingerprint(&self) -> Fingerprint {
    let dims = Fingerprint::combine_all(self.partition_by.iter().map(|d| Fingerprint::of_str(&format!("dim:{}", d))));
    Fingerprint::combine_all([
      self.path.fingerprint(),
      self.type_spec.fingerprint(),
      self.format.fingerprint(),
      self.storage.fingerprint(),
      dims,
    ])
  }
}
