//! Type, format and storage descriptors attached to artifacts.
//!
//! The engine treats these as opaque: it compares them, fingerprints them, and asks a
//! [`TypeSystem`] whether two types are compatible. The catalog of concrete types lives outside
//! the engine.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::fingerprint::Fingerprint;
use crate::partition::{PartitionDims, PartitionKey};

/// Matches any type under [`ExactTypes`] and [`JsonTypes`].
pub const ANY_TYPE: &str = "any";

/// An opaque type name such as `int64`, `object` or `struct<date:date,total:int64>`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeSpec(pub String);

impl TypeSpec {
  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }

  pub fn any() -> Self {
    Self(ANY_TYPE.to_string())
  }

  pub fn fingerprint(&self) -> Fingerprint {
    Fingerprint::of_str(&format!("type:{}", self.0))
  }
}

impl fmt::Display for TypeSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// An opaque serialization format name such as `json`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormatSpec(pub String);

impl FormatSpec {
  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }

  pub fn json() -> Self {
    Self("json".to_string())
  }

  pub fn fingerprint(&self) -> Fingerprint {
    Fingerprint::of_str(&format!("format:{}", self.0))
  }
}

impl fmt::Display for FormatSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StorageError {
  #[error("malformed storage template `{0}`")]
  Template(String),

  #[error("storage template `{template}` has no value for `{dim}` in partition {key}")]
  MissingDimension {
    template: String,
    dim: String,
    key: PartitionKey,
  },
}

/// Where an artifact's partitions live: a relative location template with `{dimension}`
/// placeholders, e.g. `vendor/transactions/{date}.json`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageSpec {
  pub template: String,
}

impl StorageSpec {
  pub fn new(template: impl Into<String>) -> Self {
    Self {
      template: template.into(),
    }
  }

  /// `a.b.c` partitioned by `date` becomes `a/b/c/date={date}.json`.
  pub fn default_for(path: &str, dims: &PartitionDims) -> Self {
    let mut template = path.replace('.', "/");
    for dim in dims {
      template.push_str(&format!("/{}={{{}}}", dim, dim));
    }
    template.push_str(".json");
    Self { template }
  }

  /// Placeholder names used by the template.
  pub fn placeholders(&self) -> Result<BTreeSet<String>, StorageError> {
    let malformed = || StorageError::Template(self.template.clone());
    let mut names = BTreeSet::new();
    let mut rest = self.template.as_str();
    while let Some(open) = rest.find(['{', '}']) {
      if rest.as_bytes()[open] == b'}' {
        return Err(malformed());
      }
      let after = &rest[open + 1..];
      let close = after.find('}').ok_or_else(malformed)?;
      let name = &after[..close];
      if name.is_empty() || name.contains('{') {
        return Err(malformed());
      }
      names.insert(name.to_string());
      rest = &after[close + 1..];
    }
    Ok(names)
  }

  /// Location of one partition.
  pub fn resolve(&self, key: &PartitionKey) -> Result<String, StorageError> {
    let mut location = self.template.clone();
    for dim in self.placeholders()? {
      let value = key.get(&dim).ok_or_else(|| StorageError::MissingDimension {
        template: self.template.clone(),
        dim: dim.clone(),
        key: key.clone(),
      })?;
      location = location.replace(&format!("{{{}}}", dim), value);
    }
    Ok(location)
  }

  /// The template with every placeholder name erased. Two templates with the same shape can
  /// resolve to the same location.
  pub fn shape(&self) -> Result<String, StorageError> {
    let mut shape = self.template.clone();
    for dim in self.placeholders()? {
      shape = shape.replace(&format!("{{{}}}", dim), "{}");
    }
    Ok(shape)
  }

  pub fn fingerprint(&self) -> Fingerprint {
    Fingerprint::of_str(&format!("storage:{}", self.template))
  }
}

impl fmt::Display for StorageSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.template)
  }
}

/// The type-compatibility collaborator.
///
/// `is_compatible` is consulted when a graph is sealed (a producer's declared role type against
/// the artifact's type) and, when enabled, when outputs are written (`type_of` the produced
/// value against the artifact's type).
pub trait TypeSystem: Send + Sync {
  fn is_compatible(&self, declared: &TypeSpec, produced: &TypeSpec) -> bool;

  /// Classify a produced value. `None` skips the dynamic check.
  fn type_of(&self, _value: &Value) -> Option<TypeSpec> {
    None
  }
}

/// Types are compatible when equal, or when either side is `any`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactTypes;

impl TypeSystem for ExactTypes {
  fn is_compatible(&self, declared: &TypeSpec, produced: &TypeSpec) -> bool {
    declared == produced || declared.0 == ANY_TYPE || produced.0 == ANY_TYPE
  }
}

/// [`ExactTypes`] plus classification of JSON values into
/// `null`, `boolean`, `number`, `string`, `array` and `object`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonTypes;

impl TypeSystem for JsonTypes {
  fn is_compatible(&self, declared: &TypeSpec, produced: &TypeSpec) -> bool {
    ExactTypes.is_compatible(declared, produced)
  }

  fn type_of(&self, value: &Value) -> Option<TypeSpec> {
    let name = match value {
      Value::Null => "null",
      Value::Bool(_) => "boolean",
      Value::Number(_) => "number",
      Value::String(_) => "string",
      Value::Array(_) => "array",
      Value::Object(_) => "object",
    };
    Some(TypeSpec::new(name))
  }
}
