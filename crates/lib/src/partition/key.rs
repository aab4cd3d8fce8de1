//! Partition keys and filters.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fingerprint::Fingerprint;

/// The set of dimension names an artifact is partitioned by.
pub type PartitionDims = BTreeSet<String>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartitionKeyError {
  #[error("invalid partition component `{0}`: expected `dimension=value`")]
  Component(String),

  #[error("duplicate partition dimension `{0}`")]
  DuplicateDimension(String),
}

/// Addresses one partition of an artifact: an ordered `dimension -> value` map.
///
/// Unpartitioned artifacts have exactly one partition, addressed by the empty key.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(BTreeMap<String, String>);

impl PartitionKey {
  /// The key of an unpartitioned artifact.
  pub fn empty() -> Self {
    Self::default()
  }

  pub fn new<K, V, I>(components: I) -> Self
  where
    K: Into<String>,
    V: Into<String>,
    I: IntoIterator<Item = (K, V)>,
  {
    Self(components.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
  }

  /// Shorthand for a single-dimension key.
  pub fn single(dim: impl Into<String>, value: impl Into<String>) -> Self {
    Self::new([(dim, value)])
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn get(&self, dim: &str) -> Option<&str> {
    self.0.get(dim).map(String::as_str)
  }

  pub fn dims(&self) -> PartitionDims {
    self.0.keys().cloned().collect()
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  /// Stable `dim=value/dim=value` form; empty for the unpartitioned key.
  pub fn canonical(&self) -> String {
    self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join("/")
  }

  pub fn fingerprint(&self) -> Fingerprint {
    if self.is_empty() {
      return Fingerprint::empty();
    }
    Fingerprint::of_str(&self.canonical())
  }

  /// Project onto a subset of dimensions. Dimensions the key lacks are ignored.
  pub fn project(&self, dims: &PartitionDims) -> PartitionKey {
    Self(
      self
        .0
        .iter()
        .filter(|(k, _)| dims.contains(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect(),
    )
  }
}

impl fmt::Display for PartitionKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_empty() {
      write!(f, "(unpartitioned)")
    } else {
      write!(f, "{}", self.canonical())
    }
  }
}

impl FromStr for PartitionKey {
  type Err = PartitionKeyError;

  /// Parse `a=1,b=2` or `a=1/b=2`. The empty string is the empty key.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut components = BTreeMap::new();
    for part in s.split([',', '/']).map(str::trim).filter(|p| !p.is_empty()) {
      let (dim, value) = part
        .split_once('=')
        .filter(|(d, _)| !d.trim().is_empty())
        .ok_or_else(|| PartitionKeyError::Component(part.to_string()))?;
      let dim = dim.trim().to_string();
      if components.insert(dim.clone(), value.trim().to_string()).is_some() {
        return Err(PartitionKeyError::DuplicateDimension(dim));
      }
    }
    Ok(Self(components))
  }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PartitionKey {
  fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
    Self::new(iter)
  }
}

/// Selects partitions by a partial key.
///
/// A key matches when every filtered dimension it carries has the filtered value. Dimensions the
/// key does not carry never exclude it, so unpartitioned outputs always match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionFilter(PartitionKey);

impl PartitionFilter {
  pub fn all() -> Self {
    Self::default()
  }

  pub fn new(key: PartitionKey) -> Self {
    Self(key)
  }

  pub fn is_all(&self) -> bool {
    self.0.is_empty()
  }

  pub fn matches(&self, key: &PartitionKey) -> bool {
    self.0.iter().all(|(dim, value)| key.get(dim).is_none_or(|v| v == value))
  }
}

impl From<PartitionKey> for PartitionFilter {
  fn from(key: PartitionKey) -> Self {
    Self(key)
  }
}

impl fmt::Display for PartitionFilter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_all() {
      write!(f, "*")
    } else {
      write!(f, "{}", self.0.canonical())
    }
  }
}
