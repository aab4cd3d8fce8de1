//! Views: the read/write boundary between producer logic and storage.
//!
//! The executor opens one [`ReadView`] per input partition and one [`WriteView`] per output
//! partition. Producer logic only ever sees plain values. Every failure is attributed to the
//! artifact and partition it concerns.

mod local;

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;
use thiserror::Error;

use crate::artifact::{Artifact, NodePath};
use crate::descriptor::{FormatSpec, StorageError};
use crate::partition::PartitionKey;

pub use local::LocalStore;

/// An I/O failure on one artifact partition.
#[derive(Debug, Error)]
pub enum ViewError {
  #[error("no data for {artifact} partition {key}")]
  NotFound { artifact: NodePath, key: PartitionKey },

  #[error("io failure on {artifact} partition {key}: {source}")]
  Io {
    artifact: NodePath,
    key: PartitionKey,
    #[source]
    source: std::io::Error,
  },

  #[error("cannot decode {artifact} partition {key}: {message}")]
  Decode {
    artifact: NodePath,
    key: PartitionKey,
    message: String,
  },

  #[error("cannot locate {artifact} partition: {source}")]
  Location {
    artifact: NodePath,
    #[source]
    source: StorageError,
  },

  #[error("{artifact} uses format `{format}`, which this store cannot handle")]
  UnsupportedFormat { artifact: NodePath, format: FormatSpec },
}

impl ViewError {
  pub fn artifact(&self) -> &NodePath {
    match self {
      ViewError::NotFound { artifact, .. }
      | ViewError::Io { artifact, .. }
      | ViewError::Decode { artifact, .. }
      | ViewError::Location { artifact, .. }
      | ViewError::UnsupportedFormat { artifact, .. } => artifact,
    }
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, ViewError::NotFound { .. })
  }
}

/// The storage + format collaborator.
pub trait DataStore: Send + Sync {
  fn read(&self, artifact: &Artifact, key: &PartitionKey) -> Result<Value, ViewError>;

  /// Replace the partition's data. Must be atomic: a reader sees the old value or the new one.
  fn write(&self, artifact: &Artifact, key: &PartitionKey, value: &Value) -> Result<(), ViewError>;
}

/// Scoped read access to one input partition.
pub struct ReadView<'a> {
  store: &'a dyn DataStore,
  artifact: &'a Artifact,
  key: &'a PartitionKey,
}

impl<'a> ReadView<'a> {
  pub fn open(store: &'a dyn DataStore, artifact: &'a Artifact, key: &'a PartitionKey) -> Self {
    Self { store, artifact, key }
  }

  pub fn key(&self) -> &PartitionKey {
    self.key
  }

  pub fn read(&self) -> Result<Value, ViewError> {
    self.store.read(self.artifact, self.key)
  }
}

/// Scoped write access to one output partition.
///
/// Nothing reaches the store until [`WriteView::commit`]; dropping an uncommitted view discards
/// the staged value.
pub struct WriteView<'a> {
  store: &'a dyn DataStore,
  artifact: &'a Artifact,
  key: &'a PartitionKey,
  staged: Option<Value>,
}

impl<'a> WriteView<'a> {
  pub fn open(store: &'a dyn DataStore, artifact: &'a Artifact, key: &'a PartitionKey) -> Self {
    Self {
      store,
      artifact,
      key,
      staged: None,
    }
  }

  pub fn stage(&mut self, value: Value) {
    self.staged = Some(value);
  }

  pub fn is_staged(&self) -> bool {
    self.staged.is_some()
  }

  /// Write the staged value. Committing with nothing staged writes `null`.
  pub fn commit(self) -> Result<(), ViewError> {
    let value = self.staged.unwrap_or(Value::Null);
    self.store.write(self.artifact, self.key, &value)
  }
}

/// An in-process store keyed by artifact path and partition.
#[derive(Debug, Default)]
pub struct MemoryStore {
  data: RwLock<HashMap<(NodePath, PartitionKey), Value>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Put a value directly, bypassing views (for seeding sources).
  pub fn insert(&self, artifact: &NodePath, key: PartitionKey, value: Value) {
    let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
    data.insert((artifact.clone(), key), value);
  }

  pub fn get(&self, artifact: &NodePath, key: &PartitionKey) -> Option<Value> {
    let data = self.data.read().unwrap_or_else(|e| e.into_inner());
    data.get(&(artifact.clone(), key.clone())).cloned()
  }

  pub fn len(&self) -> usize {
    self.data.read().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl DataStore for MemoryStore {
  fn read(&self, artifact: &Artifact, key: &PartitionKey) -> Result<Value, ViewError> {
    self.get(&artifact.path, key).ok_or_else(|| ViewError::NotFound {
      artifact: artifact.path.clone(),
      key: key.clone(),
    })
  }

  fn write(&self, artifact: &Artifact, key: &PartitionKey, value: &Value) -> Result<(), ViewError> {
    self.insert(&artifact.path, key.clone(), value.clone());
    Ok(())
  }
}
