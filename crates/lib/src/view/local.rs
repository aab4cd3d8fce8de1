//! JSON files on the local filesystem.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::trace;

use crate::artifact::Artifact;
use crate::partition::PartitionKey;

use super::{DataStore, ViewError};

/// Stores each partition as a JSON file at its storage template's resolved location, relative
/// to `root`.
#[derive(Debug, Clone)]
pub struct LocalStore {
  root: PathBuf,
}

impl LocalStore {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  /// Where a partition lives on disk.
  pub fn location(&self, artifact: &Artifact, key: &PartitionKey) -> Result<PathBuf, ViewError> {
    if artifact.format.0 != "json" {
      return Err(ViewError::UnsupportedFormat {
        artifact: artifact.path.clone(),
        format: artifact.format.clone(),
      });
    }
    let relative = artifact.storage.resolve(key).map_err(|source| ViewError::Location {
      artifact: artifact.path.clone(),
      source,
    })?;
    Ok(self.root.join(relative))
  }
}

impl DataStore for LocalStore {
  fn read(&self, artifact: &Artifact, key: &PartitionKey) -> Result<Value, ViewError> {
    let path = self.location(artifact, key)?;
    trace!(path = %path.display(), "reading partition");
    let content = match fs::read_to_string(&path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        return Err(ViewError::NotFound {
          artifact: artifact.path.clone(),
          key: key.clone(),
        });
      }
      Err(source) => {
        return Err(ViewError::Io {
          artifact: artifact.path.clone(),
          key: key.clone(),
          source,
        });
      }
    };
    serde_json::from_str(&content).map_err(|e| ViewError::Decode {
      artifact: artifact.path.clone(),
      key: key.clone(),
      message: e.to_string(),
    })
  }

  fn write(&self, artifact: &Artifact, key: &PartitionKey, value: &Value) -> Result<(), ViewError> {
    let path = self.location(artifact, key)?;
    let io_err = |source| ViewError::Io {
      artifact: artifact.path.clone(),
      key: key.clone(),
      source,
    };
    let dir = path.parent().unwrap_or(self.root.as_path());
    fs::create_dir_all(dir).map_err(io_err)?;

    let content = serde_json::to_vec_pretty(value).map_err(|e| ViewError::Decode {
      artifact: artifact.path.clone(),
      key: key.clone(),
      message: e.to_string(),
    })?;
    let mut temp = NamedTempFile::new_in(dir).map_err(io_err)?;
    temp.write_all(&content).map_err(io_err)?;
    // On disk before the ledger can point at it.
    temp.as_file().sync_all().map_err(io_err)?;
    temp.persist(&path).map_err(|e| io_err(e.error))?;
    trace!(path = %path.display(), "wrote partition");
    Ok(())
  }
}
