use std::path::{Path, PathBuf};

use crate::ledger::{FileLedger, LedgerError};
use crate::view::LocalStore;

pub const DEFAULT_DEFINITION_FILE: &str = "arti.toml";
pub const DEFAULT_STATE_DIR: &str = ".arti";
pub const STATE_DIR_ENV: &str = "ARTI_STATE_DIR";

/// Pick the state directory: an explicit path, else `ARTI_STATE_DIR`, else `.arti` beside the
/// definition file.
pub fn resolve_state_dir(explicit: Option<&Path>, definition: &Path) -> PathBuf {
  if let Some(path) = explicit {
    return path.to_path_buf();
  }
  if let Ok(path) = std::env::var(STATE_DIR_ENV)
    && !path.is_empty()
  {
    return PathBuf::from(path);
  }
  definition
    .parent()
    .map(|dir| dir.join(DEFAULT_STATE_DIR))
    .unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR))
}

/// Where a graph's ledger and data live.
#[derive(Debug, Clone)]
pub struct StateDir {
  root: PathBuf,
}

impl StateDir {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn data_dir(&self) -> PathBuf {
    self.root.join("data")
  }

  pub fn ledger(&self) -> Result<FileLedger, LedgerError> {
    FileLedger::open(&self.root)
  }

  pub fn store(&self) -> LocalStore {
    LocalStore::new(self.data_dir())
  }
}
