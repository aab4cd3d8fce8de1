//! The build ledger: last-built fingerprint per artifact partition.
//!
//! The ledger is the only state that survives across runs. The planner reads it to decide
//! staleness; the executor writes one entry per successful unit, after that unit's data write.

mod storage;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;

use thiserror::Error;

use crate::artifact::NodePath;
use crate::fingerprint::Fingerprint;
use crate::partition::PartitionKey;

pub use storage::{FileLedger, LEDGER_FILENAME, LEDGER_VERSION};

#[derive(Debug, Error)]
pub enum LedgerError {
  #[error("failed to read ledger {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to write ledger {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse ledger {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to serialize ledger: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("unsupported ledger version {0}")]
  UnsupportedVersion(u32),
}

/// Persisted `artifact path + partition key -> fingerprint` mapping.
///
/// Implementations must make `get` strongly consistent with the last `record` for that key.
pub trait Ledger: Send + Sync {
  fn get(&self, artifact: &NodePath, key: &PartitionKey) -> Result<Option<Fingerprint>, LedgerError>;

  fn record(&self, artifact: &NodePath, key: &PartitionKey, fingerprint: Fingerprint) -> Result<(), LedgerError>;

  /// Every recorded partition of `artifact`, in key order.
  fn partitions(&self, artifact: &NodePath) -> Result<Vec<(PartitionKey, Fingerprint)>, LedgerError>;
}

type Entries = BTreeMap<NodePath, BTreeMap<PartitionKey, Fingerprint>>;

/// An in-process ledger. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryLedger {
  entries: RwLock<Entries>,
}

impl MemoryLedger {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self
      .entries
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .values()
      .map(BTreeMap::len)
      .sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl Ledger for MemoryLedger {
  fn get(&self, artifact: &NodePath, key: &PartitionKey) -> Result<Option<Fingerprint>, LedgerError> {
    let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
    Ok(entries.get(artifact).and_then(|parts| parts.get(key)).copied())
  }

  fn record(&self, artifact: &NodePath, key: &PartitionKey, fingerprint: Fingerprint) -> Result<(), LedgerError> {
    let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
    entries
      .entry(artifact.clone())
      .or_default()
      .insert(key.clone(), fingerprint);
    Ok(())
  }

  fn partitions(&self, artifact: &NodePath) -> Result<Vec<(PartitionKey, Fingerprint)>, LedgerError> {
    let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
    Ok(
      entries
        .get(artifact)
        .map(|parts| parts.iter().map(|(k, f)| (k.clone(), *f)).collect())
        .unwrap_or_default(),
    )
  }
}
