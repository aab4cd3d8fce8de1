//! File-backed ledger.
//!
//! # Storage Layout
//!
//! ```text
//! {state_dir}/
//! └── ledger.json   # { "version": 1, "artifacts": { "<path>": [ { partition, fingerprint } ] } }
//! ```
//!
//! The file is rewritten in full on every record, through a temp file in the same directory and
//! a rename, so a crash leaves either the previous or the new ledger on disk, never a mix.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::artifact::NodePath;
use crate::fingerprint::Fingerprint;
use crate::partition::PartitionKey;

use super::{Ledger, LedgerError};

pub const LEDGER_FILENAME: &str = "ledger.json";

/// Current on-disk format version.
pub const LEDGER_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerEntry {
  partition: PartitionKey,
  fingerprint: Fingerprint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerFile {
  version: u32,
  #[serde(default)]
  artifacts: BTreeMap<NodePath, Vec<LedgerEntry>>,
}

impl LedgerFile {
  fn new() -> Self {
    Self {
      version: LEDGER_VERSION,
      artifacts: BTreeMap::new(),
    }
  }
}

type Entries = BTreeMap<NodePath, BTreeMap<PartitionKey, Fingerprint>>;

/// A ledger persisted as JSON under a state directory.
#[derive(Debug)]
pub struct FileLedger {
  path: PathBuf,
  entries: Mutex<Entries>,
}

impl FileLedger {
  /// Open the ledger in `state_dir`. A missing file is an empty ledger.
  pub fn open(state_dir: &Path) -> Result<Self, LedgerError> {
    let path = state_dir.join(LEDGER_FILENAME);
    let file = match fs::read_to_string(&path) {
      Ok(content) => serde_json::from_str::<LedgerFile>(&content).map_err(|source| LedgerError::Parse {
        path: path.clone(),
        source,
      })?,
      Err(e) if e.kind() == io::ErrorKind::NotFound => LedgerFile::new(),
      Err(source) => return Err(LedgerError::Read { path, source }),
    };

    if file.version != LEDGER_VERSION {
      return Err(LedgerError::UnsupportedVersion(file.version));
    }

    let entries = file
      .artifacts
      .into_iter()
      .map(|(artifact, list)| {
        let parts = list.into_iter().map(|e| (e.partition, e.fingerprint)).collect();
        (artifact, parts)
      })
      .collect();

    debug!(path = %path.display(), "opened ledger");
    Ok(Self {
      path,
      entries: Mutex::new(entries),
    })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  fn save(&self, entries: &Entries) -> Result<(), LedgerError> {
    let write_err = |source| LedgerError::Write {
      path: self.path.clone(),
      source,
    };
    let dir = self.path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(dir).map_err(write_err)?;

    let file = LedgerFile {
      version: LEDGER_VERSION,
      artifacts: entries
        .iter()
        .map(|(artifact, parts)| {
          let list = parts
            .iter()
            .map(|(partition, fingerprint)| LedgerEntry {
              partition: partition.clone(),
              fingerprint: *fingerprint,
            })
            .collect();
          (artifact.clone(), list)
        })
        .collect(),
    };
    let content = serde_json::to_string_pretty(&file).map_err(LedgerError::Serialize)?;

    let mut temp = NamedTempFile::new_in(dir).map_err(write_err)?;
    temp.write_all(content.as_bytes()).map_err(write_err)?;
    temp.as_file().sync_all().map_err(write_err)?;
    temp.persist(&self.path).map_err(|e| write_err(e.error))?;
    Ok(())
  }
}

impl Ledger for FileLedger {
  fn get(&self, artifact: &NodePath, key: &PartitionKey) -> Result<Option<Fingerprint>, LedgerError> {
    let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    Ok(entries.get(artifact).and_then(|parts| parts.get(key)).copied())
  }

  /// Update the entry and rewrite the file. The in-memory entry only changes once the file is
  /// on disk.
  fn record(&self, artifact: &NodePath, key: &PartitionKey, fingerprint: Fingerprint) -> Result<(), LedgerError> {
    let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    let mut next = entries.clone();
    next.entry(artifact.clone()).or_default().insert(key.clone(), fingerprint);
    self.save(&next)?;
    *entries = next;
    debug!(artifact = %artifact, partition = %key, fingerprint = %fingerprint, "recorded ledger entry");
    Ok(())
  }

  fn partitions(&self, artifact: &NodePath) -> Result<Vec<(PartitionKey, Fingerprint)>, LedgerError> {
    let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
    Ok(
      entries
        .get(artifact)
        .map(|parts| parts.iter().map(|(k, f)| (k.clone(), *f)).collect())
        .unwrap_or_default(),
    )
  }
}
