//! Recording source artifact fingerprints.
//!
//! Source artifacts have no producer, so nothing records their ledger entries during a build.
//! [`seed`] reads each known partition of every source and records a fingerprint of its content,
//! which is what downstream targets are computed from. Re-seeding unchanged data records the same
//! fingerprint, so nothing downstream becomes stale.

use std::collections::BTreeSet;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::artifact::NodePath;
use crate::fingerprint::Fingerprint;
use crate::graph::Graph;
use crate::ledger::{Ledger, LedgerError};
use crate::partition::{PartitionFilter, PartitionKey};
use crate::plan::PartitionRef;
use crate::view::{DataStore, ReadView};

#[derive(Debug, Error)]
pub enum SeedError {
  #[error("ledger error: {0}")]
  Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, Serialize)]
pub struct SeededPartition {
  pub artifact: NodePath,
  pub partition: PartitionKey,
  pub fingerprint: Fingerprint,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub previous: Option<Fingerprint>,
}

impl SeededPartition {
  pub fn changed(&self) -> bool {
    self.previous != Some(self.fingerprint)
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct UnreadablePartition {
  pub artifact: NodePath,
  pub partition: PartitionKey,
  pub error: String,
}

#[derive(Debug, Default, Serialize)]
pub struct SeedReport {
  pub recorded: Vec<SeededPartition>,
  /// Partitions with no data in the store. Their ledger entries are left untouched.
  pub missing: Vec<PartitionRef>,
  pub unreadable: Vec<UnreadablePartition>,
}

impl SeedReport {
  pub fn changed(&self) -> usize {
    self.recorded.iter().filter(|p| p.changed()).count()
  }

  pub fn is_complete(&self) -> bool {
    self.missing.is_empty() && self.unreadable.is_empty()
  }
}

/// The fingerprint recorded for a source partition holding `value`.
pub fn content_fingerprint(value: &Value, key: &PartitionKey) -> Fingerprint {
  Fingerprint::of_str(&value.to_string()).combine(key.fingerprint())
}

/// Fingerprint every known partition of every source artifact matching `filter`.
///
/// Known partitions are the declared ones plus those already in the ledger; an unpartitioned
/// source has the single empty partition.
pub fn seed(
  graph: &Graph,
  store: &dyn DataStore,
  ledger: &dyn Ledger,
  filter: &PartitionFilter,
) -> Result<SeedReport, SeedError> {
  let mut report = SeedReport::default();

  for source in graph.sources() {
    let recorded = ledger.partitions(&source.path)?;
    let mut keys: BTreeSet<PartitionKey> = source.partitions.iter().cloned().collect();
    keys.extend(recorded.iter().map(|(key, _)| key.clone()));
    if !source.is_partitioned() {
      keys.insert(PartitionKey::empty());
    }

    for key in keys.into_iter().filter(|k| filter.matches(k)) {
      let value = match ReadView::open(store, source, &key).read() {
        Ok(value) => value,
        Err(e) if e.is_not_found() => {
          warn!(artifact = %source.path, partition = %key, "source partition has no data");
          report.missing.push(PartitionRef {
            artifact: source.path.clone(),
            partition: key,
          });
          continue;
        }
        Err(e) => {
          warn!(artifact = %source.path, partition = %key, error = %e, "failed to read source partition");
          report.unreadable.push(UnreadablePartition {
            artifact: source.path.clone(),
            partition: key,
            error: e.to_string(),
          });
          continue;
        }
      };

      let fingerprint = content_fingerprint(&value, &key);
      let previous = recorded.iter().find(|(k, _)| k == &key).map(|(_, fp)| *fp);
      if previous != Some(fingerprint) {
        ledger.record(&source.path, &key, fingerprint)?;
        debug!(artifact = %source.path, partition = %key, fingerprint = %fingerprint, "seeded partition");
      }
      report.recorded.push(SeededPartition {
        artifact: source.path.clone(),
        partition: key,
        fingerprint,
        previous,
      });
    }
  }

  info!(
    recorded = report.recorded.len(),
    changed = report.changed(),
    missing = report.missing.len(),
    unreadable = report.unreadable.len(),
    "seeded sources"
  );
  Ok(report)
}
