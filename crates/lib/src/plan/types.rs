//! Planner output types.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::artifact::NodePath;
use crate::fingerprint::Fingerprint;
use crate::ledger::LedgerError;
use crate::partition::{PartitionDims, PartitionFilter, PartitionKey};

#[derive(Debug, Error)]
pub enum PlanError {
  #[error("producer `{producer}` maps more than one unit to output partition {key}")]
  DuplicateOutputPartition { producer: NodePath, key: PartitionKey },

  #[error("producer `{producer}` emitted partition {key}, but its outputs are partitioned by {expected:?}")]
  PartitionMismatch {
    producer: NodePath,
    key: PartitionKey,
    expected: PartitionDims,
  },

  #[error("producer `{producer}` mapping referenced unknown input role `{role}`")]
  UnknownRole { producer: NodePath, role: String },

  #[error("ledger error: {0}")]
  Ledger(#[from] LedgerError),
}

/// One build unit: a producer and one of its output partitions.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct UnitId {
  pub producer: NodePath,
  pub partition: PartitionKey,
}

impl UnitId {
  pub fn new(producer: NodePath, partition: PartitionKey) -> Self {
    Self { producer, partition }
  }
}

impl fmt::Display for UnitId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.partition.is_empty() {
      write!(f, "{}", self.producer)
    } else {
      write!(f, "{}[{}]", self.producer, self.partition.canonical())
    }
  }
}

/// An addressed artifact partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PartitionRef {
  pub artifact: NodePath,
  pub partition: PartitionKey,
}

impl fmt::Display for PartitionRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.artifact, self.partition)
  }
}

/// One contributing input partition of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitInput {
  pub role: String,
  pub artifact: NodePath,
  pub partition: PartitionKey,
  /// `None` while the partition has never been built or its producer is still stale.
  pub fingerprint: Option<Fingerprint>,
}

impl UnitInput {
  /// This input's term in the unit's target: its recorded fingerprint hashed together with the
  /// role, artifact and partition it was read as. `None` while the fingerprint is unknown.
  /// Equal fingerprints read at different positions give different terms.
  pub fn contribution(&self) -> Option<Fingerprint> {
    let fingerprint = self.fingerprint?;
    let position = format!(
      "{}\0{}\0{}\0{}",
      self.role,
      self.artifact,
      self.partition.canonical(),
      fingerprint.to_hex()
    );
    Some(Fingerprint::of_str(&position))
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
  /// The target differs from the ledger; `previous` is the ledger entry, if any.
  Stale { previous: Option<Fingerprint> },
  Current,
  /// Some input fingerprint is not known yet.
  Blocked { waiting_on: Vec<PartitionRef> },
}

impl Verdict {
  pub fn name(&self) -> &'static str {
    match self {
      Verdict::Stale { .. } => "stale",
      Verdict::Current => "current",
      Verdict::Blocked { .. } => "blocked",
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedUnit {
  pub id: UnitId,
  /// `None` when blocked.
  pub target: Option<Fingerprint>,
  #[serde(flatten)]
  pub verdict: Verdict,
  pub inputs: Vec<UnitInput>,
  pub outputs: Vec<NodePath>,
  /// Units in this snapshot that produce one of this unit's inputs.
  pub depends_on: Vec<UnitId>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
  pub total: usize,
  pub stale: usize,
  pub current: usize,
  pub blocked: usize,
}

/// Per-run staleness verdicts, in dependency order. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct BuildSnapshot {
  pub graph: String,
  pub graph_fingerprint: Fingerprint,
  #[serde(serialize_with = "serialize_filter")]
  pub filter: PartitionFilter,
  pub units: Vec<PlannedUnit>,
}

fn serialize_filter<S: serde::Serializer>(filter: &PartitionFilter, serializer: S) -> Result<S::Ok, S::Error> {
  serializer.collect_str(filter)
}

impl BuildSnapshot {
  pub fn unit(&self, id: &UnitId) -> Option<&PlannedUnit> {
    self.units.iter().find(|u| &u.id == id)
  }

  pub fn units_of<'a>(&'a self, producer: &'a NodePath) -> impl Iterator<Item = &'a PlannedUnit> {
    self.units.iter().filter(move |u| &u.id.producer == producer)
  }

  pub fn summary(&self) -> PlanSummary {
    let mut summary = PlanSummary {
      total: self.units.len(),
      ..Default::default()
    };
    for unit in &self.units {
      match unit.verdict {
        Verdict::Stale { .. } => summary.stale += 1,
        Verdict::Current => summary.current += 1,
        Verdict::Blocked { .. } => summary.blocked += 1,
      }
    }
    summary
  }

  /// Nothing to build.
  pub fn is_up_to_date(&self) -> bool {
    self.units.iter().all(|u| u.verdict == Verdict::Current)
  }
}
