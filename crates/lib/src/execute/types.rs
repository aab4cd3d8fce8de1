//! Types for build execution.
//!
//! This module defines the error types, per-unit outcomes, the run report and the configuration
//! for executing a build snapshot.

use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::artifact::NodePath;
use crate::descriptor::TypeSpec;
use crate::fingerprint::Fingerprint;
use crate::graph::GraphError;
use crate::ledger::{Ledger, LedgerError};
use crate::partition::PartitionKey;
use crate::plan::{PlanError, UnitId};
use crate::producer::{ComputeError, HookFailure, HookPoint};
use crate::resource::{ResourceError, ResourcePool};
use crate::view::{DataStore, ViewError};

use super::cancel::CancelToken;

/// Errors that abort a run before or outside any single unit.
#[derive(Debug, Error)]
pub enum ExecuteError {
  #[error("invalid graph: {0}")]
  Graph(#[from] GraphError),

  #[error("planning failed: {0}")]
  Plan(#[from] PlanError),

  #[error("ledger error: {0}")]
  Ledger(#[from] LedgerError),

  /// Cycle detected among planned units.
  #[error("dependency cycle detected")]
  CycleDetected,

  #[error("unit not found in snapshot: {0}")]
  UnitNotFound(UnitId),

  #[error("artifact `{0}` is not part of the graph")]
  UnknownArtifact(NodePath),
}

/// Why a unit failed. Always reported against the unit (producer + partition) it belongs to.
#[derive(Debug, Error)]
pub enum UnitError {
  #[error("computation failed: {0}")]
  Compute(#[from] ComputeError),

  #[error("{0}")]
  Io(#[from] ViewError),

  #[error("ledger write failed: {0}")]
  Ledger(#[from] LedgerError),

  #[error("timed out after {}", humantime::format_duration(*.0))]
  Timeout(Duration),

  #[error("{point} hook vetoed execution: {message}")]
  HookVeto { point: HookPoint, message: String },

  #[error("output for `{artifact}` is `{actual}`, expected `{expected}`")]
  IncompatibleOutput {
    artifact: NodePath,
    expected: TypeSpec,
    actual: TypeSpec,
  },

  #[error("producer returned {actual} values for {expected} outputs")]
  OutputCount { expected: usize, actual: usize },

  #[error("resource error: {0}")]
  Resource(#[from] ResourceError),

  #[error("unit task panicked: {0}")]
  Panicked(String),
}

impl Serialize for UnitError {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

/// Identifies why a unit was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
  /// A unit this one (transitively) depends on failed.
  UpstreamFailed { unit: UnitId },
  /// An input partition was never produced or seeded.
  MissingInput { artifact: NodePath, partition: PartitionKey },
  /// The run was cancelled, or stopped after a failure with `fail_fast`.
  Cancelled,
}

impl std::fmt::Display for SkipReason {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      SkipReason::UpstreamFailed { unit } => write!(f, "upstream {} failed", unit),
      SkipReason::MissingInput { artifact, partition } => write!(f, "missing input {} {}", artifact, partition),
      SkipReason::Cancelled => write!(f, "cancelled"),
    }
  }
}

/// Final state of a unit.
#[derive(Debug, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UnitState {
  Succeeded,
  /// Already up to date; nothing ran.
  Current,
  Failed { error: UnitError },
  Skipped(SkipReason),
}

impl UnitState {
  pub fn name(&self) -> &'static str {
    match self {
      UnitState::Succeeded => "succeeded",
      UnitState::Current => "current",
      UnitState::Failed { .. } => "failed",
      UnitState::Skipped(_) => "skipped",
    }
  }

  /// Succeeded or current: downstream may consume the outputs.
  pub fn is_resolved(&self) -> bool {
    matches!(self, UnitState::Succeeded | UnitState::Current)
  }
}

#[derive(Debug, Serialize)]
pub struct UnitOutcome {
  pub unit: UnitId,
  #[serde(flatten)]
  pub state: UnitState,
  /// The fingerprint recorded (succeeded) or matched (current).
  #[serde(skip_serializing_if = "Option::is_none")]
  pub target: Option<Fingerprint>,
  /// Ledger entry before the run, for units that were stale.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub previous: Option<Fingerprint>,
  #[serde(skip_serializing_if = "Option::is_none", with = "duration_ms")]
  pub duration: Option<Duration>,
}

mod duration_ms {
  use std::time::Duration;

  use serde::Serializer;

  pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
      Some(d) => serializer.serialize_u64(d.as_millis() as u64),
      None => serializer.serialize_none(),
    }
  }
}

/// Result of executing a snapshot.
#[derive(Debug, Default, Serialize)]
pub struct RunReport {
  /// Outcomes sorted by unit.
  pub outcomes: Vec<UnitOutcome>,
  pub hook_failures: Vec<HookFailure>,
  pub cancelled: bool,
}

impl RunReport {
  pub fn outcome(&self, unit: &UnitId) -> Option<&UnitOutcome> {
    self.outcomes.iter().find(|o| &o.unit == unit)
  }

  pub fn count(&self, state: &str) -> usize {
    self.outcomes.iter().filter(|o| o.state.name() == state).count()
  }

  pub fn succeeded(&self) -> usize {
    self.count("succeeded")
  }

  pub fn current(&self) -> usize {
    self.count("current")
  }

  pub fn failed(&self) -> usize {
    self.count("failed")
  }

  pub fn skipped(&self) -> usize {
    self.count("skipped")
  }

  /// No unit failed or was skipped.
  pub fn is_success(&self) -> bool {
    self.outcomes.iter().all(|o| o.state.is_resolved())
  }
}

/// Configuration for build execution.
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
  /// Maximum number of units running at once.
  pub parallelism: usize,

  /// Wall-clock bound per unit. A producer's own timeout takes precedence.
  pub unit_timeout: Option<Duration>,

  /// Stop starting new units after the first failure.
  pub fail_fast: bool,

  /// Classify produced values with the graph's type system and reject mismatches.
  pub check_output_types: bool,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      parallelism: num_cpus(),
      unit_timeout: None,
      fail_fast: false,
      check_output_types: true,
    }
  }
}

/// Get the number of CPUs for default parallelism.
fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}

/// The collaborators a run works against.
#[derive(Clone)]
pub struct ExecuteContext {
  pub store: Arc<dyn DataStore>,
  pub ledger: Arc<dyn Ledger>,
  pub resources: ResourcePool,
  pub cancel: CancelToken,
}

impl ExecuteContext {
  pub fn new(store: Arc<dyn DataStore>, ledger: Arc<dyn Ledger>) -> Self {
    Self {
      store,
      ledger,
      resources: ResourcePool::new(),
      cancel: CancelToken::new(),
    }
  }

  pub fn with_resources(mut self, resources: ResourcePool) -> Self {
    self.resources = resources;
    self
  }

  pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
    self.cancel = cancel;
    self
  }
}
