//! Execution of a single build unit.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info};

use crate::artifact::Artifact;
use crate::fingerprint::Fingerprint;
use crate::graph::Graph;
use crate::plan::{UnitId, UnitInput};
use crate::producer::{BuildContext, HookEvent, HookFailure, HookPoint, Producer};
use crate::resource::Leases;
use crate::view::{ReadView, WriteView};

use super::cancel::CancelToken;
use super::types::{ExecuteContext, SkipReason, UnitError, UnitState};

/// Everything a unit task needs, owned so the task can run on any worker.
pub(super) struct UnitJob {
  pub unit: UnitId,
  pub target: Fingerprint,
  pub producer: Producer,
  pub inputs: Vec<(UnitInput, Artifact)>,
  pub outputs: Vec<Artifact>,
  pub graph: Arc<Graph>,
  pub ctx: ExecuteContext,
  pub timeout: Option<Duration>,
  pub check_output_types: bool,
  pub semaphore: Arc<Semaphore>,
  pub stop: CancelToken,
}

pub(super) struct UnitRun {
  pub unit: UnitId,
  pub state: UnitState,
  pub duration: Option<Duration>,
  pub hook_failures: Vec<HookFailure>,
}

/// Wait for a worker slot, then run the unit. Units still waiting when the run stops are
/// skipped without running.
pub(super) async fn run_unit(job: UnitJob) -> UnitRun {
  let skipped = |job: &UnitJob| UnitRun {
    unit: job.unit.clone(),
    state: UnitState::Skipped(SkipReason::Cancelled),
    duration: None,
    hook_failures: Vec::new(),
  };

  let Ok(permit) = job.semaphore.clone().acquire_owned().await else {
    return skipped(&job);
  };
  if job.ctx.cancel.is_cancelled() || job.stop.is_cancelled() {
    debug!(unit = %job.unit, "run stopped before unit started");
    return skipped(&job);
  }

  info!(unit = %job.unit, "running unit");
  let started = Instant::now();
  let mut hook_failures = Vec::new();
  let result = execute_unit(&job, permit, &mut hook_failures).await;
  let duration = started.elapsed();

  let partition = Some(&job.unit.partition);
  let state = match result {
    Ok(Completion::Stopped) => {
      debug!(unit = %job.unit, "run stopped while unit waited on resources");
      return UnitRun {
        hook_failures,
        ..skipped(&job)
      };
    }
    Ok(Completion::Committed) => {
      info!(unit = %job.unit, target = %job.target, elapsed = ?duration, "unit succeeded");
      hook_failures.extend(job.producer.hooks.fire(&HookEvent {
        point: HookPoint::AfterPartition,
        producer: &job.producer.path,
        partition,
        error: None,
      }));
      UnitState::Succeeded
    }
    Err(e) => {
      error!(unit = %job.unit, error = %e, "unit failed");
      let message = e.to_string();
      hook_failures.extend(job.producer.hooks.fire(&HookEvent {
        point: HookPoint::OnPartitionError,
        producer: &job.producer.path,
        partition,
        error: Some(&message),
      }));
      UnitState::Failed { error: e }
    }
  };

  UnitRun {
    unit: job.unit.clone(),
    state,
    duration: Some(duration),
    hook_failures,
  }
}

/// How a unit that did not fail came to an end.
enum Completion {
  Committed,
  /// The run stopped before the unit's resources were free.
  Stopped,
}

/// Slots a unit occupies while its computation is alive.
struct Held {
  _worker: OwnedSemaphorePermit,
  leases: Leases,
}

async fn execute_unit(
  job: &UnitJob,
  worker: OwnedSemaphorePermit,
  hook_failures: &mut Vec<HookFailure>,
) -> Result<Completion, UnitError> {
  let vetoes = job.producer.hooks.fire(&HookEvent {
    point: HookPoint::BeforePartition,
    producer: &job.producer.path,
    partition: Some(&job.unit.partition),
    error: None,
  });
  if let Some(veto) = vetoes.first() {
    let err = UnitError::HookVeto {
      point: veto.point,
      message: veto.message.clone(),
    };
    hook_failures.extend(vetoes);
    return Err(err);
  }

  let leases = tokio::select! {
    leases = job.ctx.resources.acquire_all(&job.producer.resources) => leases?,
    _ = job.stop.cancelled() => return Ok(Completion::Stopped),
    _ = job.ctx.cancel.cancelled() => return Ok(Completion::Stopped),
  };

  let (values, held) = compute(
    job,
    Held {
      _worker: worker,
      leases,
    },
  )
  .await?;

  if values.len() != job.outputs.len() {
    return Err(UnitError::OutputCount {
      expected: job.outputs.len(),
      actual: values.len(),
    });
  }
  if job.check_output_types {
    let types = job.graph.type_system();
    for (artifact, value) in job.outputs.iter().zip(&values) {
      if let Some(actual) = types.type_of(value)
        && !types.is_compatible(&artifact.type_spec, &actual)
      {
        return Err(UnitError::IncompatibleOutput {
          artifact: artifact.path.clone(),
          expected: artifact.type_spec.clone(),
          actual,
        });
      }
    }
  }

  commit(job, values).await?;
  drop(held);
  Ok(Completion::Committed)
}

/// Read the inputs and run the producer on the blocking pool, bounded by the unit timeout.
///
/// The worker slot and resource leases travel with the blocking task. On timeout the task is
/// detached: it may run to completion and keeps its slots until then, but its values are dropped
/// and nothing it computed is written.
async fn compute(job: &UnitJob, held: Held) -> Result<(Vec<Value>, Held), UnitError> {
  let store = job.ctx.store.clone();
  let inputs = job.inputs.clone();
  let roles: Vec<String> = job.producer.inputs.keys().cloned().collect();
  let compute = job.producer.compute();
  let producer = job.producer.path.clone();
  let partition = job.unit.partition.clone();

  let work = tokio::task::spawn_blocking(move || -> Result<(Vec<Value>, Held), UnitError> {
    let mut by_role: BTreeMap<String, Vec<_>> = roles.into_iter().map(|r| (r, Vec::new())).collect();
    for (input, artifact) in &inputs {
      let value = ReadView::open(store.as_ref(), artifact, &input.partition).read()?;
      by_role
        .entry(input.role.clone())
        .or_default()
        .push((input.partition.clone(), value));
    }
    let ctx = BuildContext {
      producer,
      partition,
      inputs: by_role,
      connections: held.leases.connections(),
    };
    let values = compute.build(&ctx)?;
    Ok((values, held))
  });

  let joined = match job.timeout {
    Some(limit) => tokio::time::timeout(limit, work)
      .await
      .map_err(|_| UnitError::Timeout(limit))?,
    None => work.await,
  };
  joined.map_err(|e| UnitError::Panicked(e.to_string()))?
}

/// Write every output, then record every ledger entry. A crash between the two leaves the old
/// ledger entries in place, so the next plan sees the unit as stale.
async fn commit(job: &UnitJob, values: Vec<Value>) -> Result<(), UnitError> {
  let store = job.ctx.store.clone();
  let ledger = job.ctx.ledger.clone();
  let outputs = job.outputs.clone();
  let partition = job.unit.partition.clone();
  let target = job.target;

  tokio::task::spawn_blocking(move || -> Result<(), UnitError> {
    for (artifact, value) in outputs.iter().zip(values) {
      let mut view = WriteView::open(store.as_ref(), artifact, &partition);
      view.stage(value);
      view.commit()?;
    }
    for artifact in &outputs {
      ledger.record(&artifact.path, &partition, target)?;
    }
    Ok(())
  })
  .await
  .map_err(|e| UnitError::Panicked(e.to_string()))?
}
