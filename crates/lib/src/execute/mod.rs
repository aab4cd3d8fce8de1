//! Build execution.
//!
//! [`execute`] runs the units of a [`BuildSnapshot`] against a data store and a ledger:
//! - a unit starts once every unit it depends on has resolved, up to `parallelism` at a time
//! - units blocked at plan time are re-evaluated when their upstream resolves, and are current
//!   without running if the freshly recorded fingerprints already match the ledger
//! - a failed unit skips its transitive dependents while independent units keep running
//! - cancellation stops new units from starting and lets running units finish

pub mod cancel;
pub mod dag;
pub mod types;
mod unit;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::artifact::{Artifact, NodePath};
use crate::fingerprint::Fingerprint;
use crate::graph::Graph;
use crate::partition::PartitionFilter;
use crate::plan::{self, BuildSnapshot, PartitionRef, PlanError, PlannedUnit, UnitId, UnitInput, Verdict};
use crate::producer::{HookEvent, HookFailure, HookPoint, Producer};

use unit::{UnitJob, UnitRun, run_unit};

pub use cancel::CancelToken;
pub use dag::UnitDag;
pub use types::{
  ExecuteConfig, ExecuteContext, ExecuteError, RunReport, SkipReason, UnitError, UnitOutcome, UnitState,
};

/// Plan `graph` against the context's ledger, then execute the snapshot.
pub async fn build(
  graph: Arc<Graph>,
  filter: &PartitionFilter,
  ctx: &ExecuteContext,
  config: &ExecuteConfig,
) -> Result<(BuildSnapshot, RunReport), ExecuteError> {
  let snapshot = plan::plan(&graph, ctx.ledger.as_ref(), filter)?;
  let report = execute(graph, &snapshot, ctx, config).await?;
  Ok((snapshot, report))
}

/// Execute every unit of `snapshot` that is not already current.
///
/// Unit failures are reported in the [`RunReport`]; an `Err` means the run could not start or
/// the snapshot does not belong to `graph`.
pub async fn execute(
  graph: Arc<Graph>,
  snapshot: &BuildSnapshot,
  ctx: &ExecuteContext,
  config: &ExecuteConfig,
) -> Result<RunReport, ExecuteError> {
  graph.check_resources(&ctx.resources)?;
  let dag = UnitDag::from_snapshot(snapshot)?;
  info!(
    graph = %graph.name(),
    units = dag.len(),
    parallelism = config.parallelism,
    "starting build execution"
  );

  let mut run = Run::new(graph, snapshot, dag, ctx, config);
  run.start()?;
  run.drive().await?;
  let report = run.finish();

  info!(
    succeeded = report.succeeded(),
    current = report.current(),
    failed = report.failed(),
    skipped = report.skipped(),
    cancelled = report.cancelled,
    "build execution complete"
  );
  Ok(report)
}

/// Scheduler state for one run.
struct Run<'a> {
  graph: Arc<Graph>,
  snapshot: &'a BuildSnapshot,
  ctx: &'a ExecuteContext,
  config: &'a ExecuteConfig,
  dag: UnitDag,
  planned: HashMap<UnitId, &'a PlannedUnit>,

  /// Unresolved dependencies per undecided unit.
  pending: HashMap<UnitId, usize>,
  outcomes: BTreeMap<UnitId, UnitOutcome>,
  /// Fingerprints recorded during this run.
  known: HashMap<PartitionRef, Fingerprint>,
  targets: HashMap<UnitId, Fingerprint>,
  previous: HashMap<UnitId, Option<Fingerprint>>,

  /// Units per producer not yet decided.
  remaining: HashMap<NodePath, usize>,
  started_producers: HashSet<NodePath>,
  vetoed: HashMap<NodePath, String>,
  hook_failures: Vec<HookFailure>,

  tasks: JoinSet<UnitRun>,
  task_units: HashMap<Id, UnitId>,
  semaphore: Arc<Semaphore>,
  /// Tells queued units to stand down after cancellation or a fail-fast failure.
  stop: CancelToken,
  stopping: bool,
  cancelled: bool,
}

impl<'a> Run<'a> {
  fn new(
    graph: Arc<Graph>,
    snapshot: &'a BuildSnapshot,
    dag: UnitDag,
    ctx: &'a ExecuteContext,
    config: &'a ExecuteConfig,
  ) -> Self {
    let mut remaining = HashMap::new();
    for unit in &snapshot.units {
      *remaining.entry(unit.id.producer.clone()).or_insert(0) += 1;
    }
    Self {
      graph,
      snapshot,
      ctx,
      config,
      dag,
      planned: snapshot.units.iter().map(|u| (u.id.clone(), u)).collect(),
      pending: HashMap::new(),
      outcomes: BTreeMap::new(),
      known: HashMap::new(),
      targets: HashMap::new(),
      previous: HashMap::new(),
      remaining,
      started_producers: HashSet::new(),
      vetoed: HashMap::new(),
      hook_failures: Vec::new(),
      tasks: JoinSet::new(),
      task_units: HashMap::new(),
      semaphore: Arc::new(Semaphore::new(config.parallelism.max(1))),
      stop: CancelToken::new(),
      stopping: false,
      cancelled: false,
    }
  }

  /// Settle plan-time current units and start everything with no pending dependency.
  fn start(&mut self) -> Result<(), ExecuteError> {
    let snapshot = self.snapshot;
    for unit in &snapshot.units {
      if unit.verdict == Verdict::Current {
        continue;
      }
      let pending = self
        .dag
        .dependencies(&unit.id)
        .iter()
        .filter(|dep| self.planned.get(*dep).is_some_and(|p| p.verdict != Verdict::Current))
        .count();
      self.pending.insert(unit.id.clone(), pending);
    }

    for unit in &snapshot.units {
      if unit.verdict == Verdict::Current {
        if let Some(target) = unit.target {
          self.targets.insert(unit.id.clone(), target);
        }
        self.record(&unit.id, UnitState::Current, None);
      }
    }

    for unit in &snapshot.units {
      if self.pending.get(&unit.id) == Some(&0) {
        self.consider(&unit.id)?;
      }
    }
    Ok(())
  }

  async fn drive(&mut self) -> Result<(), ExecuteError> {
    let cancel = self.ctx.cancel.clone();
    while !self.tasks.is_empty() {
      tokio::select! {
        _ = cancel.cancelled(), if !self.stopping => {
          warn!(running = self.tasks.len(), "build cancelled, waiting for running units");
          self.cancelled = true;
          self.halt();
        }
        Some(joined) = self.tasks.join_next_with_id() => self.complete(joined)?,
        else => break,
      }
    }
    Ok(())
  }

  fn finish(mut self) -> RunReport {
    let snapshot = self.snapshot;
    for unit in &snapshot.units {
      if !self.outcomes.contains_key(&unit.id) {
        self.record(&unit.id, UnitState::Skipped(SkipReason::Cancelled), None);
      }
    }
    RunReport {
      outcomes: self.outcomes.into_values().collect(),
      hook_failures: self.hook_failures,
      cancelled: self.cancelled,
    }
  }

  /// Re-evaluate a unit whose dependencies have all resolved, then run it, settle it as
  /// current, or skip it.
  fn consider(&mut self, id: &UnitId) -> Result<(), ExecuteError> {
    if self.outcomes.contains_key(id) {
      return Ok(());
    }
    if self.should_stop() {
      return self.decide(id, UnitState::Skipped(SkipReason::Cancelled), None);
    }

    let planned = self
      .planned
      .get(id)
      .copied()
      .ok_or_else(|| ExecuteError::UnitNotFound(id.clone()))?;
    let graph = self.graph.clone();
    let producer = graph
      .producer(&id.producer)
      .ok_or_else(|| ExecuteError::UnitNotFound(id.clone()))?;

    let inputs: Vec<UnitInput> = planned
      .inputs
      .iter()
      .map(|input| {
        let mut input = input.clone();
        if input.fingerprint.is_none() {
          let at = PartitionRef {
            artifact: input.artifact.clone(),
            partition: input.partition.clone(),
          };
          input.fingerprint = self.known.get(&at).copied();
        }
        input
      })
      .collect();

    let evaluated = match plan::evaluate(producer, &id.partition, &inputs, self.ctx.ledger.as_ref()) {
      Ok(evaluated) => evaluated,
      Err(PlanError::Ledger(e)) => {
        return self.decide(id, UnitState::Failed { error: e.into() }, None);
      }
      Err(e) => return Err(e.into()),
    };

    match evaluated {
      (Some(target), Verdict::Current) => {
        debug!(unit = %id, "unit already current");
        self.targets.insert(id.clone(), target);
        self.decide(id, UnitState::Current, None)
      }
      (Some(target), Verdict::Stale { previous }) => {
        self.targets.insert(id.clone(), target);
        self.previous.insert(id.clone(), previous);
        self.spawn(id, producer, planned, target, inputs)
      }
      _ => {
        let reason = inputs
          .iter()
          .find(|input| input.fingerprint.is_none())
          .map(|input| SkipReason::MissingInput {
            artifact: input.artifact.clone(),
            partition: input.partition.clone(),
          })
          .unwrap_or(SkipReason::Cancelled);
        warn!(unit = %id, reason = %reason, "skipping unit");
        self.decide(id, UnitState::Skipped(reason), None)
      }
    }
  }

  fn spawn(
    &mut self,
    id: &UnitId,
    producer: &Producer,
    planned: &PlannedUnit,
    target: Fingerprint,
    inputs: Vec<UnitInput>,
  ) -> Result<(), ExecuteError> {
    if let Some(message) = self.vetoed.get(&producer.path).cloned() {
      let error = UnitError::HookVeto {
        point: HookPoint::BeforeProducer,
        message,
      };
      return self.decide(id, UnitState::Failed { error }, None);
    }

    if self.started_producers.insert(producer.path.clone()) {
      let vetoes = producer.hooks.fire(&HookEvent {
        point: HookPoint::BeforeProducer,
        producer: &producer.path,
        partition: None,
        error: None,
      });
      if let Some(veto) = vetoes.first() {
        let message = veto.message.clone();
        error!(producer = %producer.path, message = %message, "producer vetoed");
        self.vetoed.insert(producer.path.clone(), message.clone());
        self.hook_failures.extend(vetoes);
        let error = UnitError::HookVeto {
          point: HookPoint::BeforeProducer,
          message,
        };
        return self.decide(id, UnitState::Failed { error }, None);
      }
    }

    let inputs = inputs
      .into_iter()
      .map(|input| {
        let artifact = self.artifact(&input.artifact)?;
        Ok((input, artifact))
      })
      .collect::<Result<Vec<_>, ExecuteError>>()?;
    let outputs = planned
      .outputs
      .iter()
      .map(|path| self.artifact(path))
      .collect::<Result<Vec<_>, _>>()?;

    let job = UnitJob {
      unit: id.clone(),
      target,
      timeout: producer.timeout.or(self.config.unit_timeout),
      producer: producer.clone(),
      inputs,
      outputs,
      graph: self.graph.clone(),
      ctx: self.ctx.clone(),
      check_output_types: self.config.check_output_types,
      semaphore: self.semaphore.clone(),
      stop: self.stop.clone(),
    };
    let handle = self.tasks.spawn(run_unit(job));
    self.task_units.insert(handle.id(), id.clone());
    debug!(unit = %id, target = %target, "scheduled unit");
    Ok(())
  }

  fn complete(&mut self, joined: Result<(Id, UnitRun), JoinError>) -> Result<(), ExecuteError> {
    match joined {
      Ok((task, run)) => {
        self.task_units.remove(&task);
        self.hook_failures.extend(run.hook_failures);
        self.decide(&run.unit, run.state, run.duration)
      }
      Err(e) => {
        let Some(unit) = self.task_units.remove(&e.id()) else {
          return Ok(());
        };
        error!(unit = %unit, error = %e, "unit task aborted");
        let error = UnitError::Panicked(e.to_string());
        self.decide(&unit, UnitState::Failed { error }, None)
      }
    }
  }

  /// Record a final state and propagate it downstream.
  fn decide(&mut self, unit: &UnitId, state: UnitState, duration: Option<Duration>) -> Result<(), ExecuteError> {
    let resolved = state.is_resolved();
    let failed = matches!(state, UnitState::Failed { .. });
    let skipped = match &state {
      UnitState::Skipped(reason) => Some(reason.clone()),
      _ => None,
    };
    self.record(unit, state, duration);

    if resolved {
      self.publish(unit);
      return self.notify(unit);
    }

    let reason = skipped.unwrap_or_else(|| SkipReason::UpstreamFailed { unit: unit.clone() });
    for dependent in self.dag.transitive_dependents(unit) {
      if !self.outcomes.contains_key(&dependent) {
        warn!(unit = %dependent, reason = %reason, "skipping unit");
        self.record(&dependent, UnitState::Skipped(reason.clone()), None);
      }
    }
    if failed && self.config.fail_fast {
      warn!(unit = %unit, "fail-fast: not starting further units");
      self.halt();
    }
    Ok(())
  }

  fn record(&mut self, unit: &UnitId, state: UnitState, duration: Option<Duration>) {
    let target = if state.is_resolved() {
      self.targets.get(unit).copied()
    } else {
      None
    };
    let previous = self.previous.get(unit).copied().flatten();
    self.outcomes.insert(
      unit.clone(),
      UnitOutcome {
        unit: unit.clone(),
        state,
        target,
        previous,
        duration,
      },
    );

    let Some(left) = self.remaining.get_mut(&unit.producer) else {
      return;
    };
    *left = left.saturating_sub(1);
    if *left == 0 && self.started_producers.contains(&unit.producer) {
      let graph = self.graph.clone();
      if let Some(producer) = graph.producer(&unit.producer) {
        debug!(producer = %producer.path, "producer finished");
        self.hook_failures.extend(producer.hooks.fire(&HookEvent {
          point: HookPoint::AfterProducer,
          producer: &producer.path,
          partition: None,
          error: None,
        }));
      }
    }
  }

  /// Make a resolved unit's output fingerprints visible to its consumers.
  fn publish(&mut self, unit: &UnitId) {
    let (Some(target), Some(planned)) = (self.targets.get(unit).copied(), self.planned.get(unit).copied()) else {
      return;
    };
    for output in &planned.outputs {
      self.known.insert(
        PartitionRef {
          artifact: output.clone(),
          partition: unit.partition.clone(),
        },
        target,
      );
    }
  }

  fn notify(&mut self, unit: &UnitId) -> Result<(), ExecuteError> {
    for dependent in self.dag.dependents(unit) {
      if self.outcomes.contains_key(&dependent) {
        continue;
      }
      let ready = match self.pending.get_mut(&dependent) {
        Some(pending) => {
          *pending = pending.saturating_sub(1);
          *pending == 0
        }
        None => false,
      };
      if ready {
        self.consider(&dependent)?;
      }
    }
    Ok(())
  }

  fn artifact(&self, path: &NodePath) -> Result<Artifact, ExecuteError> {
    self
      .graph
      .artifact(path)
      .cloned()
      .ok_or_else(|| ExecuteError::UnknownArtifact(path.clone()))
  }

  fn should_stop(&mut self) -> bool {
    if !self.stopping && self.ctx.cancel.is_cancelled() {
      warn!("build cancelled before all units started");
      self.cancelled = true;
      self.halt();
    }
    self.stopping
  }

  fn halt(&mut self) {
    if !self.stopping {
      self.stopping = true;
      self.stop.cancel();
    }
  }
}
