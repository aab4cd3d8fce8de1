//! The build planner.
//!
//! For every output partition of every producer the planner computes a target fingerprint
//!
//! ```text
//! target = version ⊕ f(input₁) ⊕ f(input₂) ⊕ …
//! ```
//!
//! over the input partitions that feed it, and compares it with the ledger. `f` hashes an input's
//! role, artifact and partition together with its recorded fingerprint (see
//! [`UnitInput::contribution`]), so two inputs never cancel out even when their recorded
//! fingerprints are equal.
//! Producers are visited in dependency order, so a unit's inputs are known by the time it is
//! planned: source partitions come from the ledger, produced partitions from the upstream
//! unit's verdict. An upstream unit that is not `current` leaves its outputs unknown, which
//! makes every downstream unit `blocked` until the executor resolves it.

mod types;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use tracing::{debug, info};

use crate::artifact::NodePath;
use crate::fingerprint::Fingerprint;
use crate::graph::Graph;
use crate::ledger::Ledger;
use crate::partition::{InputPartitions, PartitionFilter, PartitionKey};
use crate::producer::Producer;

pub use types::{BuildSnapshot, PartitionRef, PlanError, PlanSummary, PlannedUnit, UnitId, UnitInput, Verdict};

/// Known partitions of an artifact and their fingerprint, when known.
type Known = HashMap<NodePath, BTreeMap<PartitionKey, Option<Fingerprint>>>;

/// Compute a [`BuildSnapshot`] for `graph` against `ledger`.
///
/// `filter` restricts the plan to units whose output partition matches, plus every unit those
/// transitively depend on.
pub fn plan(graph: &Graph, ledger: &dyn Ledger, filter: &PartitionFilter) -> Result<BuildSnapshot, PlanError> {
  info!(graph = %graph.name(), filter = %filter, "planning build");

  let mut known: Known = HashMap::new();
  for source in graph.sources() {
    let mut parts: BTreeMap<PartitionKey, Option<Fingerprint>> =
      source.partitions.iter().map(|k| (k.clone(), None)).collect();
    if !source.is_partitioned() {
      parts.insert(PartitionKey::empty(), None);
    }
    for (key, fingerprint) in ledger.partitions(&source.path)? {
      parts.insert(key, Some(fingerprint));
    }
    known.insert(source.path.clone(), parts);
  }

  let mut units = Vec::new();
  for producer in graph.producers() {
    for unit in plan_producer(graph, producer, ledger, &known)? {
      let resolved = match unit.verdict {
        Verdict::Current => unit.target,
        _ => None,
      };
      for output in &unit.outputs {
        known
          .entry(output.clone())
          .or_default()
          .insert(unit.id.partition.clone(), resolved);
      }
      units.push(unit);
    }
  }

  let units = apply_filter(units, filter);
  let snapshot = BuildSnapshot {
    graph: graph.name().to_string(),
    graph_fingerprint: graph.fingerprint(),
    filter: filter.clone(),
    units,
  };

  let summary = snapshot.summary();
  info!(
    total = summary.total,
    stale = summary.stale,
    current = summary.current,
    blocked = summary.blocked,
    "plan complete"
  );
  Ok(snapshot)
}

fn plan_producer(
  graph: &Graph,
  producer: &Producer,
  ledger: &dyn Ledger,
  known: &Known,
) -> Result<Vec<PlannedUnit>, PlanError> {
  let inputs: InputPartitions = producer
    .inputs
    .iter()
    .map(|(role, binding)| {
      let keys = known
        .get(&binding.artifact)
        .map(|parts| parts.keys().cloned().collect())
        .unwrap_or_default();
      (role.clone(), keys)
    })
    .collect();

  let outputs: Vec<NodePath> = producer.output_artifacts().cloned().collect();
  let output_dims = outputs
    .first()
    .and_then(|path| graph.artifact(path))
    .map(|a| a.partition_by.clone())
    .unwrap_or_default();

  let mut seen = BTreeSet::new();
  let mut units = Vec::new();
  for (key, deps) in producer.mapping.map(&inputs) {
    if key.dims() != output_dims {
      return Err(PlanError::PartitionMismatch {
        producer: producer.path.clone(),
        key,
        expected: output_dims,
      });
    }
    if !seen.insert(key.clone()) {
      return Err(PlanError::DuplicateOutputPartition {
        producer: producer.path.clone(),
        key,
      });
    }

    let mut unit_inputs = Vec::new();
    for (role, keys) in deps {
      let binding = producer.inputs.get(&role).ok_or_else(|| PlanError::UnknownRole {
        producer: producer.path.clone(),
        role: role.clone(),
      })?;
      // A mapper listing a partition twice would cancel it out of the target.
      for partition in keys.into_iter().collect::<BTreeSet<_>>() {
        let fingerprint = known
          .get(&binding.artifact)
          .and_then(|parts| parts.get(&partition))
          .copied()
          .flatten();
        unit_inputs.push(UnitInput {
          role: role.clone(),
          artifact: binding.artifact.clone(),
          partition,
          fingerprint,
        });
      }
    }

    let id = UnitId::new(producer.path.clone(), key);
    let (target, verdict) = evaluate(producer, &id.partition, &unit_inputs, ledger)?;
    debug!(unit = %id, verdict = verdict.name(), target = ?target.map(|t| t.to_hex()), "planned unit");

    let depends_on = unit_inputs
      .iter()
      .filter_map(|input| {
        graph
          .producer_of(&input.artifact)
          .map(|p| UnitId::new(p.path.clone(), input.partition.clone()))
      })
      .collect::<BTreeSet<_>>()
      .into_iter()
      .collect();

    units.push(PlannedUnit {
      id,
      target,
      verdict,
      inputs: unit_inputs,
      outputs: outputs.clone(),
      depends_on,
    });
  }
  Ok(units)
}

/// The target fingerprint of a unit, combining the producer version with the contribution of
/// every input. Returns `None` if any input fingerprint is unknown.
pub fn target_fingerprint(producer: &Producer, inputs: &[UnitInput]) -> Option<Fingerprint> {
  inputs
    .iter()
    .map(UnitInput::contribution)
    .try_fold(producer.version.fingerprint(), |acc, fp| fp.map(|fp| acc.combine(fp)))
}

/// Decide a unit's verdict from its (possibly partially known) inputs and the ledger.
///
/// A multi-output unit is stale when any of its outputs disagrees with the target.
pub fn evaluate(
  producer: &Producer,
  partition: &PartitionKey,
  inputs: &[UnitInput],
  ledger: &dyn Ledger,
) -> Result<(Option<Fingerprint>, Verdict), PlanError> {
  let Some(target) = target_fingerprint(producer, inputs) else {
    let waiting_on = inputs
      .iter()
      .filter(|input| input.fingerprint.is_none())
      .map(|input| PartitionRef {
        artifact: input.artifact.clone(),
        partition: input.partition.clone(),
      })
      .collect();
    return Ok((None, Verdict::Blocked { waiting_on }));
  };

  for output in producer.output_artifacts() {
    let recorded = ledger.get(output, partition)?;
    if recorded != Some(target) {
      return Ok((Some(target), Verdict::Stale { previous: recorded }));
    }
  }
  Ok((Some(target), Verdict::Current))
}

/// Keep units matching `filter` and their transitive upstream.
fn apply_filter(units: Vec<PlannedUnit>, filter: &PartitionFilter) -> Vec<PlannedUnit> {
  if filter.is_all() {
    return units;
  }

  let by_id: HashMap<&UnitId, &PlannedUnit> = units.iter().map(|u| (&u.id, u)).collect();
  let mut keep: HashSet<UnitId> = HashSet::new();
  let mut stack: Vec<&UnitId> = units
    .iter()
    .filter(|u| filter.matches(&u.id.partition))
    .map(|u| &u.id)
    .collect();
  while let Some(id) = stack.pop() {
    if !keep.insert(id.clone()) {
      continue;
    }
    if let Some(unit) = by_id.get(id) {
      stack.extend(unit.depends_on.iter());
    }
  }

  units.into_iter().filter(|u| keep.contains(&u.id)).collect()
}
