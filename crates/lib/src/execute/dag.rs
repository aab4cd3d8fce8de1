//! Execution DAG over build units.
//!
//! Nodes are the units of a [`BuildSnapshot`]; edges run from the unit producing an input
//! partition to the unit consuming it. The DAG answers dependency queries for the scheduler
//! and groups units into parallel waves for display.

use std::collections::{HashMap, HashSet};

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;

use crate::plan::{BuildSnapshot, UnitId};

use super::types::ExecuteError;

pub struct UnitDag {
  graph: DiGraph<UnitId, ()>,
  nodes: HashMap<UnitId, NodeIndex>,
}

impl UnitDag {
  /// Build the DAG from a snapshot. Dependencies outside the snapshot are ignored.
  pub fn from_snapshot(snapshot: &BuildSnapshot) -> Result<Self, ExecuteError> {
    let mut graph = DiGraph::new();
    let mut nodes = HashMap::new();

    for unit in &snapshot.units {
      let idx = graph.add_node(unit.id.clone());
      nodes.insert(unit.id.clone(), idx);
    }

    for unit in &snapshot.units {
      let dependent = nodes[&unit.id];
      for dep in &unit.depends_on {
        if let Some(&dep_idx) = nodes.get(dep) {
          graph.add_edge(dep_idx, dependent, ());
        }
      }
    }

    let dag = Self { graph, nodes };
    toposort(&dag.graph, None).map_err(|_| ExecuteError::CycleDetected)?;
    Ok(dag)
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  pub fn contains(&self, unit: &UnitId) -> bool {
    self.nodes.contains_key(unit)
  }

  /// Units directly feeding `unit`.
  pub fn dependencies(&self, unit: &UnitId) -> Vec<UnitId> {
    self.neighbors(unit, Direction::Incoming)
  }

  /// Units directly consuming `unit`'s outputs.
  pub fn dependents(&self, unit: &UnitId) -> Vec<UnitId> {
    self.neighbors(unit, Direction::Outgoing)
  }

  /// Every unit downstream of `unit`, excluding itself.
  pub fn transitive_dependents(&self, unit: &UnitId) -> Vec<UnitId> {
    let Some(&start) = self.nodes.get(unit) else {
      return Vec::new();
    };
    let mut bfs = Bfs::new(&self.graph, start);
    let mut out = Vec::new();
    while let Some(idx) = bfs.next(&self.graph) {
      if idx != start {
        out.push(self.graph[idx].clone());
      }
    }
    out
  }

  fn neighbors(&self, unit: &UnitId, direction: Direction) -> Vec<UnitId> {
    let Some(&idx) = self.nodes.get(unit) else {
      return Vec::new();
    };
    let mut out: Vec<UnitId> = self
      .graph
      .neighbors_directed(idx, direction)
      .map(|n| self.graph[n].clone())
      .collect();
    out.sort();
    out.dedup();
    out
  }

  /// Units grouped into waves: every unit's dependencies are in earlier waves.
  pub fn waves(&self) -> Result<Vec<Vec<UnitId>>, ExecuteError> {
    // Kahn's algorithm, one level at a time
    let mut in_degree: HashMap<NodeIndex, usize> = self
      .graph
      .node_indices()
      .map(|idx| (idx, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
      .collect();
    let mut remaining: HashSet<NodeIndex> = self.graph.node_indices().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
      let ready: Vec<NodeIndex> = remaining.iter().filter(|&&idx| in_degree[&idx] == 0).copied().collect();
      if ready.is_empty() {
        return Err(ExecuteError::CycleDetected);
      }

      let mut wave = Vec::with_capacity(ready.len());
      for idx in ready {
        remaining.remove(&idx);
        for neighbor in self.graph.neighbors_directed(idx, Direction::Outgoing) {
          if let Some(deg) = in_degree.get_mut(&neighbor) {
            *deg = deg.saturating_sub(1);
          }
        }
        wave.push(self.graph[idx].clone());
      }
      wave.sort();
      waves.push(wave);
    }

    Ok(waves)
  }
}
