//! Shared helpers for engine tests.

use std::sync::Arc;

use artigraph_lib::artifact::NodePath;
use artigraph_lib::execute::{self, ExecuteConfig, ExecuteContext, RunReport, UnitOutcome, UnitState};
use artigraph_lib::graph::Graph;
use artigraph_lib::ledger::MemoryLedger;
use artigraph_lib::partition::{PartitionFilter, PartitionKey};
use artigraph_lib::plan::{BuildSnapshot, UnitId};
use artigraph_lib::seed;
use artigraph_lib::view::MemoryStore;
use serde_json::Value;

pub fn path(s: &str) -> NodePath {
  NodePath::parse(s).unwrap()
}

pub fn day(d: &str) -> PartitionKey {
  PartitionKey::single("date", d)
}

pub fn unit(producer: &str, partition: PartitionKey) -> UnitId {
  UnitId::new(path(producer), partition)
}

pub fn rt() -> tokio::runtime::Runtime {
  tokio::runtime::Builder::new_multi_thread()
    .worker_threads(4)
    .enable_all()
    .build()
    .unwrap()
}

/// An in-memory store and ledger.
pub struct Env {
  pub store: Arc<MemoryStore>,
  pub ledger: Arc<MemoryLedger>,
  pub ctx: ExecuteContext,
}

impl Env {
  pub fn new() -> Self {
    let store = Arc::new(MemoryStore::new());
    let ledger = Arc::new(MemoryLedger::new());
    let ctx = ExecuteContext::new(store.clone(), ledger.clone());
    Self { store, ledger, ctx }
  }

  /// Put source data in the store and record its fingerprints.
  pub fn seed(&self, graph: &Graph, values: &[(&str, PartitionKey, Value)]) {
    for (artifact, key, value) in values {
      self.store.insert(&path(artifact), key.clone(), value.clone());
    }
    seed::seed(graph, self.store.as_ref(), self.ledger.as_ref(), &PartitionFilter::all()).unwrap();
  }

  pub fn build(&self, graph: &Arc<Graph>, config: &ExecuteConfig) -> (BuildSnapshot, RunReport) {
    rt()
      .block_on(execute::build(graph.clone(), &PartitionFilter::all(), &self.ctx, config))
      .unwrap()
  }
}

pub fn outcome<'a>(report: &'a RunReport, producer: &str, partition: PartitionKey) -> &'a UnitOutcome {
  report
    .outcome(&unit(producer, partition))
    .unwrap_or_else(|| panic!("no outcome for {}", producer))
}

pub fn state<'a>(report: &'a RunReport, producer: &str, partition: PartitionKey) -> &'a UnitState {
  &outcome(report, producer, partition).state
}
