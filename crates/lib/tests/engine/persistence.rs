//! A definition file driven through on-disk state, the way `arti` runs it.

#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use artigraph_lib::definition::{GraphDefinition, StateDir};
use artigraph_lib::execute::{self, ExecuteConfig, ExecuteContext};
use artigraph_lib::ledger::Ledger;
use artigraph_lib::partition::PartitionFilter;
use artigraph_lib::seed;
use serde_json::{Value, json};
use tempfile::TempDir;

use super::common::{day, path, rt};

const DEFINITION: &str = r#"
name = "stamps"

[artifacts.raw]
partition_by = ["date"]
partitions = ["date=01", "date=02"]

[artifacts.stamped]
partition_by = ["date"]

[producers.stamp]
version = "v1"
cmd = "cat > /dev/null; printf '\"%s\"' \"$ARTI_PARTITION\""
inputs = { raw = "raw" }
outputs = ["stamped"]
"#;

fn write_source(state: &StateDir, date: &str, value: &Value) {
  let file = state.data_dir().join("raw").join(format!("date={}.json", date));
  fs::create_dir_all(file.parent().unwrap()).unwrap();
  fs::write(file, value.to_string()).unwrap();
}

fn read_json(file: &Path) -> Value {
  serde_json::from_str(&fs::read_to_string(file).unwrap()).unwrap()
}

#[test]
fn definition_builds_against_disk_state() {
  let temp = TempDir::new().unwrap();
  let definition_file = temp.path().join("arti.toml");
  fs::write(&definition_file, DEFINITION).unwrap();

  let definition = GraphDefinition::load(&definition_file).unwrap();
  let loaded = definition.to_graph(temp.path()).unwrap();
  let graph = Arc::new(loaded.graph);
  let state = StateDir::new(temp.path().join(".arti"));

  write_source(&state, "01", &json!({"rows": 3}));
  write_source(&state, "02", &json!({"rows": 5}));

  let ledger = Arc::new(state.ledger().unwrap());
  let store = Arc::new(state.store());
  let report = seed::seed(&graph, store.as_ref(), ledger.as_ref(), &PartitionFilter::all()).unwrap();
  assert_eq!(report.recorded.len(), 2);
  assert!(report.is_complete());

  let ctx = ExecuteContext::new(store.clone(), ledger.clone()).with_resources(loaded.resources);
  let config = ExecuteConfig::default();
  let (snapshot, run) = rt()
    .block_on(execute::build(graph.clone(), &PartitionFilter::all(), &ctx, &config))
    .unwrap();
  assert_eq!(snapshot.summary().stale, 2);
  assert!(run.is_success(), "{:?}", run.outcomes);

  let output = state.data_dir().join("stamped").join("date=02.json");
  assert_eq!(read_json(&output), json!("date=02"));

  let (second, run) = rt()
    .block_on(execute::build(graph.clone(), &PartitionFilter::all(), &ctx, &config))
    .unwrap();
  assert!(second.is_up_to_date());
  assert_eq!(run.current(), 2);

  // Entries survive reopening the ledger.
  drop(ctx);
  drop(ledger);
  let reopened = state.ledger().unwrap();
  assert!(reopened.get(&path("stamped"), &day("01")).unwrap().is_some());
  assert_eq!(reopened.partitions(&path("raw")).unwrap().len(), 2);
}

#[test]
fn changed_source_file_restales_its_partition() {
  let temp = TempDir::new().unwrap();
  let definition: GraphDefinition = DEFINITION.parse().unwrap();
  let graph = Arc::new(definition.to_graph(temp.path()).unwrap().graph);
  let state = StateDir::new(temp.path().join("state"));
  write_source(&state, "01", &json!(1));
  write_source(&state, "02", &json!(2));

  let ledger = Arc::new(state.ledger().unwrap());
  let store = Arc::new(state.store());
  seed::seed(&graph, store.as_ref(), ledger.as_ref(), &PartitionFilter::all()).unwrap();
  let ctx = ExecuteContext::new(store.clone(), ledger.clone());
  rt()
    .block_on(execute::build(graph.clone(), &PartitionFilter::all(), &ctx, &ExecuteConfig::default()))
    .unwrap();

  write_source(&state, "02", &json!(20));
  let report = seed::seed(&graph, store.as_ref(), ledger.as_ref(), &PartitionFilter::all()).unwrap();
  assert_eq!(report.changed(), 1);

  let snapshot = artigraph_lib::plan::plan(&graph, ledger.as_ref(), &PartitionFilter::all()).unwrap();
  assert_eq!(snapshot.summary().stale, 1);
}
