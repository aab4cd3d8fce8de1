//! Status command implementation.
//!
//! Lists the graph's artifacts with their producer, annotations and recorded ledger entries.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde_json::json;

use artigraph_lib::artifact::Artifact;
use artigraph_lib::ledger::{FileLedger, Ledger};

use super::{GraphArgs, Workspace};
use crate::output::{self, print_header, print_json, print_stat, short_fingerprint};

pub fn cmd_status(args: &GraphArgs, json: bool, verbose: bool) -> Result<bool> {
  let workspace = Workspace::load(args)?;
  let ledger = workspace.state.ledger().context("Failed to open ledger")?;
  let graph = &workspace.graph;

  if json {
    let mut artifacts = Vec::new();
    for artifact in graph.artifacts() {
      let entries = ledger_entries(&ledger, artifact)?;
      artifacts.push(json!({
        "artifact": artifact,
        "producer": graph.producer_of(&artifact.path).map(|p| p.path.to_string()),
        "ledger": entries,
      }));
    }
    print_json(&json!({
      "graph": graph.name(),
      "fingerprint": graph.fingerprint(),
      "state_dir": workspace.state.root(),
      "artifacts": artifacts,
    }))?;
    return Ok(true);
  }

  print_header(&format!("Graph: {}", graph.name()));
  print_stat("Fingerprint", &graph.fingerprint().to_string());
  print_stat("State", &workspace.state.root().display().to_string());

  for artifact in graph.artifacts() {
    println!();
    let origin = match graph.producer_of(&artifact.path) {
      Some(producer) => format!("produced by {}", producer.path),
      None => "source".to_string(),
    };
    println!("{} {} ({})", output::symbols::INFO, artifact.path, origin);
    print_stat("Type", &artifact.type_spec.to_string());
    if artifact.is_partitioned() {
      let dims: Vec<&str> = artifact.partition_by.iter().map(String::as_str).collect();
      print_stat("Partitioned by", &dims.join(", "));
    }
    for annotation in &artifact.annotations {
      print_stat(&annotation.key, &annotation.value.to_string());
    }

    let entries = ledger_entries(&ledger, artifact)?;
    print_stat("Recorded", &entries.len().to_string());
    if verbose {
      for (key, fingerprint) in &entries {
        println!("      {} {}", key, short_fingerprint(fingerprint));
      }
    }
  }

  Ok(true)
}

fn ledger_entries(ledger: &FileLedger, artifact: &Artifact) -> Result<BTreeMap<String, String>> {
  let entries = ledger
    .partitions(&artifact.path)
    .with_context(|| format!("Failed to read ledger entries for {}", artifact.path))?;
  Ok(
    entries
      .into_iter()
      .map(|(key, fingerprint)| (key.to_string(), fingerprint.to_string()))
      .collect(),
  )
}
