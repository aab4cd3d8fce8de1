//! Implementation of the `arti seed` command.
//!
//! Reads every declared partition of the graph's source artifacts from the local data store and
//! records its content fingerprint in the ledger.

use anyhow::{Context, Result};

use artigraph_lib::seed;

use super::{GraphArgs, Workspace};
use crate::output::{print_error, print_info, print_json, print_stat, print_success, print_warning};

pub fn cmd_seed(args: &GraphArgs, json: bool) -> Result<bool> {
  let workspace = Workspace::load(args)?;
  let filter = args.filter()?;
  let ledger = workspace.state.ledger().context("Failed to open ledger")?;
  let store = workspace.state.store();

  let report = seed::seed(&workspace.graph, &store, &ledger, &filter).context("Seeding failed")?;

  if json {
    print_json(&report)?;
    return Ok(report.unreadable.is_empty());
  }

  if report.recorded.is_empty() && report.missing.is_empty() && report.unreadable.is_empty() {
    print_info("No source partitions to seed");
    return Ok(true);
  }

  for partition in report.recorded.iter().filter(|p| p.changed()) {
    println!("  {} {} {}", partition.artifact, partition.partition, partition.fingerprint);
  }
  for missing in &report.missing {
    print_warning(&format!("No data for {} in {}", missing, store.root().display()));
  }
  for unreadable in &report.unreadable {
    print_error(&format!(
      "Cannot read {} {}: {}",
      unreadable.artifact, unreadable.partition, unreadable.error
    ));
  }

  println!();
  print_stat("Recorded", &report.recorded.len().to_string());
  print_stat("Changed", &report.changed().to_string());
  print_stat("Missing", &report.missing.len().to_string());
  if report.unreadable.is_empty() {
    print_success("Seed complete");
  }
  Ok(report.unreadable.is_empty())
}
