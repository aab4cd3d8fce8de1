//! Implementation of the `arti plan` command.
//!
//! Runs the planner against the ledger without executing anything and prints each unit's
//! verdict, grouped into the waves it would run in.

use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;

use artigraph_lib::execute::UnitDag;
use artigraph_lib::plan::{self, BuildSnapshot, PlannedUnit, Verdict};

use super::{GraphArgs, Workspace};
use crate::output::{
  Tone, print_header, print_info, print_json, print_stat, print_unit_line, short_fingerprint, symbols,
};

#[derive(Debug, Clone, Args)]
pub struct PlanArgs {
  #[command(flatten)]
  pub graph: GraphArgs,

  /// Output as JSON
  #[arg(long)]
  pub json: bool,
}

pub fn cmd_plan(args: &PlanArgs) -> Result<bool> {
  let workspace = Workspace::load(&args.graph)?;
  let filter = args.graph.filter()?;
  let ledger = workspace.state.ledger().context("Failed to open ledger")?;

  let snapshot = plan::plan(&workspace.graph, &ledger, &filter).context("Planning failed")?;
  let waves = UnitDag::from_snapshot(&snapshot)
    .and_then(|dag| dag.waves())
    .context("Failed to order units")?;

  if args.json {
    print_json(&json!({
      "snapshot": snapshot,
      "summary": snapshot.summary(),
      "waves": waves,
    }))?;
    return Ok(true);
  }

  print_snapshot_header(&snapshot);
  if snapshot.units.is_empty() {
    print_info("No units match the filter");
    return Ok(true);
  }

  for (i, wave) in waves.iter().enumerate() {
    println!();
    println!("Wave {}:", i + 1);
    for id in wave {
      if let Some(unit) = snapshot.unit(id) {
        print_unit(unit);
      }
    }
  }

  let summary = snapshot.summary();
  println!();
  print_stat("Stale", &summary.stale.to_string());
  print_stat("Current", &summary.current.to_string());
  print_stat("Blocked", &summary.blocked.to_string());
  Ok(true)
}

pub(super) fn print_snapshot_header(snapshot: &BuildSnapshot) {
  print_header(&format!("Graph: {}", snapshot.graph));
  print_stat("Fingerprint", &snapshot.graph_fingerprint.to_string());
  if !snapshot.filter.is_all() {
    print_stat("Filter", &snapshot.filter.to_string());
  }
}

fn print_unit(unit: &PlannedUnit) {
  let target = unit.target.map(|t| t.to_string()).unwrap_or_else(|| "unknown".to_string());
  let (symbol, tone, detail) = match &unit.verdict {
    Verdict::Stale { previous: Some(prev) } => (
      symbols::MODIFY,
      Tone::Warn,
      format!(
        "({} {} {})",
        short_fingerprint(&prev.to_string()),
        symbols::ARROW,
        short_fingerprint(&target)
      ),
    ),
    Verdict::Stale { previous: None } => (symbols::ADD, Tone::Warn, format!("(new {})", short_fingerprint(&target))),
    Verdict::Current => (symbols::NONE, Tone::Muted, format!("(current {})", short_fingerprint(&target))),
    Verdict::Blocked { waiting_on } => {
      let waiting: Vec<String> = waiting_on.iter().map(|r| r.to_string()).collect();
      (symbols::WAIT, Tone::Note, format!("(waiting on {})", waiting.join(", ")))
    }
  };
  print_unit_line(symbol, tone, &unit.id, &detail);
}
