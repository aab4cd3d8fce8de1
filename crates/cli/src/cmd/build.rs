//! Implementation of the `arti build` command.
//!
//! Plans against the ledger, executes every stale unit and prints the run report. Ctrl-C cancels
//! the run: running units finish, nothing new starts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use serde_json::json;
use tracing::{info, warn};

use artigraph_lib::execute::{self, CancelToken, ExecuteConfig, ExecuteContext, RunReport, UnitOutcome, UnitState};

use super::plan::print_snapshot_header;
use super::{GraphArgs, Workspace};
use crate::output::{
  Tone, format_duration, print_error, print_json, print_stat, print_success, print_unit_line, print_warning, symbols,
};

#[derive(Debug, Clone, Args)]
pub struct BuildArgs {
  #[command(flatten)]
  pub graph: GraphArgs,

  /// Maximum number of units running at once (default: available CPUs)
  #[arg(short = 'j', long)]
  pub parallelism: Option<usize>,

  /// Per-unit time limit, e.g. `30s` or `5m`
  #[arg(long, value_parser = humantime::parse_duration)]
  pub timeout: Option<Duration>,

  /// Stop starting units after the first failure
  #[arg(long)]
  pub fail_fast: bool,

  /// Skip the dynamic output type check
  #[arg(long)]
  pub no_type_check: bool,

  /// Output as JSON
  #[arg(long)]
  pub json: bool,
}

impl BuildArgs {
  fn config(&self) -> ExecuteConfig {
    let defaults = ExecuteConfig::default();
    ExecuteConfig {
      parallelism: self.parallelism.unwrap_or(defaults.parallelism).max(1),
      unit_timeout: self.timeout,
      fail_fast: self.fail_fast,
      check_output_types: !self.no_type_check,
    }
  }
}

pub fn cmd_build(args: &BuildArgs) -> Result<bool> {
  let workspace = Workspace::load(&args.graph)?;
  let filter = args.graph.filter()?;
  let ledger = workspace.state.ledger().context("Failed to open ledger")?;
  let store = workspace.state.store();

  let cancel = CancelToken::new();
  let ctx = ExecuteContext::new(Arc::new(store), Arc::new(ledger))
    .with_resources(workspace.resources)
    .with_cancel(cancel.clone());
  let config = args.config();

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let result = rt.block_on(async {
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupt received, cancelling build");
        cancel.cancel();
      }
    });
    execute::build(workspace.graph.clone(), &filter, &ctx, &config).await
  });
  // Timed out commands may still be running on blocking threads.
  rt.shutdown_background();
  let (snapshot, report) = result.context("Build failed")?;
  info!(graph = %snapshot.graph, "build finished");

  if args.json {
    print_json(&json!({
      "summary": snapshot.summary(),
      "report": report,
      "success": report.is_success(),
    }))?;
    return Ok(report.is_success());
  }

  print_snapshot_header(&snapshot);
  println!();
  for outcome in &report.outcomes {
    print_outcome(outcome);
  }
  for failure in &report.hook_failures {
    let partition = failure.partition.as_ref().map(|k| format!(" [{}]", k)).unwrap_or_default();
    print_warning(&format!(
      "{} hook of {}{} failed: {}",
      failure.point, failure.producer, partition, failure.message
    ));
  }

  print_summary(&report);
  Ok(report.is_success())
}

fn print_outcome(outcome: &UnitOutcome) {
  let took = outcome
    .duration
    .map(|d| format!("({})", format_duration(d)))
    .unwrap_or_default();
  let (symbol, tone, detail) = match &outcome.state {
    UnitState::Succeeded => (symbols::SUCCESS, Tone::Good, took),
    UnitState::Current => (symbols::NONE, Tone::Muted, "(current)".to_string()),
    UnitState::Failed { error } => (symbols::ERROR, Tone::Bad, error.to_string()),
    UnitState::Skipped(reason) => (symbols::SKIP, Tone::Warn, format!("(skipped: {})", reason)),
  };
  print_unit_line(symbol, tone, &outcome.unit, &detail);
}

fn print_summary(report: &RunReport) {
  println!();
  print_stat("Succeeded", &report.succeeded().to_string());
  print_stat("Current", &report.current().to_string());
  print_stat("Failed", &report.failed().to_string());
  print_stat("Skipped", &report.skipped().to_string());
  println!();

  if report.cancelled {
    print_warning("Build cancelled");
  }
  if report.is_success() {
    print_success("Build complete");
  } else {
    print_error(&format!(
      "Build incomplete: {} failed, {} skipped",
      report.failed(),
      report.skipped()
    ));
  }
}
