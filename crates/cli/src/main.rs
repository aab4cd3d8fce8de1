mod cmd;
mod output;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{BuildArgs, GraphArgs, PlanArgs};

/// arti - incremental, partition-aware data builds
#[derive(Parser)]
#[command(name = "arti")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Show which partitions are stale, current or blocked (dry-run)
  Plan(PlanArgs),

  /// Plan and execute every stale partition
  Build(BuildArgs),

  /// Record fingerprints of source artifact partitions
  Seed {
    #[command(flatten)]
    graph: GraphArgs,

    /// Output as JSON
    #[arg(long)]
    json: bool,
  },

  /// List artifacts, their annotations and ledger entries
  Status {
    #[command(flatten)]
    graph: GraphArgs,

    /// Output as JSON
    #[arg(long)]
    json: bool,
  },
}

fn main() {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "warn" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let result = match cli.command {
    Commands::Plan(args) => cmd::cmd_plan(&args),
    Commands::Build(args) => cmd::cmd_build(&args),
    Commands::Seed { graph, json } => cmd::cmd_seed(&graph, json),
    Commands::Status { graph, json } => cmd::cmd_status(&graph, json, cli.verbose),
  };

  match result {
    Ok(true) => {}
    Ok(false) => std::process::exit(1),
    Err(e) => {
      output::print_error(&format!("{:#}", e));
      std::process::exit(1);
    }
  }
}
