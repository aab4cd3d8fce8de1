mod build;
mod plan;
mod seed;
mod status;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use artigraph_lib::definition::{DEFAULT_DEFINITION_FILE, GraphDefinition, StateDir, resolve_state_dir};
use artigraph_lib::graph::Graph;
use artigraph_lib::partition::{PartitionFilter, PartitionKey};
use artigraph_lib::resource::ResourcePool;

pub use build::{BuildArgs, cmd_build};
pub use plan::{PlanArgs, cmd_plan};
pub use seed::cmd_seed;
pub use status::cmd_status;

/// Options shared by every command that loads a graph.
#[derive(Debug, Clone, Args)]
pub struct GraphArgs {
  /// Path to the graph definition file
  #[arg(short, long, default_value = DEFAULT_DEFINITION_FILE)]
  pub file: PathBuf,

  /// Directory holding the ledger and local data (default: .arti next to the definition)
  #[arg(long)]
  pub state_dir: Option<PathBuf>,

  /// Restrict to partitions matching `dimension=value` (repeatable)
  #[arg(short, long = "partition", value_name = "DIM=VALUE")]
  pub partitions: Vec<String>,
}

impl GraphArgs {
  pub fn filter(&self) -> Result<PartitionFilter> {
    let joined = self.partitions.join(",");
    let key: PartitionKey = joined
      .parse()
      .with_context(|| format!("Invalid partition filter: {}", joined))?;
    Ok(PartitionFilter::new(key))
  }
}

/// A loaded definition and the state directory it runs against.
pub struct Workspace {
  pub graph: Arc<Graph>,
  pub resources: ResourcePool,
  pub state: StateDir,
}

impl Workspace {
  pub fn load(args: &GraphArgs) -> Result<Self> {
    let definition = GraphDefinition::load(&args.file)
      .with_context(|| format!("Failed to load graph definition: {}", args.file.display()))?;
    let base_dir = args
      .file
      .parent()
      .filter(|dir| !dir.as_os_str().is_empty())
      .unwrap_or(Path::new("."));
    let loaded = definition
      .to_graph(base_dir)
      .with_context(|| format!("Invalid graph definition: {}", args.file.display()))?;
    let state = StateDir::new(resolve_state_dir(args.state_dir.as_deref(), &args.file));

    Ok(Self {
      graph: Arc::new(loaded.graph),
      resources: loaded.resources,
      state,
    })
  }
}
