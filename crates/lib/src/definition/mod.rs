//! Graph definition files.
//!
//! A definition (`arti.toml`) declares a graph whose producers are shell commands:
//!
//! ```toml
//! name = "sales"
//!
//! [resources.warehouse]
//! limit = 2
//!
//! [artifacts."vendor.transactions"]
//! partition_by = ["date"]
//! partitions = ["date=2021-10-01", "date=2021-10-02"]
//!
//! [artifacts."daily.totals"]
//! type = "number"
//! partition_by = ["date"]
//!
//! [producers.totals]
//! version = { semver = "1.2.0" }
//! cmd = "jq '[.rows[0].value | length]'"
//! inputs = { rows = "vendor.transactions" }
//! outputs = ["daily.totals"]
//! resources = ["warehouse"]
//! timeout = "30s"
//! ```

mod state;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::artifact::{Artifact, NodePath, PathError};
use crate::descriptor::{FormatSpec, JsonTypes, StorageSpec, TypeSpec};
use crate::graph::{Graph, GraphBuilder, GraphError};
use crate::partition::{PartitionKey, PartitionKeyError, PartitionMapping};
use crate::producer::{CommandCompute, InputBinding, OutputBinding, Producer};
use crate::resource::{ResourcePool, Slot};
use crate::version::{Version, VersionError};

pub use state::{DEFAULT_DEFINITION_FILE, DEFAULT_STATE_DIR, STATE_DIR_ENV, StateDir, resolve_state_dir};

#[derive(Debug, Error)]
pub enum DefinitionError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid definition: {0}")]
  Parse(#[from] toml::de::Error),

  #[error(transparent)]
  Path(#[from] PathError),

  #[error("artifact `{artifact}` declares invalid partition: {source}")]
  Partition {
    artifact: String,
    #[source]
    source: PartitionKeyError,
  },

  #[error("producer `{producer}` has an invalid version: {source}")]
  Version {
    producer: String,
    #[source]
    source: VersionError,
  },

  #[error("producer `{producer}` has an invalid timeout `{value}`: {message}")]
  Timeout {
    producer: String,
    value: String,
    message: String,
  },

  #[error(transparent)]
  Graph(#[from] GraphError),
}

/// The parsed contents of a definition file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphDefinition {
  pub name: String,
  #[serde(default)]
  pub artifacts: BTreeMap<String, ArtifactDef>,
  #[serde(default)]
  pub producers: BTreeMap<String, ProducerDef>,
  #[serde(default)]
  pub resources: BTreeMap<String, ResourceDef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactDef {
  #[serde(rename = "type")]
  pub type_name: Option<String>,
  pub format: Option<String>,
  /// Location template; defaults to the path with one `dim={dim}` segment per dimension.
  pub storage: Option<String>,
  #[serde(default)]
  pub partition_by: Vec<String>,
  /// Partitions known to exist, as `dim=value,dim=value`.
  #[serde(default)]
  pub partitions: Vec<String>,
  #[serde(default)]
  pub annotations: BTreeMap<String, Value>,
  #[serde(default)]
  pub statistics: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProducerDef {
  pub version: VersionDef,
  pub cmd: String,
  #[serde(default)]
  pub inputs: BTreeMap<String, BindingDef>,
  pub outputs: Vec<BindingDef>,
  #[serde(default)]
  pub mapping: MappingDef,
  #[serde(default)]
  pub resources: Vec<String>,
  /// A `humantime` duration such as `30s` or `5m`.
  pub timeout: Option<String>,
  #[serde(default)]
  pub env: BTreeMap<String, String>,
  pub shell: Option<String>,
}

/// `"v1"`, or one of `{ semver = "1.2.0" }`, `{ git = "<sha>" }`, `{ git_env = "GIT_SHA" }`,
/// `{ timestamp = 1633046400 }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum VersionDef {
  Plain(String),
  Kind(VersionKind),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionKind {
  Semver(String),
  Git(String),
  GitEnv(String),
  Timestamp(i64),
}

impl VersionDef {
  pub fn to_version(&self) -> Result<Version, VersionError> {
    match self {
      VersionDef::Plain(value) => Ok(Version::string(value.clone())),
      VersionDef::Kind(VersionKind::Semver(input)) => Version::semver(input),
      VersionDef::Kind(VersionKind::Git(sha)) => Ok(Version::git_commit(sha.clone())),
      VersionDef::Kind(VersionKind::GitEnv(var)) => Version::git_commit_from_env(var),
      VersionDef::Kind(VersionKind::Timestamp(secs)) => Ok(Version::timestamp(*secs)),
    }
  }
}

/// An artifact path, or a table that also states what the producer expects of it.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BindingDef {
  Path(String),
  Table {
    artifact: String,
    #[serde(default, rename = "type")]
    type_name: Option<String>,
    format: Option<String>,
  },
}

impl BindingDef {
  pub fn artifact(&self) -> &str {
    match self {
      BindingDef::Path(path) => path,
      BindingDef::Table { artifact, .. } => artifact,
    }
  }

  fn type_spec(&self) -> Option<TypeSpec> {
    match self {
      BindingDef::Table {
        type_name: Some(name), ..
      } => Some(TypeSpec::new(name.clone())),
      _ => None,
    }
  }

  fn format_spec(&self) -> Option<FormatSpec> {
    match self {
      BindingDef::Table { format: Some(name), .. } => Some(FormatSpec::new(name.clone())),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MappingDef {
  #[default]
  Identity,
  AllToOne,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceDef {
  /// Maximum simultaneous holders; unlimited when absent.
  pub limit: Option<usize>,
}

/// A sealed graph together with the resources its producers use.
#[derive(Debug, Clone)]
pub struct LoadedGraph {
  pub graph: Graph,
  pub resources: ResourcePool,
}

impl FromStr for GraphDefinition {
  type Err = DefinitionError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Ok(toml::from_str(s)?)
  }
}

impl GraphDefinition {
  pub fn load(path: &Path) -> Result<Self, DefinitionError> {
    let content = fs::read_to_string(path).map_err(|source| DefinitionError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let definition: Self = content.parse()?;
    debug!(
      path = %path.display(),
      artifacts = definition.artifacts.len(),
      producers = definition.producers.len(),
      "loaded definition"
    );
    Ok(definition)
  }

  /// Build and seal the graph. Commands run with `base_dir` as their working directory.
  pub fn to_graph(&self, base_dir: &Path) -> Result<LoadedGraph, DefinitionError> {
    let mut builder = GraphBuilder::new(self.name.clone());
    for (path, def) in &self.artifacts {
      builder.add_artifact(artifact(path, def)?);
    }
    for (path, def) in &self.producers {
      builder.add_producer(producer(path, def, base_dir)?);
    }
    let graph = builder.seal(JsonTypes)?;

    let mut resources = ResourcePool::new();
    for (name, def) in &self.resources {
      resources.register(name.clone(), Slot::new(name.clone()), def.limit);
    }

    info!(graph = %graph.name(), resources = self.resources.len(), "graph definition ready");
    Ok(LoadedGraph { graph, resources })
  }
}

fn artifact(path: &str, def: &ArtifactDef) -> Result<Artifact, DefinitionError> {
  let mut artifact = Artifact::new(NodePath::parse(path)?).partitioned_by(def.partition_by.iter().cloned());
  if let Some(name) = &def.type_name {
    artifact = artifact.with_type(TypeSpec::new(name.clone()));
  }
  if let Some(name) = &def.format {
    artifact = artifact.with_format(FormatSpec::new(name.clone()));
  }
  if let Some(template) = &def.storage {
    artifact = artifact.with_storage(StorageSpec::new(template.clone()));
  }

  let partitions = def
    .partitions
    .iter()
    .map(|p| p.parse::<PartitionKey>())
    .collect::<Result<Vec<_>, _>>()
    .map_err(|source| DefinitionError::Partition {
      artifact: path.to_string(),
      source,
    })?;
  artifact = artifact.with_partitions(partitions);

  for (key, value) in &def.annotations {
    artifact = artifact.with_annotation(key.clone(), value.clone());
  }
  for name in &def.statistics {
    artifact = artifact.with_statistic(name.clone());
  }
  Ok(artifact)
}

fn producer(path: &str, def: &ProducerDef, base_dir: &Path) -> Result<Producer, DefinitionError> {
  let version = def.version.to_version().map_err(|source| DefinitionError::Version {
    producer: path.to_string(),
    source,
  })?;

  let mut compute = CommandCompute::new(def.cmd.clone(), def.outputs.len())
    .with_env(def.env.clone())
    .with_cwd(base_dir.to_path_buf());
  compute.shell = def.shell.clone();

  let mut producer = Producer::new(NodePath::parse(path)?, version, compute);
  for (role, binding) in &def.inputs {
    producer = producer.bind_input(
      role.clone(),
      InputBinding {
        artifact: NodePath::parse(binding.artifact())?,
        expects: binding.type_spec(),
        format: binding.format_spec(),
      },
    );
  }
  for binding in &def.outputs {
    producer = producer.bind_output(OutputBinding {
      artifact: NodePath::parse(binding.artifact())?,
      expects: binding.type_spec(),
      format: binding.format_spec(),
    });
  }

  producer = producer.with_mapping(match def.mapping {
    MappingDef::Identity => PartitionMapping::Identity,
    MappingDef::AllToOne => PartitionMapping::AllToOne,
  });
  for name in &def.resources {
    producer = producer.with_resource(name.clone());
  }
  if let Some(value) = &def.timeout {
    let timeout = humantime::parse_duration(value).map_err(|e| DefinitionError::Timeout {
      producer: path.to_string(),
      value: value.clone(),
      message: e.to_string(),
    })?;
    producer = producer.with_timeout(timeout);
  }
  Ok(producer)
}
