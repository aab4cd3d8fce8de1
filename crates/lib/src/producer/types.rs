use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::artifact::NodePath;
use crate::descriptor::{FormatSpec, TypeSpec};
use crate::fingerprint::Fingerprint;
use crate::partition::{PartitionKey, PartitionMapping};
use crate::resource::Connection;
use crate::version::Version;

use super::hooks::{HookError, HookEvent, HookPoint, Hooks};

/// Errors raised by producer logic.
#[derive(Debug, Error)]
pub enum ComputeError {
  #[error("{0}")]
  Message(String),

  #[error("no input bound to role `{0}`")]
  MissingInput(String),

  #[error("command failed with exit code {code:?}: {cmd}")]
  CmdFailed {
    cmd: String,
    code: Option<i32>,
    stderr: String,
  },

  #[error("invalid output: {0}")]
  InvalidOutput(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

impl ComputeError {
  pub fn msg(message: impl fmt::Display) -> Self {
    ComputeError::Message(message.to_string())
  }
}

/// Everything producer logic sees for one output partition.
///
/// Values arrive through the executor's read views; the logic never touches storage.
pub struct BuildContext {
  pub producer: NodePath,
  pub partition: PartitionKey,
  /// Per input role, the value of each contributing input partition.
  pub inputs: BTreeMap<String, Vec<(PartitionKey, Value)>>,
  pub connections: BTreeMap<String, Connection>,
}

impl BuildContext {
  /// The single value bound to `role`. Errors when the role is missing or has no partitions.
  pub fn input(&self, role: &str) -> Result<&Value, ComputeError> {
    self
      .inputs
      .get(role)
      .and_then(|values| values.first())
      .map(|(_, value)| value)
      .ok_or_else(|| ComputeError::MissingInput(role.to_string()))
  }

  /// Every partition value bound to `role`, in key order.
  pub fn inputs_of(&self, role: &str) -> Result<&[(PartitionKey, Value)], ComputeError> {
    self
      .inputs
      .get(role)
      .map(Vec::as_slice)
      .ok_or_else(|| ComputeError::MissingInput(role.to_string()))
  }

  pub fn connection(&self, name: &str) -> Option<&Connection> {
    self.connections.get(name)
  }
}

/// The producer's computation. Returns one value per declared output, in declaration order.
///
/// Runs on a blocking worker thread; it may block on I/O.
pub trait Compute: Send + Sync {
  fn build(&self, ctx: &BuildContext) -> Result<Vec<Value>, ComputeError>;
}

impl<F> Compute for F
where
  F: Fn(&BuildContext) -> Result<Vec<Value>, ComputeError> + Send + Sync,
{
  fn build(&self, ctx: &BuildContext) -> Result<Vec<Value>, ComputeError> {
    self(ctx)
  }
}

/// One input role: the artifact it reads and what the producer expects of it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputBinding {
  pub artifact: NodePath,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub expects: Option<TypeSpec>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub format: Option<FormatSpec>,
}

/// One output: the artifact it writes and the type the producer declares for it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputBinding {
  pub artifact: NodePath,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub expects: Option<TypeSpec>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub format: Option<FormatSpec>,
}

/// A versioned computation node.
#[derive(Clone)]
pub struct Producer {
  pub path: NodePath,
  pub version: Version,
  pub inputs: BTreeMap<String, InputBinding>,
  pub outputs: Vec<OutputBinding>,
  pub mapping: PartitionMapping,
  /// Names of resources acquired around each unit.
  pub resources: Vec<String>,
  pub hooks: Hooks,
  /// Overrides the run-wide unit timeout.
  pub timeout: Option<Duration>,
  compute: Arc<dyn Compute>,
  /// Roles bound again after their first binding; rejected when the graph is sealed.
  rebound: Vec<String>,
}

impl Producer {
  pub fn new(path: NodePath, version: Version, compute: impl Compute + 'static) -> Self {
    Self {
      path,
      version,
      inputs: BTreeMap::new(),
      outputs: Vec::new(),
      mapping: PartitionMapping::Identity,
      resources: Vec::new(),
      hooks: Hooks::new(),
      timeout: None,
      compute: Arc::new(compute),
      rebound: Vec::new(),
    }
  }

  /// Build from a closure.
  pub fn from_fn<F>(path: NodePath, version: Version, f: F) -> Self
  where
    F: Fn(&BuildContext) -> Result<Vec<Value>, ComputeError> + Send + Sync + 'static,
  {
    Self::new(path, version, f)
  }

  pub fn input(self, role: impl Into<String>, artifact: NodePath) -> Self {
    self.input_expecting(role, artifact, None)
  }

  pub fn input_expecting(mut self, role: impl Into<String>, artifact: NodePath, expects: Option<TypeSpec>) -> Self {
    let role = role.into();
    let binding = InputBinding {
      artifact,
      expects,
      format: None,
    };
    if self.inputs.insert(role.clone(), binding).is_some() {
      warn!(producer = %self.path, role = %role, "input role bound twice");
      self.rebound.push(role);
    }
    self
  }

  /// Input roles that were bound more than once.
  pub fn rebound_roles(&self) -> &[String] {
    &self.rebound
  }

  pub fn output(self, artifact: NodePath) -> Self {
    self.output_expecting(artifact, None)
  }

  pub fn output_expecting(mut self, artifact: NodePath, expects: Option<TypeSpec>) -> Self {
    self.outputs.push(OutputBinding {
      artifact,
      expects,
      format: None,
    });
    self
  }

  /// Bind a role with a fully specified binding.
  pub fn bind_input(mut self, role: impl Into<String>, binding: InputBinding) -> Self {
    self.inputs.insert(role.into(), binding);
    self
  }

  pub fn bind_output(mut self, binding: OutputBinding) -> Self {
    self.outputs.push(binding);
    self
  }

  pub fn with_mapping(mut self, mapping: PartitionMapping) -> Self {
    self.mapping = mapping;
    self
  }

  pub fn with_resource(mut self, name: impl Into<String>) -> Self {
    self.resources.push(name.into());
    self
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }

  pub fn with_hook<F>(mut self, point: HookPoint, f: F) -> Self
  where
    F: Fn(&HookEvent<'_>) -> Result<(), HookError> + Send + Sync + 'static,
  {
    self.hooks.on(point, f);
    self
  }

  pub fn compute(&self) -> Arc<dyn Compute> {
    self.compute.clone()
  }

  /// Identity of the declaration: path, version, bindings and mapping kind. The computation
  /// itself is opaque and only enters through the version.
  pub fn fingerprint(&self) -> Fingerprint {
    let inputs = self
      .inputs
      .iter()
      .map(|(role, b)| Fingerprint::of_str(&format!("in:{}={}", role, b.artifact)));
    let outputs = self
      .outputs
      .iter()
      .enumerate()
      .map(|(i, b)| Fingerprint::of_str(&format!("out:{}={}", i, b.artifact)));
    Fingerprint::combine_all(
      [
        self.path.fingerprint(),
        self.version.fingerprint(),
        Fingerprint::of_str(&format!("mapping:{}", self.mapping.name())),
      ]
      .into_iter()
      .chain(inputs)
      .chain(outputs),
    )
  }

  pub fn input_artifacts(&self) -> impl Iterator<Item = &NodePath> {
    self.inputs.values().map(|b| &b.artifact)
  }

  pub fn output_artifacts(&self) -> impl Iterator<Item = &NodePath> {
    self.outputs.iter().map(|b| &b.artifact)
  }
}

impl fmt::Debug for Producer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Producer")
      .field("path", &self.path)
      .field("version", &self.version)
      .field("inputs", &self.inputs)
      .field("outputs", &self.outputs)
      .field("mapping", &self.mapping)
      .field("resources", &self.resources)
      .field("hooks", &self.hooks)
      .finish()
  }
}
