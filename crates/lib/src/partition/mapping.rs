//! Partition mappings relate a producer's input partitions to its output partitions.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use super::key::{PartitionDims, PartitionKey};

/// Known partitions of each input, keyed by input role.
pub type InputPartitions = BTreeMap<String, Vec<PartitionKey>>;

/// For one output partition, the input partitions (per role) that feed it.
pub type PartitionDependencies = BTreeMap<String, Vec<PartitionKey>>;

/// A user-supplied partition mapping.
///
/// The engine does not inspect the mapping logic. It validates the declared dimension domains
/// against the graph when the graph is sealed, and rejects duplicate or mis-shaped output keys
/// when planning.
pub trait PartitionMapper: Send + Sync {
  /// Dimensions expected of the inputs, per role. Roles left out are unconstrained.
  fn input_dims(&self) -> BTreeMap<String, PartitionDims> {
    BTreeMap::new()
  }

  /// Dimensions of every emitted output key.
  fn output_dims(&self) -> PartitionDims;

  /// Enumerate output partitions and their dependencies.
  fn map(&self, inputs: &InputPartitions) -> Vec<(PartitionKey, PartitionDependencies)>;
}

type MapFnInner = dyn Fn(&InputPartitions) -> Vec<(PartitionKey, PartitionDependencies)> + Send + Sync;

/// A [`PartitionMapper`] backed by a closure.
pub struct MapFn {
  input_dims: BTreeMap<String, PartitionDims>,
  output_dims: PartitionDims,
  f: Box<MapFnInner>,
}

impl MapFn {
  pub fn new<F>(output_dims: PartitionDims, f: F) -> Self
  where
    F: Fn(&InputPartitions) -> Vec<(PartitionKey, PartitionDependencies)> + Send + Sync + 'static,
  {
    Self {
      input_dims: BTreeMap::new(),
      output_dims,
      f: Box::new(f),
    }
  }

  /// Declare the dimensions a role is expected to carry.
  pub fn with_input_dims(mut self, role: impl Into<String>, dims: PartitionDims) -> Self {
    self.input_dims.insert(role.into(), dims);
    self
  }
}

impl PartitionMapper for MapFn {
  fn input_dims(&self) -> BTreeMap<String, PartitionDims> {
    self.input_dims.clone()
  }

  fn output_dims(&self) -> PartitionDims {
    self.output_dims.clone()
  }

  fn map(&self, inputs: &InputPartitions) -> Vec<(PartitionKey, PartitionDependencies)> {
    (self.f)(inputs)
  }
}

/// How a producer's output partitions are derived from its inputs.
#[derive(Clone, Default)]
pub enum PartitionMapping {
  /// Output partitions mirror input partitions 1:1 by key. All inputs, and the outputs, must
  /// share the same dimensions.
  #[default]
  Identity,

  /// Every partition of every input feeds a single unpartitioned output.
  AllToOne,

  Custom(Arc<dyn PartitionMapper>),
}

impl PartitionMapping {
  pub fn custom(mapper: impl PartitionMapper + 'static) -> Self {
    PartitionMapping::Custom(Arc::new(mapper))
  }

  pub fn name(&self) -> &'static str {
    match self {
      PartitionMapping::Identity => "identity",
      PartitionMapping::AllToOne => "all-to-one",
      PartitionMapping::Custom(_) => "custom",
    }
  }

  /// Enumerate output partitions. May contain duplicate keys for custom mappers; the planner
  /// rejects those.
  pub fn map(&self, inputs: &InputPartitions) -> Vec<(PartitionKey, PartitionDependencies)> {
    match self {
      PartitionMapping::Identity => identity(inputs),
      PartitionMapping::AllToOne => vec![(PartitionKey::empty(), inputs.clone())],
      PartitionMapping::Custom(mapper) => mapper.map(inputs),
    }
  }
}

impl fmt::Debug for PartitionMapping {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "PartitionMapping::{}", self.name())
  }
}

/// Union of all input keys; each output key depends on the same key in every role. A role that
/// lacks the key still lists it, so the planner sees it as missing rather than dropping it.
fn identity(inputs: &InputPartitions) -> Vec<(PartitionKey, PartitionDependencies)> {
  let mut keys: BTreeSet<PartitionKey> = inputs.values().flatten().cloned().collect();
  if inputs.is_empty() {
    keys.insert(PartitionKey::empty());
  }

  keys
    .into_iter()
    .map(|key| {
      let deps = inputs.keys().map(|role| (role.clone(), vec![key.clone()])).collect();
      (key, deps)
    })
    .collect()
}
