//! Graph assembly and validation.
//!
//! A [`GraphBuilder`] collects artifacts and producers in any order. [`GraphBuilder::seal`]
//! validates the whole declaration at once and returns an immutable [`Graph`] that the planner
//! and executor work from:
//! - every path is unique and every referenced artifact exists
//! - each artifact has at most one producer
//! - artifacts and producers form a DAG
//! - partition dimensions agree with each producer's mapping
//! - declared role types and formats are compatible with the artifacts bound to them
//! - storage templates address every partition dimension, and no two artifacts share one
//! - no producer binds the same input role twice

mod types;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::{debug, info};

use crate::artifact::{Artifact, NodePath};
use crate::descriptor::{ExactTypes, FormatSpec, StorageError, TypeSpec, TypeSystem};
use crate::fingerprint::Fingerprint;
use crate::partition::{PartitionDims, PartitionMapping};
use crate::producer::Producer;
use crate::resource::ResourcePool;

pub use types::GraphError;

/// Collects declarations before validation.
#[derive(Debug)]
pub struct GraphBuilder {
  name: String,
  artifacts: Vec<Artifact>,
  producers: Vec<Producer>,
}

impl GraphBuilder {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      artifacts: Vec::new(),
      producers: Vec::new(),
    }
  }

  pub fn add_artifact(&mut self, artifact: Artifact) -> &mut Self {
    self.artifacts.push(artifact);
    self
  }

  pub fn add_producer(&mut self, producer: Producer) -> &mut Self {
    self.producers.push(producer);
    self
  }

  pub fn artifact(mut self, artifact: Artifact) -> Self {
    self.add_artifact(artifact);
    self
  }

  pub fn producer(mut self, producer: Producer) -> Self {
    self.add_producer(producer);
    self
  }

  /// Validate with [`ExactTypes`].
  pub fn build(self) -> Result<Graph, GraphError> {
    self.seal(ExactTypes)
  }

  /// Validate the declaration and freeze it.
  pub fn seal(self, type_system: impl TypeSystem + 'static) -> Result<Graph, GraphError> {
    let type_system: Arc<dyn TypeSystem> = Arc::new(type_system);

    let mut artifacts = BTreeMap::new();
    let mut locations: HashMap<String, NodePath> = HashMap::new();
    for artifact in self.artifacts {
      if artifacts.contains_key(&artifact.path) {
        return Err(GraphError::DuplicateArtifact(artifact.path));
      }
      let shape = validate_artifact(&artifact)?;
      if let Some(first) = locations.insert(shape.clone(), artifact.path.clone()) {
        return Err(GraphError::SharedStorage {
          first,
          second: artifact.path,
          location: shape,
        });
      }
      artifacts.insert(artifact.path.clone(), artifact);
    }

    let mut producers = BTreeMap::new();
    for producer in self.producers {
      if producers.contains_key(&producer.path) {
        return Err(GraphError::DuplicateProducer(producer.path));
      }
      if artifacts.contains_key(&producer.path) {
        return Err(GraphError::PathConflict(producer.path));
      }
      producers.insert(producer.path.clone(), producer);
    }

    let mut producer_of: HashMap<NodePath, NodePath> = HashMap::new();
    let mut consumers: HashMap<NodePath, Vec<NodePath>> = HashMap::new();
    for producer in producers.values() {
      if producer.outputs.is_empty() {
        return Err(GraphError::NoOutputs(producer.path.clone()));
      }
      if let Some(role) = producer.rebound_roles().first() {
        return Err(GraphError::DuplicateRole {
          producer: producer.path.clone(),
          role: role.clone(),
        });
      }
      for (role, binding) in &producer.inputs {
        let artifact = lookup(&artifacts, producer, role, &binding.artifact)?;
        check_binding(type_system.as_ref(), producer, role, artifact, &binding.expects, &binding.format, true)?;
        consumers
          .entry(binding.artifact.clone())
          .or_default()
          .push(producer.path.clone());
      }
      for (i, binding) in producer.outputs.iter().enumerate() {
        let role = format!("output[{}]", i);
        let artifact = lookup(&artifacts, producer, &role, &binding.artifact)?;
        check_binding(type_system.as_ref(), producer, &role, artifact, &binding.expects, &binding.format, false)?;
        if let Some(first) = producer_of.insert(binding.artifact.clone(), producer.path.clone()) {
          return Err(GraphError::MultipleProducers {
            artifact: binding.artifact.clone(),
            first,
            second: producer.path.clone(),
          });
        }
      }
    }

    let order = topo_order(&artifacts, &producers)?;

    for producer in producers.values() {
      validate_partitioning(producer, &artifacts)?;
    }

    let graph = Graph {
      name: self.name,
      artifacts,
      producers,
      order,
      producer_of,
      consumers,
      type_system,
    };
    info!(
      graph = %graph.name,
      artifacts = graph.artifacts.len(),
      producers = graph.producers.len(),
      fingerprint = %graph.fingerprint(),
      "sealed graph"
    );
    Ok(graph)
  }
}

fn lookup<'a>(
  artifacts: &'a BTreeMap<NodePath, Artifact>,
  producer: &Producer,
  role: &str,
  path: &NodePath,
) -> Result<&'a Artifact, GraphError> {
  artifacts.get(path).ok_or_else(|| GraphError::UnknownArtifact {
    producer: producer.path.clone(),
    role: role.to_string(),
    artifact: path.clone(),
  })
}

/// Inputs: the producer's expectation is the declared side, the artifact supplies the value.
/// Outputs: the artifact is the declared side, the producer supplies the value.
fn check_binding(
  type_system: &dyn TypeSystem,
  producer: &Producer,
  role: &str,
  artifact: &Artifact,
  expects: &Option<TypeSpec>,
  format: &Option<FormatSpec>,
  is_input: bool,
) -> Result<(), GraphError> {
  if let Some(expects) = expects {
    let compatible = if is_input {
      type_system.is_compatible(expects, &artifact.type_spec)
    } else {
      type_system.is_compatible(&artifact.type_spec, expects)
    };
    if !compatible {
      return Err(GraphError::IncompatibleType {
        producer: producer.path.clone(),
        role: role.to_string(),
        artifact: artifact.path.clone(),
        declared: expects.clone(),
        actual: artifact.type_spec.clone(),
      });
    }
  }
  if let Some(format) = format
    && *format != artifact.format
  {
    return Err(GraphError::IncompatibleFormat {
      producer: producer.path.clone(),
      role: role.to_string(),
      artifact: artifact.path.clone(),
      declared: format.clone(),
      actual: artifact.format.clone(),
    });
  }
  Ok(())
}

/// Check an artifact on its own and return the shape of its storage template.
fn validate_artifact(artifact: &Artifact) -> Result<String, GraphError> {
  let template_error = |e: StorageError| GraphError::StorageTemplate {
    artifact: artifact.path.clone(),
    message: e.to_string(),
  };
  let placeholders = artifact.storage.placeholders().map_err(template_error)?;
  if placeholders != artifact.partition_by {
    let list = |dims: &PartitionDims| dims.iter().cloned().collect::<Vec<_>>().join(", ");
    return Err(GraphError::StorageTemplate {
      artifact: artifact.path.clone(),
      message: format!(
        "template `{}` uses [{}] but the artifact is partitioned by [{}]",
        artifact.storage,
        list(&placeholders),
        list(&artifact.partition_by)
      ),
    });
  }
  if let Some(key) = artifact.partitions.iter().find(|k| k.dims() != artifact.partition_by) {
    return Err(GraphError::DeclaredPartition {
      artifact: artifact.path.clone(),
      key: key.clone(),
    });
  }
  artifact.storage.shape().map_err(template_error)
}

/// Check the producer's mapping against the dimensions of the artifacts it binds.
fn validate_partitioning(producer: &Producer, artifacts: &BTreeMap<NodePath, Artifact>) -> Result<(), GraphError> {
  let mismatch = |message: String| GraphError::PartitionMismatch {
    producer: producer.path.clone(),
    message,
  };
  let dims_of = |path: &NodePath| artifacts.get(path).map(|a| a.partition_by.clone()).unwrap_or_default();
  let show = |dims: &PartitionDims| format!("[{}]", dims.iter().cloned().collect::<Vec<_>>().join(", "));

  let expected_output = match &producer.mapping {
    PartitionMapping::Identity => {
      let mut roles = producer.inputs.iter();
      let first = roles.next().map(|(role, b)| (role, dims_of(&b.artifact)));
      if let Some((first_role, first_dims)) = &first {
        for (role, binding) in roles {
          let dims = dims_of(&binding.artifact);
          if dims != *first_dims {
            return Err(mismatch(format!(
              "identity mapping needs equal input dimensions, but `{}` is {} and `{}` is {}",
              first_role,
              show(first_dims),
              role,
              show(&dims)
            )));
          }
        }
      }
      first.map(|(_, dims)| dims).unwrap_or_default()
    }
    PartitionMapping::AllToOne => PartitionDims::new(),
    PartitionMapping::Custom(mapper) => {
      for (role, dims) in mapper.input_dims() {
        let binding = producer
          .inputs
          .get(&role)
          .ok_or_else(|| mismatch(format!("mapping declares dimensions for unknown role `{}`", role)))?;
        let actual = dims_of(&binding.artifact);
        if actual != dims {
          return Err(mismatch(format!(
            "mapping expects role `{}` partitioned by {}, but `{}` is partitioned by {}",
            role,
            show(&dims),
            binding.artifact,
            show(&actual)
          )));
        }
      }
      mapper.output_dims()
    }
  };

  for binding in &producer.outputs {
    let dims = dims_of(&binding.artifact);
    if dims != expected_output {
      return Err(mismatch(format!(
        "{} mapping yields partitions by {}, but output `{}` is partitioned by {}",
        producer.mapping.name(),
        show(&expected_output),
        binding.artifact,
        show(&dims)
      )));
    }
  }
  Ok(())
}

#[derive(Debug, Clone)]
enum Node {
  Artifact(NodePath),
  Producer(NodePath),
}

/// Producers in dependency order: a producer appears after every producer of its inputs.
fn topo_order(
  artifacts: &BTreeMap<NodePath, Artifact>,
  producers: &BTreeMap<NodePath, Producer>,
) -> Result<Vec<NodePath>, GraphError> {
  let mut graph: DiGraph<Node, ()> = DiGraph::new();
  let mut artifact_nodes: HashMap<&NodePath, NodeIndex> = HashMap::new();

  for path in artifacts.keys() {
    artifact_nodes.insert(path, graph.add_node(Node::Artifact(path.clone())));
  }
  for producer in producers.values() {
    let idx = graph.add_node(Node::Producer(producer.path.clone()));
    for input in producer.input_artifacts() {
      if let Some(&a) = artifact_nodes.get(input) {
        graph.add_edge(a, idx, ());
      }
    }
    for output in producer.output_artifacts() {
      if let Some(&a) = artifact_nodes.get(output) {
        graph.add_edge(idx, a, ());
      }
    }
  }

  let sorted = toposort(&graph, None).map_err(|cycle| {
    let node = match &graph[cycle.node_id()] {
      Node::Artifact(path) | Node::Producer(path) => path.clone(),
    };
    GraphError::Cycle { node }
  })?;

  let order: Vec<NodePath> = sorted
    .into_iter()
    .filter_map(|idx| match &graph[idx] {
      Node::Producer(path) => Some(path.clone()),
      Node::Artifact(_) => None,
    })
    .collect();
  debug!(order = ?order.iter().map(NodePath::as_str).collect::<Vec<_>>(), "producer order");
  Ok(order)
}

/// A validated, immutable build graph.
#[derive(Clone)]
pub struct Graph {
  name: String,
  artifacts: BTreeMap<NodePath, Artifact>,
  producers: BTreeMap<NodePath, Producer>,
  order: Vec<NodePath>,
  producer_of: HashMap<NodePath, NodePath>,
  consumers: HashMap<NodePath, Vec<NodePath>>,
  type_system: Arc<dyn TypeSystem>,
}

impl Graph {
  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn artifact(&self, path: &NodePath) -> Option<&Artifact> {
    self.artifacts.get(path)
  }

  /// All artifacts, sorted by path.
  pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
    self.artifacts.values()
  }

  pub fn producer(&self, path: &NodePath) -> Option<&Producer> {
    self.producers.get(path)
  }

  /// All producers in dependency order.
  pub fn producers(&self) -> impl Iterator<Item = &Producer> {
    self.order.iter().filter_map(|path| self.producers.get(path))
  }

  /// The producer writing `artifact`, if it is not a source.
  pub fn producer_of(&self, artifact: &NodePath) -> Option<&Producer> {
    self.producer_of.get(artifact).and_then(|p| self.producers.get(p))
  }

  /// Artifacts with no producer. Their partitions come from declarations and the ledger.
  pub fn sources(&self) -> impl Iterator<Item = &Artifact> {
    self.artifacts.values().filter(|a| !self.producer_of.contains_key(&a.path))
  }

  pub fn is_source(&self, artifact: &NodePath) -> bool {
    self.artifacts.contains_key(artifact) && !self.producer_of.contains_key(artifact)
  }

  /// Producers reading `artifact`.
  pub fn consumers_of(&self, artifact: &NodePath) -> &[NodePath] {
    self.consumers.get(artifact).map(Vec::as_slice).unwrap_or_default()
  }

  pub fn type_system(&self) -> &dyn TypeSystem {
    self.type_system.as_ref()
  }

  /// Check that every resource a producer requires is registered in `pool`.
  pub fn check_resources(&self, pool: &ResourcePool) -> Result<(), GraphError> {
    for producer in self.producers() {
      if let Some(resource) = producer.resources.iter().find(|r| !pool.contains(r)) {
        return Err(GraphError::UnknownResource {
          producer: producer.path.clone(),
          resource: resource.clone(),
        });
      }
    }
    Ok(())
  }

  /// Identity of the whole declaration.
  pub fn fingerprint(&self) -> Fingerprint {
    Fingerprint::combine_all(
      std::iter::once(Fingerprint::of_str(&format!("graph:{}", self.name)))
        .chain(self.artifacts.values().map(Artifact::fingerprint))
        .chain(self.producers.values().map(Producer::fingerprint)),
    )
  }
}

impl fmt::Debug for Graph {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Graph")
      .field("name", &self.name)
      .field("artifacts", &self.artifacts.keys().collect::<Vec<_>>())
      .field("producers", &self.order)
      .finish()
  }
}
