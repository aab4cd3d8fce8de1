//! Graph validation errors.

use thiserror::Error;

use crate::artifact::NodePath;
use crate::descriptor::{FormatSpec, TypeSpec};
use crate::partition::PartitionKey;

/// Why a graph could not be sealed. Every variant is fatal: no plan or build is possible until
/// the declaration is fixed.
#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
  #[error("artifact `{0}` is declared more than once")]
  DuplicateArtifact(NodePath),

  #[error("producer `{0}` is declared more than once")]
  DuplicateProducer(NodePath),

  #[error("`{0}` is declared as both an artifact and a producer")]
  PathConflict(NodePath),

  #[error("producer `{producer}` references unknown artifact `{artifact}` (role `{role}`)")]
  UnknownArtifact {
    producer: NodePath,
    role: String,
    artifact: NodePath,
  },

  #[error("producer `{0}` declares no outputs")]
  NoOutputs(NodePath),

  #[error("artifact `{artifact}` is produced by both `{first}` and `{second}`")]
  MultipleProducers {
    artifact: NodePath,
    first: NodePath,
    second: NodePath,
  },

  /// `node` is one artifact or producer on the cycle.
  #[error("dependency cycle detected through `{node}`")]
  Cycle { node: NodePath },

  #[error("partition mismatch in producer `{producer}`: {message}")]
  PartitionMismatch { producer: NodePath, message: String },

  #[error("producer `{producer}` role `{role}` expects type `{declared}` but `{artifact}` is `{actual}`")]
  IncompatibleType {
    producer: NodePath,
    role: String,
    artifact: NodePath,
    declared: TypeSpec,
    actual: TypeSpec,
  },

  #[error("producer `{producer}` role `{role}` expects format `{declared}` but `{artifact}` is `{actual}`")]
  IncompatibleFormat {
    producer: NodePath,
    role: String,
    artifact: NodePath,
    declared: FormatSpec,
    actual: FormatSpec,
  },

  #[error("artifact `{artifact}` storage template: {message}")]
  StorageTemplate { artifact: NodePath, message: String },

  #[error("artifacts `{first}` and `{second}` share the storage location `{location}`")]
  SharedStorage {
    first: NodePath,
    second: NodePath,
    location: String,
  },

  #[error("producer `{producer}` binds input role `{role}` more than once")]
  DuplicateRole { producer: NodePath, role: String },

  #[error("artifact `{artifact}` declares partition {key} which does not match its dimensions")]
  DeclaredPartition { artifact: NodePath, key: PartitionKey },

  #[error("producer `{producer}` requires unknown resource `{resource}`")]
  UnknownResource { producer: NodePath, resource: String },
}
