//! Producer lifecycle hooks.
//!
//! Hooks are registered per producer against a fixed set of [`HookPoint`]s and invoked in
//! registration order. A failing `before-*` hook vetoes the work it guards; failures at the
//! other points are reported and never change an outcome that was already decided.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::artifact::NodePath;
use crate::partition::PartitionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HookPoint {
  /// Once per producer per run, before its first unit runs.
  BeforeProducer,
  /// Once per producer per run, after its last unit resolved.
  AfterProducer,
  BeforePartition,
  AfterPartition,
  OnPartitionError,
}

impl HookPoint {
  /// Whether a failure at this point prevents execution.
  pub fn can_veto(&self) -> bool {
    matches!(self, HookPoint::BeforeProducer | HookPoint::BeforePartition)
  }
}

impl fmt::Display for HookPoint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      HookPoint::BeforeProducer => "before-producer",
      HookPoint::AfterProducer => "after-producer",
      HookPoint::BeforePartition => "before-partition",
      HookPoint::AfterPartition => "after-partition",
      HookPoint::OnPartitionError => "on-partition-error",
    };
    write!(f, "{}", name)
  }
}

/// What a hook is told about the moment it fires.
#[derive(Debug, Clone)]
pub struct HookEvent<'a> {
  pub point: HookPoint,
  pub producer: &'a NodePath,
  /// `None` for producer-level points.
  pub partition: Option<&'a PartitionKey>,
  /// The unit's error, for `on-partition-error`.
  pub error: Option<&'a str>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct HookError(pub String);

impl HookError {
  pub fn new(message: impl Into<String>) -> Self {
    Self(message.into())
  }
}

pub trait Hook: Send + Sync {
  fn call(&self, event: &HookEvent<'_>) -> Result<(), HookError>;
}

impl<F> Hook for F
where
  F: Fn(&HookEvent<'_>) -> Result<(), HookError> + Send + Sync,
{
  fn call(&self, event: &HookEvent<'_>) -> Result<(), HookError> {
    self(event)
  }
}

/// A recorded hook failure, attributed to the hook point, producer and partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookFailure {
  pub point: HookPoint,
  pub producer: NodePath,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub partition: Option<PartitionKey>,
  pub message: String,
}

/// Ordered handler list.
#[derive(Clone, Default)]
pub struct Hooks {
  handlers: Vec<(HookPoint, Arc<dyn Hook>)>,
}

impl Hooks {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, point: HookPoint, hook: impl Hook + 'static) {
    self.handlers.push((point, Arc::new(hook)));
  }

  /// Register a closure.
  pub fn on<F>(&mut self, point: HookPoint, f: F)
  where
    F: Fn(&HookEvent<'_>) -> Result<(), HookError> + Send + Sync + 'static,
  {
    self.handlers.push((point, Arc::new(f)));
  }

  pub fn is_empty(&self) -> bool {
    self.handlers.is_empty()
  }

  pub fn count(&self, point: HookPoint) -> usize {
    self.handlers.iter().filter(|(p, _)| *p == point).count()
  }

  /// Invoke every handler for `event.point` in order.
  ///
  /// At veto-capable points the first failure stops the remaining handlers.
  pub fn fire(&self, event: &HookEvent<'_>) -> Vec<HookFailure> {
    let mut failures = Vec::new();
    for (_, hook) in self.handlers.iter().filter(|(p, _)| *p == event.point) {
      if let Err(e) = hook.call(event) {
        warn!(
          hook = %event.point,
          producer = %event.producer,
          partition = ?event.partition.map(|k| k.to_string()),
          error = %e,
          "hook failed"
        );
        failures.push(HookFailure {
          point: event.point,
          producer: event.producer.clone(),
          partition: event.partition.cloned(),
          message: e.0,
        });
        if event.point.can_veto() {
          break;
        }
      }
    }
    failures
  }
}

impl fmt::Debug for Hooks {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_list().entries(self.handlers.iter().map(|(p, _)| p)).finish()
  }
}
