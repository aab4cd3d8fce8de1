//! External resources (connections) acquired around producer execution.
//!
//! The executor never inspects a [`Connection`]. It acquires one per declared resource before a
//! unit runs and releases it when the unit finishes, on every exit path. A resource registered
//! with a limit admits at most that many simultaneous holders across the whole run; further
//! units wait for a free slot instead of failing.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// An opaque handle handed to producer logic.
pub type Connection = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Error)]
pub enum ResourceError {
  #[error("unknown resource `{0}`")]
  Unknown(String),

  #[error("failed to acquire resource `{name}`: {message}")]
  Acquire { name: String, message: String },

  #[error("resource pool closed")]
  Closed,
}

/// The resource collaborator.
pub trait Resource: Send + Sync {
  fn acquire(&self) -> Result<Connection, ResourceError>;

  fn release(&self, _connection: Connection) {}
}

/// A token resource: its connection is just its name. Useful to model an externally limited
/// capacity (a warehouse slot, a cluster queue) without a real client.
#[derive(Debug, Clone)]
pub struct Slot {
  name: String,
}

impl Slot {
  pub fn new(name: impl Into<String>) -> Self {
    Self { name: name.into() }
  }
}

impl Resource for Slot {
  fn acquire(&self) -> Result<Connection, ResourceError> {
    Ok(Arc::new(self.name.clone()))
  }
}

struct PoolEntry {
  resource: Arc<dyn Resource>,
  limit: Option<usize>,
  permits: Option<Arc<Semaphore>>,
}

/// Named resources available to a run.
#[derive(Default, Clone)]
pub struct ResourcePool {
  entries: HashMap<String, Arc<PoolEntry>>,
}

impl ResourcePool {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a resource, optionally capping concurrent holders.
  pub fn register(&mut self, name: impl Into<String>, resource: impl Resource + 'static, limit: Option<usize>) {
    let permits = limit.map(|n| Arc::new(Semaphore::new(n.max(1))));
    self.entries.insert(
      name.into(),
      Arc::new(PoolEntry {
        resource: Arc::new(resource),
        limit,
        permits,
      }),
    );
  }

  pub fn with(mut self, name: impl Into<String>, resource: impl Resource + 'static, limit: Option<usize>) -> Self {
    self.register(name, resource, limit);
    self
  }

  pub fn contains(&self, name: &str) -> bool {
    self.entries.contains_key(name)
  }

  pub fn limit(&self, name: &str) -> Option<usize> {
    self.entries.get(name).and_then(|e| e.limit)
  }

  /// Acquire every named resource, waiting for capacity where capped.
  ///
  /// Names are acquired in sorted order so two units needing the same capped resources cannot
  /// deadlock. On error, leases already taken are released when the partial set drops.
  pub async fn acquire_all(&self, names: &[String]) -> Result<Leases, ResourceError> {
    let mut sorted: Vec<&String> = names.iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut leases = Vec::with_capacity(sorted.len());
    for name in sorted {
      let entry = self.entries.get(name).ok_or_else(|| ResourceError::Unknown(name.clone()))?;
      let permit = match &entry.permits {
        Some(permits) => Some(permits.clone().acquire_owned().await.map_err(|_| ResourceError::Closed)?),
        None => None,
      };
      let connection = entry.resource.acquire()?;
      debug!(resource = %name, "acquired resource");
      leases.push(Lease {
        name: name.clone(),
        entry: entry.clone(),
        connection: Some(connection),
        _permit: permit,
      });
    }
    Ok(Leases(leases))
  }
}

impl fmt::Debug for ResourcePool {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut names: Vec<_> = self.entries.keys().collect();
    names.sort();
    f.debug_struct("ResourcePool").field("resources", &names).finish()
  }
}

/// A held resource. Releases the connection, then the capacity slot, when dropped.
pub struct Lease {
  name: String,
  entry: Arc<PoolEntry>,
  connection: Option<Connection>,
  _permit: Option<OwnedSemaphorePermit>,
}

impl Drop for Lease {
  fn drop(&mut self) {
    if let Some(connection) = self.connection.take() {
      self.entry.resource.release(connection);
      debug!(resource = %self.name, "released resource");
    }
  }
}

/// The set of leases held by one unit.
#[derive(Default)]
pub struct Leases(Vec<Lease>);

impl Leases {
  pub fn connections(&self) -> BTreeMap<String, Connection> {
    self
      .0
      .iter()
      .filter_map(|lease| lease.connection.clone().map(|c| (lease.name.clone(), c)))
      .collect()
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}
