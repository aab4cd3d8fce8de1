//! Run-level cancellation.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// A cloneable cancellation signal.
///
/// Cancelling stops the executor from starting new units. Units already running are left to
/// finish so their writes are never cut short.
#[derive(Debug, Clone)]
pub struct CancelToken {
  tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
  pub fn new() -> Self {
    let (tx, _) = watch::channel(false);
    Self { tx: Arc::new(tx) }
  }

  pub fn cancel(&self) {
    if !self.tx.send_replace(true) {
      info!("cancellation requested");
    }
  }

  pub fn is_cancelled(&self) -> bool {
    *self.tx.borrow()
  }

  /// Resolves once [`CancelToken::cancel`] has been called.
  pub async fn cancelled(&self) {
    let mut rx = self.tx.subscribe();
    // The sender lives as long as `self`, so this only returns once the flag is set.
    let _ = rx.wait_for(|cancelled| *cancelled).await;
  }
}

impl Default for CancelToken {
  fn default() -> Self {
    Self::new()
  }
}
