//! Cooperative cancellation for a build run.

use std::sync::Arc;

use tokio::sync::watch;

/// Creates a linked handle/signal pair.
pub fn cancellation() -> (CancelHandle, CancelSignal) {
  let (tx, rx) = watch::channel(false);
  (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}

/// Held by the caller; `cancel` stops scheduling and interrupts running tools.
#[derive(Debug, Clone)]
pub struct CancelHandle {
  tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
  pub fn cancel(&self) {
    self.tx.send_replace(true);
  }

  pub fn signal(&self) -> CancelSignal {
    CancelSignal { rx: self.tx.subscribe() }
  }
}

#[derive(Debug, Clone)]
pub struct CancelSignal {
  rx: watch::Receiver<bool>,
}

impl CancelSignal {
  /// A signal that never fires.
  pub fn never() -> Self {
    let (_tx, rx) = watch::channel(false);
    Self { rx }
  }

  pub fn is_cancelled(&self) -> bool {
    *self.rx.borrow()
  }

  /// Resolves once cancellation is requested; pending forever otherwise.
  pub async fn cancelled(&self) {
    let mut rx = self.rx.clone();
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
      std::future::pending::<()>().await;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test]
  async fn cancel_wakes_waiters() {
    let (handle, signal) = cancellation();
    assert!(!signal.is_cancelled());

    let waiter = tokio::spawn({
      let signal = signal.clone();
      async move { signal.cancelled().await }
    });

    handle.cancel();
    tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    assert!(signal.is_cancelled());
    assert!(handle.signal().is_cancelled());
  }

  #[tokio::test]
  async fn never_does_not_fire() {
    let signal = CancelSignal::never();
    let waited = tokio::time::timeout(Duration::from_millis(50), signal.cancelled()).await;
    assert!(waited.is_err());
    assert!(!signal.is_cancelled());
  }
}
