//! Cooperative cancellation handle.

use std::sync::Arc;
use tokio::sync::watch;

/// A cloneable, level-triggered cancellation flag.
///
/// `trigger()` is synchronous, idempotent and lock-free from the caller's
/// point of view, so it can be called from a signal-handling task, an
/// exception path and an explicit stop without coordination.
#[derive(Clone, Debug)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    /// Creates a new, untriggered handle.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Requests cancellation. Safe to call any number of times.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Returns true once cancellation has been requested.
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Completes when cancellation is requested.
    ///
    /// Cancel-safe: use it as a branch of `tokio::select!` around every
    /// blocking call.
    pub async fn triggered(&self) {
        let mut rx = self.rx.clone();
        // The sender lives inside `self`, so `wait_for` cannot observe a closed channel
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_trigger_is_idempotent() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());

        shutdown.trigger();
        shutdown.trigger();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_clones_observe_trigger() {
        let shutdown = Shutdown::new();
        let observer = shutdown.clone();

        let waiter = tokio::spawn(async move {
            observer.triggered().await;
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        shutdown.trigger();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish after trigger")
            .unwrap();
    }

    #[tokio::test]
    async fn test_triggered_returns_immediately_when_already_set() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_millis(100), shutdown.triggered())
            .await
            .expect("already-triggered handle must not block");
    }
}
