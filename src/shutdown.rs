//! Cooperative shutdown signal fan-out.
//!
//! One [`Shutdown`] handle is created at startup and cloned into every
//! background loop and listener. Triggering it resolves every pending
//! [`Shutdown::wait`] call; loops finish their in-flight work and return
//! rather than being cancelled mid-write.

use std::sync::Arc;

use tokio::sync::watch;

/// Cloneable shutdown signal.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    /// Signals every holder of this handle to stop.
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown has been triggered. Resolves immediately if it
    /// already was.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        // The sender lives as long as any handle, so a closed channel also
        // means the process is tearing down.
        let _ = rx.changed().await;
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

    #[tokio::test]
    async fn wait_resolves_after_trigger() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move {
            waiter.wait().await;
            true
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());
        shutdown.trigger();
        assert!(handle.await.unwrap());
    }

    #[tokio::test]
    async fn wait_resolves_immediately_when_already_triggered() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        assert!(shutdown.is_triggered());
        shutdown.wait().await;
    }
}
