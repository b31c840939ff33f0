//! Cooperative shutdown signalling.
//!
//! Long-running tasks hold a [`ShutdownSignal`] and `select!` on
//! [`ShutdownSignal::recv`] at every suspension point; the owner triggers
//! the paired [`ShutdownHandle`] (typically on ctrl-c). In-flight fetches
//! and sends are never interrupted forcibly — a loop observes the signal
//! and exits within one cycle.

use tokio::sync::watch;

/// Create a linked handle/signal pair.
pub fn channel() -> (ShutdownHandle, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownHandle { tx }, ShutdownSignal { rx })
}

/// Owner side: triggers shutdown for every linked signal.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Ask all linked tasks to stop.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Task side: cheap to clone, one per task.
#[derive(Clone, Debug)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when shutdown is requested (or the handle is dropped).
    pub async fn recv(&mut self) {
        // Already signalled, or signalled while we were not listening.
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// A signal that never fires; for tests and fire-and-forget tools.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // Leak the sender so the signal stays pending forever.
        std::mem::forget(tx);
        Self { rx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_fires_after_shutdown() {
        let (handle, mut signal) = channel();
        assert!(!signal.is_shutdown());
        handle.shutdown();
        assert!(signal.is_shutdown());
        // recv resolves promptly.
        tokio::time::timeout(Duration::from_millis(50), signal.recv())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_recv_pends_until_shutdown() {
        let (handle, mut signal) = channel();
        let pending = tokio::time::timeout(Duration::from_millis(20), signal.recv()).await;
        assert!(pending.is_err());
        handle.shutdown();
        tokio::time::timeout(Duration::from_millis(50), signal.recv())
            .await
            .unwrap();
    }
}
