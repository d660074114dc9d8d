//! Cooperative shutdown signal shared by the long-lived loops

use tokio::sync::watch;

/// Shutdown signal broadcaster
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Create a signal and its trigger side
    pub fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { receiver: rx })
    }

    /// Check if shutdown has been signaled
    pub fn is_shutdown(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait for shutdown signal
    pub async fn wait(&mut self) {
        if *self.receiver.borrow() {
            return;
        }
        let _ = self.receiver.changed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_flips_once_triggered() {
        let (tx, signal) = ShutdownSignal::new();
        assert!(!signal.is_shutdown());
        tx.send(true).unwrap();
        assert!(signal.is_shutdown());

        let mut waiter = signal.clone();
        // Already shutdown: wait must return immediately
        waiter.wait().await;
    }
}
