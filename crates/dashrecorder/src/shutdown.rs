//! Shared shutdown signal for the recorder loops.
//!
//! Every long-running loop receives a clone of the same [`ShutdownSignal`]
//! and returns once it fires. Tests use it to stop a loop after a few
//! iterations instead of killing the process.

use std::sync::Arc;

use tokio::sync::watch;

/// A cloneable, one-shot shutdown token.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    /// Create an untriggered signal.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    /// Fire the signal. Every clone observes it; triggering twice is harmless.
    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    /// Whether the signal has fired.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait until the signal fires.
    ///
    /// Returns immediately if it already has. Safe to use in `select!`.
    pub async fn triggered(&self) {
        let mut receiver = self.receiver.clone();
        // The sender lives as long as any clone of the signal, so this only
        // returns once the value is true
        let _ = receiver.wait_for(|fired| *fired).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_signal_is_not_triggered() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());
    }

    #[test]
    fn test_trigger_is_seen_by_clones() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        clone.trigger();
        assert!(signal.is_triggered());
        assert!(clone.is_triggered());

        // Idempotent
        signal.trigger();
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_triggered_returns_after_trigger() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let task = tokio::spawn(async move { waiter.triggered().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.trigger();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter should finish")
            .unwrap();
    }

    #[tokio::test]
    async fn test_triggered_returns_immediately_when_already_fired() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(100), signal.triggered())
            .await
            .expect("already triggered");
    }
}
