use std::sync::Arc;

use tokio::sync::watch;

/// Cooperative stop flag for a running cycle. Checked between endpoints and
/// between fan-out targets; a snapshot write in progress always completes.
#[derive(Debug, Clone)]
pub struct CycleCancel {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CycleCancel {
    fn default() -> Self {
        Self::new()
    }
}

impl CycleCancel {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn clones_observe_cancellation() {
        let cancel = CycleCancel::new();
        let observer = cancel.clone();
        assert!(!observer.is_cancelled());

        let waiter = tokio::spawn(async move { observer.cancelled().await });
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woken")
            .expect("joined");
        assert!(cancel.is_cancelled());
    }
}
