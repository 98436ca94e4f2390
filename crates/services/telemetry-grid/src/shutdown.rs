//! Cooperative shutdown signal shared by every long-running task

use tokio::sync::broadcast;

/// Receiving end of the shutdown broadcast
///
/// A task without a signal (`Shutdown::none()`) runs until the process
/// exits, which is the default for every loop in the grid.
pub struct Shutdown {
    rx: Option<broadcast::Receiver<()>>,
    triggered: bool,
}

impl Shutdown {
    pub fn new(tx: &broadcast::Sender<()>) -> Self {
        Self {
            rx: Some(tx.subscribe()),
            triggered: false,
        }
    }

    pub fn none() -> Self {
        Self {
            rx: None,
            triggered: false,
        }
    }

    /// Wait for the signal; pends forever without one
    ///
    /// ```
    /// # use remotemedia_telemetry_grid::shutdown::Shutdown;
    /// # tokio_test::block_on(async {
    /// let (tx, _) = tokio::sync::broadcast::channel(1);
    /// let mut shutdown = Shutdown::new(&tx);
    /// tx.send(()).unwrap();
    /// shutdown.recv().await;
    /// assert!(shutdown.is_triggered());
    /// # });
    /// ```
    pub async fn recv(&mut self) {
        if self.triggered {
            return;
        }
        match self.rx.as_mut() {
            Some(rx) => {
                // A closed sender counts as shutdown, lag means a signal was sent
                let _ = rx.recv().await;
                self.triggered = true;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Non-blocking check
    pub fn is_triggered(&mut self) -> bool {
        if self.triggered {
            return true;
        }
        if let Some(rx) = self.rx.as_mut() {
            match rx.try_recv() {
                Ok(())
                | Err(broadcast::error::TryRecvError::Closed)
                | Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    self.triggered = true;
                }
                Err(broadcast::error::TryRecvError::Empty) => {}
            }
        }
        self.triggered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_signal_is_observed() {
        let (tx, _) = broadcast::channel(1);
        let mut shutdown = Shutdown::new(&tx);

        assert!(!shutdown.is_triggered());
        tx.send(()).unwrap();
        assert!(shutdown.is_triggered());
        // Latched
        shutdown.recv().await;
    }

    #[tokio::test]
    async fn test_dropped_sender_counts_as_shutdown() {
        let (tx, _) = broadcast::channel::<()>(1);
        let mut shutdown = Shutdown::new(&tx);
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), shutdown.recv())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_none_never_fires() {
        let mut shutdown = Shutdown::none();
        assert!(!shutdown.is_triggered());
        let waited = tokio::time::timeout(Duration::from_millis(20), shutdown.recv()).await;
        assert!(waited.is_err());
    }
}
