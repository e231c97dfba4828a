use tokio::sync::watch;

/// Cooperative stop signal. Once triggered it stays triggered, so listeners
/// created afterwards observe it immediately.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Resolves once shutdown is triggered. Never resolves if the signal is
    /// dropped without being triggered.
    pub async fn wait(mut self) {
        let triggered = self.rx.wait_for(|stopped| *stopped).await.is_ok();
        if !triggered {
            std::future::pending::<()>().await;
        }
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn late_listeners_see_an_earlier_trigger() {
        let shutdown = Shutdown::new();
        let early = shutdown.listener();
        shutdown.trigger();

        assert!(shutdown.is_triggered());
        assert!(early.is_triggered());
        shutdown.listener().wait().await;
        early.wait().await;
    }

    #[tokio::test]
    async fn dropped_signal_never_fires() {
        tokio::time::pause();

        let shutdown = Shutdown::new();
        let listener = shutdown.listener();
        drop(shutdown);

        let waited = tokio::time::timeout(Duration::from_secs(60), listener.wait()).await;
        assert!(waited.is_err());
    }
}
