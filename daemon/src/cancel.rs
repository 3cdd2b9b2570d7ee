use tokio_util::sync::CancellationToken;

/// Cooperative stop signal owned by one job.
///
/// Every admitted job gets a fresh signal, so a stop aimed at an earlier job
/// can never cancel the next one. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    token: CancellationToken,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent.
    pub fn raise(&self) {
        self.token.cancel();
    }

    pub fn observe(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the signal has been raised.
    pub async fn raised(&self) {
        self.token.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fresh_signal_is_lowered() {
        assert!(!CancelSignal::new().observe());
    }

    #[test]
    fn raise_is_idempotent_and_shared_by_clones() {
        let signal = CancelSignal::new();
        let observer = signal.clone();

        signal.raise();
        signal.raise();

        assert!(observer.observe());
        assert!(signal.observe());
    }

    #[test]
    fn signals_are_independent() {
        let first = CancelSignal::new();
        let second = CancelSignal::new();
        first.raise();
        assert!(!second.observe());
    }

    #[tokio::test]
    async fn raised_wakes_waiter() {
        let signal = CancelSignal::new();
        let waiter = signal.clone();
        let task = tokio::spawn(async move { waiter.raised().await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.raise();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter was not woken")
            .unwrap();
    }
}
