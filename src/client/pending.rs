use tokio::sync::oneshot;

/// Outcome delivered to waiters of a shared in-flight operation.
///
/// Carried as a plain message string so it can be fanned out to any number
/// of waiters; callers wrap it back into the appropriate error variant.
pub(super) type AckResult = std::result::Result<(), String>;

/// Waiters parked on a single shared in-flight operation.
///
/// Used for the pending connection attempt and for the first protocol-level
/// subscribe of a topic: every caller that arrives while the operation is
/// in flight registers here, and all are released together when it
/// completes.
pub(super) struct WaiterSet {
    // ---
    waiters: Vec<oneshot::Sender<AckResult>>,
}

impl WaiterSet {
    // ---

    /// Create an empty waiter set.
    pub fn new() -> Self {
        // ---
        Self {
            waiters: Vec::new(),
        }
    }

    /// Register a new waiter.
    ///
    /// Returns a receiver that resolves when the operation completes.
    pub fn register(&mut self) -> oneshot::Receiver<AckResult> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.waiters.push(tx);
        rx
    }

    /// Release every waiter with the given outcome, consuming the set.
    ///
    /// Waiters that gave up (dropped their receiver) are skipped.
    pub fn resolve(self, outcome: AckResult) {
        // ---
        for tx in self.waiters {
            let _ = tx.send(outcome.clone());
        }
    }

    /// Number of registered waiters.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        // ---
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn all_waiters_released_with_same_outcome() {
        // ---
        let mut waiters = WaiterSet::new();
        let rx1 = waiters.register();
        let rx2 = waiters.register();
        assert_eq!(waiters.len(), 2);

        waiters.resolve(Ok(()));

        assert_eq!(rx1.await.unwrap(), Ok(()));
        assert_eq!(rx2.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn failure_is_fanned_out_to_every_waiter() {
        // ---
        let mut waiters = WaiterSet::new();
        let rx1 = waiters.register();
        let rx2 = waiters.register();

        waiters.resolve(Err("broker refused".into()));

        assert_eq!(rx1.await.unwrap(), Err("broker refused".to_owned()));
        assert_eq!(rx2.await.unwrap(), Err("broker refused".to_owned()));
    }

    #[tokio::test]
    async fn dropped_waiter_does_not_block_the_rest() {
        // ---
        let mut waiters = WaiterSet::new();
        let rx1 = waiters.register();
        drop(waiters.register());

        waiters.resolve(Ok(()));

        assert_eq!(rx1.await.unwrap(), Ok(()));
    }
}
