use std::sync::Arc;

use tokio::sync::watch;

/// One-shot event. Only the first [`fire`](Latch::fire) has an effect; every
/// waiter, early or late, is released once it has happened.
#[derive(Debug, Clone)]
pub(crate) struct Latch {
    tx: Arc<watch::Sender<bool>>,
}

impl Latch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Returns `true` for the call that actually fired the latch.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|fired| !std::mem::replace(fired, true))
    }

    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}
