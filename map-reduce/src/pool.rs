use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

/// Unbounded queue of idle worker addresses shared by any number of producers
/// and consumers. Takers wait in arrival order.
#[derive(Debug, Clone)]
pub(crate) struct IdlePool {
    tx: mpsc::UnboundedSender<String>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
}

impl IdlePool {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub fn put(&self, worker: String) {
        // The receiver is owned by the pool itself, so sending cannot fail.
        let _ = self.tx.send(worker);
    }

    /// Wait for an idle worker. `None` only if the pool is gone.
    pub async fn take(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_fifo() {
        let pool = IdlePool::new();
        pool.put("a".to_owned());
        pool.put("b".to_owned());
        assert_eq!(pool.take().await.unwrap(), "a");
        assert_eq!(pool.take().await.unwrap(), "b");
        assert!(timeout(Duration::from_millis(20), pool.take()).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_blocked_takers() {
        let pool = IdlePool::new();
        let mut takers = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            takers.push(tokio::spawn(async move { pool.take().await.unwrap() }));
        }
        for i in 0..8 {
            pool.put(format!("w{}", i));
        }
        let mut got = Vec::new();
        for t in takers {
            got.push(t.await.unwrap());
        }
        got.sort();
        assert_eq!(got, (0..8).map(|i| format!("w{}", i)).collect::<Vec<_>>());
    }
}
