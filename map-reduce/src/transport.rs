use anyhow::Result;
use async_trait::async_trait;

use crate::DoTaskArgs;

/// The calls a master makes on workers, addressed by worker address.
///
/// An `Err` means the call did not succeed for whatever reason (worker down,
/// network gone, task failed); the caller decides whether to retry elsewhere.
#[async_trait]
pub trait WorkerTransport: Send + Sync + 'static {
    async fn do_task(&self, worker: &str, args: DoTaskArgs) -> Result<()>;

    /// Stop the worker; returns how many tasks it processed.
    async fn shutdown(&self, worker: &str) -> Result<usize>;

    /// Tell the worker to register with the master at `master`.
    async fn re_register(&self, worker: &str, master: &str) -> Result<()>;
}
