use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Result};
use log::{debug, info, warn};

use crate::pool::IdlePool;
use crate::state::MasterState;
use crate::transport::WorkerTransport;

/// Registered workers and the pool of the idle ones.
#[derive(Debug, Clone)]
pub(crate) struct WorkerRegistry {
    state: Arc<MasterState>,
    pool: IdlePool,
}

impl WorkerRegistry {
    pub fn new(state: Arc<MasterState>) -> Self {
        Self {
            state,
            pool: IdlePool::new(),
        }
    }

    pub fn pool(&self) -> &IdlePool {
        &self.pool
    }

    /// Record `worker` and hand it to the scheduler as idle.
    pub async fn register(&self, worker: String) -> Result<()> {
        ensure!(
            !worker.is_empty() && !worker.contains('\n'),
            "invalid worker address {:?}",
            worker
        );
        debug!("register: worker {}", worker);
        self.state.add_worker(&worker).await?;
        self.pool.put(worker);
        Ok(())
    }

    /// Send Shutdown to every registered worker once and collect how many tasks
    /// each processed. Unreachable workers are skipped.
    pub async fn shutdown_workers(
        &self,
        transport: &dyn WorkerTransport,
        timeout: Duration,
    ) -> Vec<usize> {
        let mut ntasks = Vec::new();
        for worker in self.state.workers().await {
            debug!("shutdown worker {}", worker);
            match tokio::time::timeout(timeout, transport.shutdown(&worker)).await {
                Ok(Ok(n)) => ntasks.push(n),
                Ok(Err(e)) => warn!("shutdown {} failed: {:#}", worker, e),
                Err(_) => warn!("shutdown {} timed out", worker),
            }
        }
        info!("shut down {} workers", ntasks.len());
        ntasks
    }
}

/// Registration entry point of a master, served over RPC.
#[derive(Debug, Clone)]
pub struct MasterEndpoint {
    registry: WorkerRegistry,
}

impl MasterEndpoint {
    pub(crate) fn new(registry: WorkerRegistry) -> Self {
        Self { registry }
    }

    pub async fn register_worker(&self, worker: String) -> Result<()> {
        self.registry.register(worker).await
    }
}
