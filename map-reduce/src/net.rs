//! Master and workers over TCP with tarpc, JSON encoded.
//!
//! Addresses are `host:port` strings.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{future, prelude::*};
use log::{info, trace};
use tarpc::{
    client, context,
    server::{self, Channel},
    tokio_serde::formats::Json,
};

use crate::registry::MasterEndpoint;
use crate::transport::WorkerTransport;
use crate::{config::DEFAULT_TIMEOUT, DoTaskArgs, Worker};

/// Concurrent connections served at once.
const MAX_CONNECTIONS: usize = 32;

/// How long a stopped worker keeps serving so in-flight replies get out.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[tarpc::service]
pub trait MasterRpc {
    async fn register(worker: String) -> Result<(), String>;
}

#[tarpc::service]
pub trait WorkerRpc {
    async fn do_task(args: DoTaskArgs) -> Result<(), String>;
    async fn shutdown() -> usize;
    async fn re_register(master: String) -> Result<(), String>;
}

#[derive(Clone)]
struct TcpMaster {
    endpoint: MasterEndpoint,
}

impl MasterRpc for TcpMaster {
    async fn register(self, _: context::Context, worker: String) -> Result<(), String> {
        self.endpoint
            .register_worker(worker)
            .await
            .map_err(|e| format!("{:#}", e))
    }
}

#[derive(Clone)]
struct TcpWorker {
    worker: Arc<Worker>,
}

impl WorkerRpc for TcpWorker {
    async fn do_task(self, _: context::Context, args: DoTaskArgs) -> Result<(), String> {
        self.worker
            .do_task(args)
            .await
            .map_err(|e| format!("{:#}", e))
    }

    async fn shutdown(self, _: context::Context) -> usize {
        self.worker.shutdown()
    }

    async fn re_register(self, _: context::Context, master: String) -> Result<(), String> {
        self.worker.set_master(master).await;
        join(&self.worker).await.map_err(|e| format!("{:#}", e))
    }
}

async fn spawn(fut: impl Future<Output = ()> + Send + 'static) {
    tokio::spawn(fut);
}

/// Context whose deadline leaves room for a call of up to `timeout`.
fn context_with(timeout: Duration) -> context::Context {
    let mut ctx = context::current();
    ctx.deadline += timeout;
    ctx
}

async fn master_client(addr: &str) -> Result<MasterRpcClient> {
    let transport = tarpc::serde_transport::tcp::connect(addr, Json::default)
        .await
        .with_context(|| format!("unable to connect to master {}", addr))?;
    Ok(MasterRpcClient::new(client::Config::default(), transport).spawn())
}

async fn worker_client(addr: &str) -> Result<WorkerRpcClient> {
    let transport = tarpc::serde_transport::tcp::connect(addr, Json::default)
        .await
        .with_context(|| format!("unable to connect to worker {}", addr))?;
    Ok(WorkerRpcClient::new(client::Config::default(), transport).spawn())
}

/// Reaches workers by connecting to their address for every call.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    timeout: Duration,
}

impl TcpTransport {
    /// `timeout` bounds a single task; it should match the master's dispatch
    /// timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

#[async_trait]
impl WorkerTransport for TcpTransport {
    async fn do_task(&self, worker: &str, args: DoTaskArgs) -> Result<()> {
        worker_client(worker)
            .await?
            .do_task(context_with(self.timeout), args)
            .await?
            .map_err(|e| anyhow!("{}: {}", worker, e))
    }

    async fn shutdown(&self, worker: &str) -> Result<usize> {
        Ok(worker_client(worker)
            .await?
            .shutdown(context::current())
            .await?)
    }

    async fn re_register(&self, worker: &str, master: &str) -> Result<()> {
        worker_client(worker)
            .await?
            .re_register(context_with(self.timeout), master.to_owned())
            .await?
            .map_err(|e| anyhow!("{}: {}", worker, e))
    }
}

/// Bind `addr` and return the future serving registrations for `endpoint`.
pub async fn serve_master(
    addr: String,
    endpoint: MasterEndpoint,
) -> Result<impl Future<Output = ()>> {
    let mut listener = tarpc::serde_transport::tcp::listen(&addr, Json::default)
        .await
        .with_context(|| format!("unable to listen on {}", addr))?;
    listener.config_mut().max_frame_length(usize::MAX);
    info!("master listening on {}", listener.local_addr());
    let server = TcpMaster { endpoint };
    Ok(listener
        // Ignore accept errors.
        .filter_map(|r| future::ready(r.ok()))
        .map(server::BaseChannel::with_defaults)
        .map(move |channel| channel.execute(server.clone().serve()).for_each(spawn))
        .buffer_unordered(MAX_CONNECTIONS)
        .for_each(|_| async {}))
}

/// Bind the worker's address and return the future serving it until it is
/// shut down.
pub async fn serve_worker(worker: Arc<Worker>) -> Result<impl Future<Output = ()>> {
    let addr = worker.address().to_owned();
    let mut listener = tarpc::serde_transport::tcp::listen(&addr, Json::default)
        .await
        .with_context(|| format!("unable to listen on {}", addr))?;
    listener.config_mut().max_frame_length(usize::MAX);
    info!("worker listening on {}", listener.local_addr());
    let server = TcpWorker {
        worker: worker.clone(),
    };
    let serving = listener
        .filter_map(|r| future::ready(r.ok()))
        .map(server::BaseChannel::with_defaults)
        .map(move |channel| channel.execute(server.clone().serve()).for_each(spawn))
        .buffer_unordered(MAX_CONNECTIONS)
        .for_each(|_| async {});
    Ok(async move {
        let stopped = async {
            worker.stopped().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        };
        tokio::select! {
            _ = serving => {}
            _ = stopped => trace!("{} stopped serving", worker.address()),
        }
    })
}

/// Register `worker` with the master it currently reports to.
pub async fn join(worker: &Worker) -> Result<()> {
    let master = worker.master().await;
    info!("{}: registering with {}", worker.address(), master);
    master_client(&master)
        .await?
        .register(context::current(), worker.address().to_owned())
        .await?
        .map_err(|e| anyhow!("{}: {}", master, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::wc;
    use crate::{Job, JobStatus, Master, MasterConfig};
    use std::fs;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn free_addr() -> String {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().to_string()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_job_over_tcp() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, "b a b").unwrap();

        let config = MasterConfig {
            address: free_addr(),
            log_dir: dir.path().to_owned(),
            work_dir: dir.path().to_owned(),
            ..MasterConfig::default()
        };
        let dispatch_timeout = config.dispatch_timeout;
        let job = Job::new("tcp", vec![input.to_str().unwrap().to_owned()], 2);
        let transport = Arc::new(TcpTransport::new(dispatch_timeout));
        let master = Master::distributed(config, job, transport).unwrap();
        tokio::spawn(
            serve_master(master.address().to_owned(), master.endpoint())
                .await
                .unwrap(),
        );
        master.start();

        let worker = Worker::new(free_addr(), master.address(), dir.path(), wc::map, wc::reduce);
        let serving = tokio::spawn(serve_worker(worker.clone()).await.unwrap());
        join(&worker).await.unwrap();

        assert_eq!(
            timeout(Duration::from_secs(30), master.wait()).await.unwrap(),
            JobStatus::Done
        );
        assert_eq!(master.stats(), vec![3]);
        assert_eq!(
            fs::read_to_string(master.result_path()).unwrap(),
            "a 1\nb 2\n"
        );
        timeout(Duration::from_secs(5), serving).await.unwrap().unwrap();
    }
}
