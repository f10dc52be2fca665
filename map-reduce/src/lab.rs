//! Master and workers on the simulated [`labrpc`] network.
//!
//! Node ids on the network double as master and worker addresses.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::Future;
use labrpc::NetworkHandle;
use log::info;

use crate::registry::MasterEndpoint;
use crate::transport::WorkerTransport;
use crate::{
    DoTaskArgs, Master, MasterClient, MasterServer, MasterService, Worker, WorkerClient,
    WorkerServer, WorkerService,
};

/// Reaches workers through the network.
#[derive(Clone)]
pub struct LabTransport {
    net: NetworkHandle,
}

impl LabTransport {
    pub fn new(net: NetworkHandle) -> Self {
        Self { net }
    }
}

#[async_trait]
impl WorkerTransport for LabTransport {
    async fn do_task(&self, worker: &str, args: DoTaskArgs) -> Result<()> {
        self.net.client::<WorkerClient>(worker).do_task(args).await
    }

    async fn shutdown(&self, worker: &str) -> Result<usize> {
        self.net.client::<WorkerClient>(worker).shutdown().await
    }

    async fn re_register(&self, worker: &str, master: &str) -> Result<()> {
        self.net
            .client::<WorkerClient>(worker)
            .re_register(master.to_owned())
            .await
    }
}

#[async_trait]
impl MasterService for MasterEndpoint {
    async fn register(&mut self, worker: String) -> Result<()> {
        self.register_worker(worker).await
    }
}

/// A [`Worker`] served on the network.
#[derive(Clone)]
pub struct LabWorker {
    worker: Arc<Worker>,
    net: NetworkHandle,
}

#[async_trait]
impl WorkerService for LabWorker {
    async fn do_task(&mut self, args: DoTaskArgs) -> Result<()> {
        self.worker.do_task(args).await
    }

    async fn shutdown(&mut self) -> Result<usize> {
        Ok(self.worker.shutdown())
    }

    async fn re_register(&mut self, master: String) -> Result<()> {
        self.worker.set_master(master).await;
        join(&self.worker, &self.net).await
    }
}

/// Put the registration endpoint of `master` on the network under the
/// master's address. The returned future serves it.
pub fn serve_master(net: &NetworkHandle, master: &Master) -> impl Future<Output = ()> {
    let endpoint = master.endpoint();
    let (_, server) = net.register_service::<MasterServer<MasterEndpoint>, MasterClient, _, _>(
        master.address().to_owned(),
        move || endpoint.clone(),
    );
    server
}

/// Put `worker` on the network under its address. The returned future serves
/// it until the worker is shut down.
pub fn serve_worker(net: &NetworkHandle, worker: Arc<Worker>) -> impl Future<Output = ()> {
    let svc = LabWorker {
        worker: worker.clone(),
        net: net.clone(),
    };
    let (_, server) = net.register_service::<WorkerServer<LabWorker>, WorkerClient, _, _>(
        worker.address().to_owned(),
        move || svc.clone(),
    );
    async move {
        tokio::select! {
            _ = server => {}
            _ = worker.stopped() => info!("{} stopped serving", worker.address()),
        }
    }
}

/// Register `worker` with the master it currently reports to.
pub async fn join(worker: &Worker, net: &NetworkHandle) -> Result<()> {
    let master = worker.master().await;
    info!("{}: registering with {}", worker.address(), master);
    net.client::<MasterClient>(master)
        .register(worker.address().to_owned())
        .await
}
