use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use futures::Future;
use log::{info, trace, warn};
use rand::Rng;
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::{client::Client, server::Server};

/// Probability that an unreliable network drops a request.
const DROP_RATE: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct NetworkPackage {
    pub to: String,
    pub reply: Sender<String>,
    pub data: String,
}

/// Cloneable control side of a [`Network`]: builds clients and decides which
/// nodes are reachable. Stays usable after the network itself has been moved
/// into its routing task.
#[derive(Clone)]
pub struct NetworkHandle {
    tx: Sender<NetworkPackage>,
    nodes: Arc<Mutex<HashMap<String, Sender<NetworkPackage>>>>,
    disconnected: Arc<Mutex<HashSet<String>>>,
    reliable: Arc<AtomicBool>,
}

impl NetworkHandle {
    /// Client of any type for the node registered as `id`. The node does not
    /// have to exist yet; requests to unknown nodes fail.
    pub fn client<C: Client>(&self, id: impl Into<String>) -> C {
        C::from_server(id.into(), self.tx.clone())
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.nodes.lock().unwrap().contains_key(id)
    }

    /// Requests addressed to `id` are dropped until [`connect`](Self::connect).
    pub fn disconnect(&self, id: &str) {
        info!("disconnect {}", id);
        self.disconnected.lock().unwrap().insert(id.to_owned());
    }

    pub fn connect(&self, id: &str) {
        info!("connect {}", id);
        self.disconnected.lock().unwrap().remove(id);
    }

    /// An unreliable network drops a fraction of all requests.
    ///
    /// A dropped request fails the call like a crashed node would, so a
    /// master stops handing tasks to a worker whose request was lost.
    pub fn set_reliable(&self, reliable: bool) {
        self.reliable.store(reliable, Ordering::SeqCst);
    }

    /// Register a node named `id` served by the service built from `f`.
    ///
    /// The node is reachable as soon as this returns. The returned future runs
    /// the server and rebuilds it from `f` whenever it breaks.
    pub fn register_service<S, C, F, V>(&self, id: String, f: F) -> (C, impl Future<Output = ()>)
    where
        F: Fn() -> V + Send + 'static,
        S: Server<Service = V> + Send + 'static,
        C: Client,
    {
        let client = C::from_server(id.clone(), self.tx.clone());
        let nodes = self.nodes.clone();
        let mut server = S::from_service(f());
        nodes
            .lock()
            .unwrap()
            .insert(id.clone(), server.client_chan());
        (client, async move {
            loop {
                if server.run().await.is_ok() {
                    break;
                }
                info!("server {} restart", id);
                server = S::from_service(f());
                nodes
                    .lock()
                    .unwrap()
                    .insert(id.clone(), server.client_chan());
            }
        })
    }

    fn route(&self, to: &str) -> Option<Sender<NetworkPackage>> {
        if self.disconnected.lock().unwrap().contains(to) {
            trace!("{} is disconnected", to);
            return None;
        }
        if !self.reliable.load(Ordering::SeqCst) && rand::thread_rng().gen_bool(DROP_RATE) {
            trace!("dropped request to {}", to);
            return None;
        }
        self.nodes.lock().unwrap().get(to).cloned()
    }
}

pub struct Network {
    handle: NetworkHandle,
    rx: Receiver<NetworkPackage>,
}

impl Default for Network {
    fn default() -> Self {
        Self::new()
    }
}

impl Network {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(100);
        Self {
            handle: NetworkHandle {
                tx,
                nodes: Arc::new(Mutex::new(HashMap::default())),
                disconnected: Arc::new(Mutex::new(HashSet::default())),
                reliable: Arc::new(AtomicBool::new(true)),
            },
            rx,
        }
    }

    pub fn handle(&self) -> NetworkHandle {
        self.handle.clone()
    }

    /// See [`NetworkHandle::register_service`].
    pub fn register_service<S, C, F, V>(&self, id: String, f: F) -> (C, impl Future<Output = ()>)
    where
        F: Fn() -> V + Send + 'static,
        S: Server<Service = V> + Send + 'static,
        C: Client,
    {
        self.handle.register_service::<S, C, F, V>(id, f)
    }

    /// Route packages to their nodes until every sender is gone.
    pub async fn run(&mut self) {
        while let Some(p) = self.rx.recv().await {
            match self.handle.route(&p.to) {
                // Forward on a separate task so one busy node cannot stall the network.
                Some(node) => {
                    tokio::spawn(async move {
                        if node.send(p).await.is_err() {
                            warn!("send to node failed, dropped");
                        }
                    });
                }
                None => warn!("node {} unreachable, dropped", p.to),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};

    crate::service! {
        service echo_svc {
            fn echo(msg: String) -> String;
            fn fail() -> ();
        }
    }

    struct Echo;

    #[crate::async_trait]
    impl echo_svc::Service for Echo {
        async fn echo(&mut self, msg: String) -> Result<String> {
            Ok(msg)
        }
        async fn fail(&mut self) -> Result<()> {
            bail!("refused")
        }
    }

    fn spawn_echo() -> NetworkHandle {
        let mut net = Network::new();
        let (_, server) = net
            .register_service::<echo_svc::Server<Echo>, echo_svc::Client, _, _>(
                "echo".to_owned(),
                || Echo,
            );
        tokio::spawn(server);
        let handle = net.handle();
        tokio::spawn(async move { net.run().await });
        handle
    }

    #[tokio::test]
    async fn test_call_and_service_error() {
        let net = spawn_echo();
        let c: echo_svc::Client = net.client("echo");
        assert_eq!(c.echo("hi".to_owned()).await.unwrap(), "hi");

        let err = c.fail().await.unwrap_err();
        assert!(err.to_string().contains("refused"));

        // The server survives a service error.
        assert_eq!(c.echo("again".to_owned()).await.unwrap(), "again");
    }

    #[tokio::test]
    async fn test_disconnect_and_unknown_node() {
        let net = spawn_echo();
        let c: echo_svc::Client = net.client("echo");

        net.disconnect("echo");
        assert!(c.echo("lost".to_owned()).await.is_err());
        net.connect("echo");
        assert!(c.echo("back".to_owned()).await.is_ok());

        let nobody: echo_svc::Client = net.client("nobody");
        assert!(nobody.echo("x".to_owned()).await.is_err());
        assert!(!net.is_registered("nobody"));
    }

    #[tokio::test]
    async fn test_unreliable_drops_some() {
        let net = spawn_echo();
        net.set_reliable(false);
        let c: echo_svc::Client = net.client("echo");
        let mut failed = 0;
        for i in 0..200 {
            if c.echo(i.to_string()).await.is_err() {
                failed += 1;
            }
        }
        assert!(failed > 0 && failed < 200);
    }
}
