use tokio::sync::mpsc::Sender;

use crate::network::NetworkPackage;

/// Generated clients are built from the id of the node they talk to and the
/// network's inbound channel.
pub trait Client {
    fn from_server(server_id: String, net_tx: Sender<NetworkPackage>) -> Self;
}
