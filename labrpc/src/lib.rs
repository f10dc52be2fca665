//! In-process RPC network used to run masters and workers inside one process.
//!
//! Services are declared with [`service!`], registered on a [`Network`] under a
//! node id, and reached through generated clients. The network can cut nodes off
//! or drop requests at random to exercise failure handling.

pub mod client;
mod macros;
pub mod network;
pub mod server;

pub use anyhow;
pub use async_trait::async_trait;
pub use futures;
pub use log;
pub use serde;
pub use serde_json;
pub use tokio;

pub use network::{Network, NetworkHandle};
