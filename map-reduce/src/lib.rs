//! MapReduce master that schedules map and reduce tasks on remote workers.
//!
//! Worker crashes are handled by re-dispatching the task to another idle worker.
//! Master crashes are handled by a task log and a worker log: a restarted master
//! resumes the recorded phase and asks previously known workers to register
//! again.

use std::{fmt, str::FromStr};

use anyhow::{anyhow, Error};
use serde::{Deserialize, Serialize};

pub mod app;
pub mod config;
pub mod executor;
pub mod lab;
pub mod log_store;
pub mod net;
pub mod transport;

mod latch;
mod master;
mod pool;
mod recovery;
mod registry;
mod scheduler;
mod state;
mod worker;

#[cfg(test)]
mod testutil;

pub use config::{Job, MasterConfig};
pub use master::{JobStatus, Master};
pub use registry::MasterEndpoint;
pub use transport::WorkerTransport;
pub use worker::Worker;

labrpc::service! {
    service master_svc {
        fn register(worker: String) -> ();
    }
}

labrpc::service! {
    service worker_svc {
        fn do_task(args: DoTaskArgs) -> ();
        fn shutdown() -> usize;
        fn re_register(master: String) -> ();
    }
}

pub use master_svc::{Client as MasterClient, Server as MasterServer, Service as MasterService};
pub use worker_svc::{Client as WorkerClient, Server as WorkerServer, Service as WorkerService};

/// User map function: `(file name, contents) -> pairs`.
pub type MapFn = fn(&str, &str) -> Vec<KeyValue>;

/// User reduce function: `(key, all values of key) -> value`.
pub type ReduceFn = fn(&str, &[String]) -> String;

/// Stage of a job that owns an indexed set of tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Map,
    Reduce,
    Merge,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Map => "Map",
            Phase::Reduce => "Reduce",
            Phase::Merge => "Merge",
        };
        f.write_str(name)
    }
}

impl FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Map" => Ok(Phase::Map),
            "Reduce" => Ok(Phase::Reduce),
            "Merge" => Ok(Phase::Merge),
            _ => Err(anyhow!("unknown phase {:?}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Everything a worker needs to run one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoTaskArgs {
    pub job_name: String,
    pub phase: Phase,
    /// Input file, only meaningful for map tasks.
    pub file: String,
    pub task_number: usize,
    /// Task count of the other phase: partitions to write for a mapper, map
    /// outputs to collect for a reducer.
    pub num_other_phase: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names() {
        for phase in [Phase::Map, Phase::Reduce, Phase::Merge] {
            assert_eq!(phase.to_string().parse::<Phase>().unwrap(), phase);
        }
        assert!("mapPhase".parse::<Phase>().is_err());
        assert!("".parse::<Phase>().is_err());
    }
}
