use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Result};

use crate::Phase;

/// File name of the task log inside [`MasterConfig::log_dir`].
pub const TASK_LOG: &str = "master_task_log.log";

/// File name of the worker log inside [`MasterConfig::log_dir`].
pub const WORKER_LOG: &str = "master_worker_log.log";

/// Timeout used for communication with workers unless configured otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A MapReduce job: one map task per input file, `n_reduce` reduce tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub name: String,
    pub files: Vec<String>,
    pub n_reduce: usize,
}

impl Job {
    pub fn new(name: impl Into<String>, files: Vec<String>, n_reduce: usize) -> Self {
        Self {
            name: name.into(),
            files,
            n_reduce,
        }
    }

    /// Job names and file names end up as single lines in the logs.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.name.is_empty(), "job name must not be empty");
        ensure!(
            !self.name.contains('\n'),
            "job name must fit on one line: {:?}",
            self.name
        );
        ensure!(self.n_reduce > 0, "--nreduce should be non-zero");
        ensure!(!self.files.is_empty(), "input no file");
        Ok(())
    }

    /// Number of tasks in `phase`.
    pub fn ntasks(&self, phase: Phase) -> usize {
        match phase {
            Phase::Map => self.files.len(),
            Phase::Reduce => self.n_reduce,
            Phase::Merge => 0,
        }
    }

    /// Task count of the phase a task of `phase` has to cooperate with.
    pub fn num_other_phase(&self, phase: Phase) -> usize {
        match phase {
            Phase::Map => self.n_reduce,
            Phase::Reduce => self.files.len(),
            Phase::Merge => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Address workers use to reach this master.
    pub address: String,
    /// Where the task log and the worker log live.
    pub log_dir: PathBuf,
    /// Shared directory holding intermediate, reduce and merged outputs.
    pub work_dir: PathBuf,
    /// Upper bound for a single task dispatch or re-registration call.
    pub dispatch_timeout: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            address: "master".to_owned(),
            log_dir: PathBuf::from("."),
            work_dir: PathBuf::from("."),
            dispatch_timeout: DEFAULT_TIMEOUT,
        }
    }
}
