use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use log::{debug, info};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::executor::{do_map, do_reduce};
use crate::{DoTaskArgs, MapFn, Phase, ReduceFn};

/// Executes tasks handed out by a master. Transport-agnostic: see
/// [`lab`](crate::lab) and [`net`](crate::net) for the RPC front ends.
pub struct Worker {
    address: String,
    dir: PathBuf,
    map: MapFn,
    reduce: ReduceFn,
    master: Mutex<String>,
    ntasks: AtomicUsize,
    stopped: CancellationToken,
}

impl Worker {
    pub fn new(
        address: impl Into<String>,
        master: impl Into<String>,
        dir: impl Into<PathBuf>,
        map: MapFn,
        reduce: ReduceFn,
    ) -> Arc<Self> {
        Arc::new(Self {
            address: address.into(),
            dir: dir.into(),
            map,
            reduce,
            master: Mutex::new(master.into()),
            ntasks: AtomicUsize::new(0),
            stopped: CancellationToken::new(),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Address of the master this worker currently reports to.
    pub async fn master(&self) -> String {
        self.master.lock().await.clone()
    }

    pub async fn set_master(&self, master: String) {
        info!("{}: master is now {}", self.address, master);
        *self.master.lock().await = master;
    }

    /// Number of tasks completed so far.
    pub fn ntasks(&self) -> usize {
        self.ntasks.load(Ordering::SeqCst)
    }

    /// Run one task on a blocking thread.
    pub async fn do_task(self: &Arc<Self>, args: DoTaskArgs) -> Result<()> {
        debug!(
            "{}: {} task #{} of job {}",
            self.address, args.phase, args.task_number, args.job_name
        );
        let worker = self.clone();
        tokio::task::spawn_blocking(move || worker.execute(&args)).await??;
        self.ntasks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn execute(&self, args: &DoTaskArgs) -> Result<()> {
        match args.phase {
            Phase::Map => do_map(
                &self.dir,
                &args.job_name,
                args.task_number,
                &args.file,
                args.num_other_phase,
                self.map,
            ),
            Phase::Reduce => do_reduce(
                &self.dir,
                &args.job_name,
                args.task_number,
                args.num_other_phase,
                self.reduce,
            ),
            Phase::Merge => bail!("merge is done by the master"),
        }
    }

    /// Stop serving; returns the number of tasks processed.
    pub fn shutdown(&self) -> usize {
        let n = self.ntasks();
        info!("{}: shutdown after {} tasks", self.address, n);
        self.stopped.cancel();
        n
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Resolves once [`shutdown`](Self::shutdown) was called.
    pub async fn stopped(&self) {
        self.stopped.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::wc;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_tasks_are_counted() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.txt");
        fs::write(&input, "a b a").unwrap();
        let w = Worker::new("w1", "m", dir.path(), wc::map, wc::reduce);

        let mut args = DoTaskArgs {
            job_name: "wc".to_owned(),
            phase: Phase::Map,
            file: input.to_str().unwrap().to_owned(),
            task_number: 0,
            num_other_phase: 2,
        };
        w.do_task(args.clone()).await.unwrap();

        args.phase = Phase::Reduce;
        args.num_other_phase = 1;
        w.do_task(args.clone()).await.unwrap();

        args.phase = Phase::Merge;
        assert!(w.do_task(args).await.is_err());

        assert_eq!(w.ntasks(), 2);
        assert!(!w.is_stopped());
        assert_eq!(w.shutdown(), 2);
        w.stopped().await;
    }
}
