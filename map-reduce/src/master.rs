use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Result};
use log::{error, info, trace};
use tokio::sync::watch;

use crate::executor;
use crate::recovery::{recover, Recovery};
use crate::registry::{MasterEndpoint, WorkerRegistry};
use crate::scheduler::{Distributed, Outcome, Schedule, Sequential};
use crate::state::MasterState;
use crate::transport::WorkerTransport;
use crate::{Job, MapFn, MasterConfig, Phase, ReduceFn};

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Merged result written, workers shut down, logs deleted.
    Done,
    /// Stopped by [`Master::abort`]; the logs are left for a later restart.
    Aborted,
    /// Gave up on an unrecoverable error such as an unwritable log.
    Failed(String),
}

enum Mode {
    Distributed(Arc<dyn WorkerTransport>),
    Sequential { map: MapFn, reduce: ReduceFn },
}

/// Coordinates one job.
///
/// A distributed master hands tasks to registered workers and survives both
/// worker and master crashes; a sequential master runs every task itself.
pub struct Master {
    config: MasterConfig,
    state: Arc<MasterState>,
    registry: WorkerRegistry,
    mode: Mode,
    status: watch::Sender<Option<JobStatus>>,
    stats: Mutex<Vec<usize>>,
    started: AtomicBool,
}

impl Master {
    fn new(config: MasterConfig, job: Job, mode: Mode) -> Result<Arc<Self>> {
        job.validate()?;
        let state = Arc::new(MasterState::new(job, &config.log_dir));
        let (status, _) = watch::channel(None);
        Ok(Arc::new(Self {
            registry: WorkerRegistry::new(state.clone()),
            config,
            state,
            mode,
            status,
            stats: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }))
    }

    /// A master that dispatches tasks through `transport`. Expose
    /// [`endpoint`](Self::endpoint) to workers, then [`start`](Self::start).
    pub fn distributed(
        config: MasterConfig,
        job: Job,
        transport: Arc<dyn WorkerTransport>,
    ) -> Result<Arc<Self>> {
        Self::new(config, job, Mode::Distributed(transport))
    }

    /// A master running every task in-process, one after another. Already
    /// started.
    pub fn sequential(
        config: MasterConfig,
        job: Job,
        map: MapFn,
        reduce: ReduceFn,
    ) -> Result<Arc<Self>> {
        let master = Self::new(config, job, Mode::Sequential { map, reduce })?;
        master.start();
        Ok(master)
    }

    /// Run the job in the background. Only the first call has an effect.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let master = self.clone();
        tokio::spawn(async move {
            let status = match master.run().await {
                Ok(status) => status,
                Err(e) => {
                    error!("job {} failed: {:#}", master.job().name, e);
                    JobStatus::Failed(format!("{:#}", e))
                }
            };
            master.status.send_replace(Some(status));
        });
    }

    pub fn job(&self) -> &Job {
        self.state.job()
    }

    pub fn address(&self) -> &str {
        &self.config.address
    }

    /// Registration entry point to serve to workers.
    pub fn endpoint(&self) -> MasterEndpoint {
        MasterEndpoint::new(self.registry.clone())
    }

    /// Add a worker and make it available for tasks.
    pub async fn register(&self, worker: String) -> Result<()> {
        self.registry.register(worker).await
    }

    /// Stop the job as soon as possible, leaving the logs as they are.
    pub fn abort(&self) {
        self.state.abort();
    }

    pub async fn phase(&self) -> Phase {
        self.state.phase().await
    }

    /// Block until the job is done, aborted or failed.
    pub async fn wait(&self) -> JobStatus {
        let mut rx = self.status.subscribe();
        let status = match rx.wait_for(Option::is_some).await {
            Ok(status) => status.clone().unwrap_or(JobStatus::Aborted),
            Err(_) => JobStatus::Aborted,
        };
        status
    }

    /// Tasks processed per worker, as reported at shutdown. A sequential
    /// master reports itself as a single worker.
    pub fn stats(&self) -> Vec<usize> {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Result file of a finished job.
    pub fn result_path(&self) -> PathBuf {
        executor::result_path(&self.config.work_dir, &self.job().name)
    }

    fn scheduler(&self) -> Box<dyn Schedule> {
        match &self.mode {
            Mode::Distributed(transport) => Box::new(Distributed::new(
                self.state.clone(),
                self.registry.pool().clone(),
                transport.clone(),
                self.config.dispatch_timeout,
            )),
            Mode::Sequential { map, reduce } => Box::new(Sequential::new(
                self.state.clone(),
                self.config.work_dir.clone(),
                *map,
                *reduce,
            )),
        }
    }

    async fn run(&self) -> Result<JobStatus> {
        let started = Instant::now();
        let job = self.job();
        if self.state.is_aborted() {
            return Ok(JobStatus::Aborted);
        }

        let transport = match &self.mode {
            Mode::Distributed(t) => Some(&**t),
            Mode::Sequential { .. } => None,
        };
        match recover(
            &self.state,
            transport,
            &self.config.address,
            self.config.dispatch_timeout,
        )
        .await?
        {
            Recovery::Cold => info!("{}: starting job {}", self.config.address, job.name),
            Recovery::Resumed {
                phase,
                completed,
                workers,
            } => info!(
                "{}: job {} resumed in {} phase with {} tasks complete, {} known workers",
                self.config.address,
                job.name,
                phase,
                completed,
                workers.len()
            ),
        }

        let scheduler = self.scheduler();
        loop {
            let phase = self.state.phase().await;
            let next = match phase {
                Phase::Map => Phase::Reduce,
                Phase::Reduce => Phase::Merge,
                Phase::Merge => break,
            };
            if scheduler.schedule(phase).await? == Outcome::Aborted {
                return Ok(JobStatus::Aborted);
            }
            if !self.state.enter_phase(next).await? {
                return Ok(JobStatus::Aborted);
            }
        }
        if self.state.is_aborted() {
            return Ok(JobStatus::Aborted);
        }

        let (dir, name, n_reduce) = (self.config.work_dir.clone(), job.name.clone(), job.n_reduce);
        let result =
            tokio::task::spawn_blocking(move || executor::merge(&dir, &name, n_reduce)).await??;
        info!("merged into {}", result.display());
        if self.state.is_aborted() {
            return Ok(JobStatus::Aborted);
        }

        let stats = match &self.mode {
            Mode::Distributed(transport) => {
                self.registry
                    .shutdown_workers(&**transport, self.config.dispatch_timeout)
                    .await
            }
            Mode::Sequential { .. } => vec![scheduler.local_tasks().unwrap_or(0)],
        };
        trace!("stats {:?}", stats);
        *self
            .stats
            .lock()
            .map_err(|_| anyhow!("stats lock poisoned"))? = stats;

        if !self.state.delete_logs().await? {
            return Ok(JobStatus::Aborted);
        }
        info!(
            "{}: job {} done in {:?}",
            self.config.address,
            job.name,
            started.elapsed()
        );
        Ok(JobStatus::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::wc;
    use crate::config::{TASK_LOG, WORKER_LOG};
    use crate::testutil::FakeTransport;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn config(dir: &TempDir) -> MasterConfig {
        MasterConfig {
            log_dir: dir.path().to_owned(),
            work_dir: dir.path().to_owned(),
            ..MasterConfig::default()
        }
    }

    fn inputs(dir: &TempDir) -> Vec<String> {
        ["one two", "two three three"]
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let p = dir.path().join(format!("in-{}.txt", i));
                fs::write(&p, text).unwrap();
                p.to_str().unwrap().to_owned()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_sequential() {
        let dir = TempDir::new().unwrap();
        let job = Job::new("seq", inputs(&dir), 2);
        let m = Master::sequential(config(&dir), job, wc::map, wc::reduce).unwrap();
        assert_eq!(timeout(TIMEOUT, m.wait()).await.unwrap(), JobStatus::Done);
        assert_eq!(m.stats(), vec![4]);
        assert_eq!(
            fs::read_to_string(m.result_path()).unwrap(),
            "one 1\nthree 2\ntwo 2\n"
        );
        assert!(!dir.path().join(TASK_LOG).exists());
        assert!(!dir.path().join(WORKER_LOG).exists());
    }

    #[tokio::test]
    async fn test_invalid_job() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::new());
        assert!(Master::distributed(config(&dir), Job::new("wc", vec![], 1), transport).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_distributed_with_fake_workers() {
        let dir = TempDir::new().unwrap();
        // The fake workers do not write anything, so prepare the reduce outputs
        // the merge expects.
        for r in 0..2 {
            fs::write(executor::reduce_output(dir.path(), "wc", r), "").unwrap();
        }
        let transport = FakeTransport::new();
        transport.set_processed("w1", 3);
        transport.set_processed("w2", 1);
        let job = Job::new("wc", inputs(&dir), 2);
        let m = Master::distributed(config(&dir), job, Arc::new(transport.clone())).unwrap();
        m.register("w1".to_owned()).await.unwrap();
        m.start();
        m.endpoint().register_worker("w2".to_owned()).await.unwrap();

        assert_eq!(timeout(TIMEOUT, m.wait()).await.unwrap(), JobStatus::Done);
        for (phase, n) in [(Phase::Map, 2), (Phase::Reduce, 2)] {
            for i in 0..n {
                assert_eq!(transport.successes(phase, i), 1);
            }
        }
        assert_eq!(m.stats(), vec![3, 1]);
        assert_eq!(transport.shutdowns(), vec!["w1", "w2"]);
        assert!(!dir.path().join(TASK_LOG).exists());
    }

    #[tokio::test]
    async fn test_sequential_resumed_counts_remaining_tasks() {
        let dir = TempDir::new().unwrap();
        let d = dir.path();
        let files = inputs(&dir);
        for (i, f) in files.iter().enumerate() {
            executor::do_map(d, "seq", i, f, 2, wc::map).unwrap();
        }
        executor::do_reduce(d, "seq", 0, files.len(), wc::reduce).unwrap();
        fs::write(d.join(TASK_LOG), "seq\nReduce\n0\n").unwrap();

        let m = Master::sequential(config(&dir), Job::new("seq", files, 2), wc::map, wc::reduce)
            .unwrap();
        assert_eq!(timeout(TIMEOUT, m.wait()).await.unwrap(), JobStatus::Done);
        assert_eq!(m.stats(), vec![1]);
        assert_eq!(
            fs::read_to_string(m.result_path()).unwrap(),
            "one 1\nthree 2\ntwo 2\n"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_abort_during_shutdown_is_not_done() {
        let dir = TempDir::new().unwrap();
        for r in 0..2 {
            fs::write(executor::reduce_output(dir.path(), "wc", r), "").unwrap();
        }
        let transport = FakeTransport::new();
        let job = Job::new("wc", inputs(&dir), 2);
        let m = Master::distributed(config(&dir), job, Arc::new(transport.clone())).unwrap();
        let weak = Arc::downgrade(&m);
        transport.on_shutdown(move || {
            if let Some(m) = weak.upgrade() {
                m.abort();
            }
        });
        m.register("w1".to_owned()).await.unwrap();
        m.start();

        assert_eq!(timeout(TIMEOUT, m.wait()).await.unwrap(), JobStatus::Aborted);
        assert_eq!(transport.shutdowns(), vec!["w1"]);
        assert!(dir.path().join(TASK_LOG).exists());
        assert!(dir.path().join(WORKER_LOG).exists());
    }

    #[tokio::test]
    async fn test_abort_before_any_worker() {
        let dir = TempDir::new().unwrap();
        let job = Job::new("wc", inputs(&dir), 2);
        let m = Master::distributed(config(&dir), job, Arc::new(FakeTransport::new())).unwrap();
        m.start();
        while !dir.path().join(WORKER_LOG).exists() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        m.abort();
        assert_eq!(timeout(TIMEOUT, m.wait()).await.unwrap(), JobStatus::Aborted);
        assert_eq!(m.phase().await, Phase::Map);
        assert_eq!(
            fs::read_to_string(dir.path().join(TASK_LOG)).unwrap(),
            "wc\nMap\n"
        );
        assert!(m.stats().is_empty());
    }

    #[tokio::test]
    async fn test_unwritable_log_fails() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.log_dir = dir.path().join("missing");
        let job = Job::new("wc", inputs(&dir), 2);
        let m = Master::distributed(cfg, job, Arc::new(FakeTransport::new())).unwrap();
        m.start();
        assert!(matches!(
            timeout(TIMEOUT, m.wait()).await.unwrap(),
            JobStatus::Failed(_)
        ));
    }
}
