//! The master's mutable job state.
//!
//! Phase, outstanding tasks, the worker list and both logs sit behind one lock.
//! Every durable write happens inside the same critical section as the
//! in-memory change it records, log first.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;

use anyhow::Result;
use log::{debug, info};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::log_store::{LogContents, TaskLog, WorkerLog};
use crate::{Job, Phase};

/// What recording a task completion did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Completion {
    /// Logged; `remaining` tasks of the phase are still outstanding.
    Recorded { remaining: usize },
    /// Logged, and it was the last outstanding task of the phase.
    PhaseDone,
    /// The task was already complete or belongs to another phase.
    Duplicate,
    /// The job is aborted; nothing was written.
    Aborted,
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    outstanding: BTreeSet<usize>,
    /// Every registration, in order, duplicates included.
    workers: Vec<String>,
    /// Addresses present in the worker log.
    logged_workers: HashSet<String>,
    task_log: TaskLog,
    worker_log: WorkerLog,
}

#[derive(Debug)]
pub(crate) struct MasterState {
    job: Job,
    abort: CancellationToken,
    inner: Mutex<Inner>,
}

impl MasterState {
    /// Fresh state at the start of the map phase. Nothing is written until the
    /// first phase change or recovery.
    pub fn new(job: Job, log_dir: &Path) -> Self {
        let outstanding = (0..job.ntasks(Phase::Map)).collect();
        Self {
            job,
            abort: CancellationToken::new(),
            inner: Mutex::new(Inner {
                phase: Phase::Map,
                outstanding,
                workers: Vec::new(),
                logged_workers: HashSet::new(),
                task_log: TaskLog::open(log_dir),
                worker_log: WorkerLog::open(log_dir),
            }),
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub fn abort(&self) {
        if !self.abort.is_cancelled() {
            info!("job {} aborted", self.job.name);
        }
        self.abort.cancel();
    }

    pub async fn phase(&self) -> Phase {
        self.inner.lock().await.phase
    }

    /// Outstanding indices of the current phase, ascending.
    pub async fn outstanding(&self) -> (Phase, Vec<usize>) {
        let inner = self.inner.lock().await;
        (inner.phase, inner.outstanding.iter().copied().collect())
    }

    /// Move to `phase`: rewrite the task log header and mark every task of the
    /// phase outstanding. Returns `false` without doing anything once aborted.
    pub async fn enter_phase(&self, phase: Phase) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if self.is_aborted() {
            return Ok(false);
        }
        inner.task_log.start_phase(&self.job.name, phase)?;
        inner.phase = phase;
        inner.outstanding = (0..self.job.ntasks(phase)).collect();
        debug!("job {} entered {} phase", self.job.name, phase);
        Ok(true)
    }

    /// Continue a recorded phase in which `completed` tasks already finished.
    pub async fn resume(&self, phase: Phase, completed: &BTreeSet<usize>) {
        let mut inner = self.inner.lock().await;
        inner.phase = phase;
        inner.outstanding = (0..self.job.ntasks(phase))
            .filter(|i| !completed.contains(i))
            .collect();
    }

    /// Durably record that task `index` of `phase` finished.
    pub async fn complete(&self, phase: Phase, index: usize) -> Result<Completion> {
        let mut inner = self.inner.lock().await;
        if self.is_aborted() {
            return Ok(Completion::Aborted);
        }
        if inner.phase != phase || !inner.outstanding.contains(&index) {
            return Ok(Completion::Duplicate);
        }
        inner.task_log.record(index)?;
        inner.outstanding.remove(&index);
        Ok(match inner.outstanding.len() {
            0 => Completion::PhaseDone,
            remaining => Completion::Recorded { remaining },
        })
    }

    /// Remember a registered worker; log it unless it is already logged.
    pub async fn add_worker(&self, worker: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.workers.push(worker.to_owned());
        if self.is_aborted() || inner.logged_workers.contains(worker) {
            return Ok(());
        }
        inner.worker_log.record(worker)?;
        inner.logged_workers.insert(worker.to_owned());
        Ok(())
    }

    /// Every registration so far, duplicates included.
    pub async fn workers(&self) -> Vec<String> {
        self.inner.lock().await.workers.clone()
    }

    pub async fn read_task_log(&self) -> Result<Option<LogContents>> {
        self.inner.lock().await.task_log.read()
    }

    pub async fn read_worker_log(&self) -> Result<Option<LogContents>> {
        self.inner.lock().await.worker_log.read()
    }

    /// Rewrite the worker log as the job header followed by `workers` and then
    /// anyone who registered in the meantime, each address once.
    pub async fn reset_worker_log(&self, workers: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if self.is_aborted() {
            return Ok(());
        }
        let mut logged = HashSet::new();
        let all: Vec<String> = workers
            .iter()
            .chain(inner.workers.iter())
            .filter(|w| logged.insert(w.to_string()))
            .cloned()
            .collect();
        inner.worker_log.reset(&self.job.name, &all)?;
        inner.logged_workers = logged;
        Ok(())
    }

    /// Drop both logs once the job is done. Kept when aborted so a restart can
    /// resume; returns whether they were deleted.
    pub async fn delete_logs(&self) -> Result<bool> {
        let inner = self.inner.lock().await;
        if self.is_aborted() {
            return Ok(false);
        }
        inner.task_log.delete()?;
        inner.worker_log.delete()?;
        Ok(true)
    }
}
