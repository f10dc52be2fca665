//! Runs every outstanding task of a phase to completion.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, info, trace, warn};
use tokio::task::JoinSet;

use crate::executor::{do_map, do_reduce};
use crate::latch::Latch;
use crate::pool::IdlePool;
use crate::state::{Completion, MasterState};
use crate::transport::WorkerTransport;
use crate::{DoTaskArgs, MapFn, Phase, ReduceFn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Every task of the phase is durably complete.
    Completed,
    Aborted,
}

#[async_trait]
pub(crate) trait Schedule: Send + Sync {
    /// Block until all outstanding tasks of `phase` are complete or the job is
    /// aborted.
    async fn schedule(&self, phase: Phase) -> Result<Outcome>;

    /// Tasks run in-process so far. `None` when workers run them.
    fn local_tasks(&self) -> Option<usize> {
        None
    }
}

fn task_args(state: &MasterState, phase: Phase, index: usize) -> DoTaskArgs {
    let job = state.job();
    DoTaskArgs {
        job_name: job.name.clone(),
        phase,
        file: match phase {
            Phase::Map => job.files[index].clone(),
            _ => String::new(),
        },
        task_number: index,
        num_other_phase: job.num_other_phase(phase),
    }
}

/// Hands tasks to idle workers over RPC.
pub(crate) struct Distributed {
    state: Arc<MasterState>,
    pool: IdlePool,
    transport: Arc<dyn WorkerTransport>,
    timeout: Duration,
}

impl Distributed {
    pub fn new(
        state: Arc<MasterState>,
        pool: IdlePool,
        transport: Arc<dyn WorkerTransport>,
        timeout: Duration,
    ) -> Self {
        Self {
            state,
            pool,
            transport,
            timeout,
        }
    }
}

#[async_trait]
impl Schedule for Distributed {
    async fn schedule(&self, phase: Phase) -> Result<Outcome> {
        let abort = self.state.abort_token().clone();
        if abort.is_cancelled() {
            return Ok(Outcome::Aborted);
        }
        let (current, pending) = self.state.outstanding().await;
        if current != phase {
            return Err(anyhow!("cannot schedule {} during {} phase", phase, current));
        }
        let ntasks = self.state.job().ntasks(phase);
        debug!(
            "schedule: {} {} tasks ({} I/Os), {} already complete",
            ntasks,
            phase,
            self.state.job().num_other_phase(phase),
            ntasks - pending.len()
        );
        if pending.is_empty() {
            return Ok(Outcome::Completed);
        }

        let done = Latch::new();
        let mut units = JoinSet::new();
        for index in pending {
            let unit = Dispatch {
                state: self.state.clone(),
                pool: self.pool.clone(),
                transport: self.transport.clone(),
                timeout: self.timeout,
                done: done.clone(),
                args: task_args(&self.state, phase, index),
            };
            units.spawn(unit.run());
        }

        let outcome = loop {
            tokio::select! {
                biased;
                _ = abort.cancelled() => break Outcome::Aborted,
                _ = done.wait() => break Outcome::Completed,
                Some(joined) = units.join_next() => joined??,
            }
        };
        // Let every unit finish so the last workers make it back to the pool.
        while let Some(joined) = units.join_next().await {
            joined??;
        }
        debug!("schedule: {} phase {:?}", phase, outcome);
        Ok(outcome)
    }
}

/// Drives one task until a worker completes it or the job is aborted.
struct Dispatch {
    state: Arc<MasterState>,
    pool: IdlePool,
    transport: Arc<dyn WorkerTransport>,
    timeout: Duration,
    done: Latch,
    args: DoTaskArgs,
}

impl Dispatch {
    async fn run(self) -> Result<()> {
        let abort = self.state.abort_token().clone();
        let (phase, index) = (self.args.phase, self.args.task_number);

        let worker = loop {
            let worker = tokio::select! {
                _ = abort.cancelled() => return Ok(()),
                w = self.pool.take() => w.ok_or_else(|| anyhow!("idle pool closed"))?,
            };
            if abort.is_cancelled() {
                return Ok(());
            }
            trace!("{} task #{} -> {}", phase, index, worker);
            let call = tokio::time::timeout(
                self.timeout,
                self.transport.do_task(&worker, self.args.clone()),
            );
            let reply = tokio::select! {
                _ = abort.cancelled() => return Ok(()),
                reply = call => reply,
            };
            // A failed worker is not returned to the pool; another one gets the task.
            match reply {
                Ok(Ok(())) => break worker,
                Ok(Err(e)) => warn!("{} task #{} failed on {}: {:#}", phase, index, worker, e),
                Err(_) => warn!("{} task #{} timed out on {}", phase, index, worker),
            }
        };

        match self.state.complete(phase, index).await? {
            Completion::Aborted => return Ok(()),
            Completion::PhaseDone => {
                info!("all {} tasks complete", phase);
                self.done.fire();
            }
            Completion::Recorded { remaining } => {
                trace!("{} task #{} done, {} remaining", phase, index, remaining)
            }
            Completion::Duplicate => debug!("{} task #{} was already complete", phase, index),
        }
        if abort.is_cancelled() {
            return Ok(());
        }
        self.pool.put(worker);
        Ok(())
    }
}

/// Runs the tasks of a phase one after another in this process.
pub(crate) struct Sequential {
    state: Arc<MasterState>,
    dir: PathBuf,
    map: MapFn,
    reduce: ReduceFn,
    executed: AtomicUsize,
}

impl Sequential {
    pub fn new(state: Arc<MasterState>, dir: PathBuf, map: MapFn, reduce: ReduceFn) -> Self {
        Self {
            state,
            dir,
            map,
            reduce,
            executed: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Schedule for Sequential {
    async fn schedule(&self, phase: Phase) -> Result<Outcome> {
        let (_, pending) = self.state.outstanding().await;
        for index in pending {
            if self.state.is_aborted() {
                return Ok(Outcome::Aborted);
            }
            let args = task_args(&self.state, phase, index);
            let (dir, map, reduce) = (self.dir.clone(), self.map, self.reduce);
            tokio::task::spawn_blocking(move || match args.phase {
                Phase::Map => do_map(
                    &dir,
                    &args.job_name,
                    index,
                    &args.file,
                    args.num_other_phase,
                    map,
                ),
                _ => do_reduce(&dir, &args.job_name, index, args.num_other_phase, reduce),
            })
            .await??;
            self.executed.fetch_add(1, Ordering::SeqCst);
            if self.state.complete(phase, index).await? == Completion::Aborted {
                return Ok(Outcome::Aborted);
            }
        }
        Ok(if self.state.is_aborted() {
            Outcome::Aborted
        } else {
            Outcome::Completed
        })
    }

    fn local_tasks(&self) -> Option<usize> {
        Some(self.executed.load(Ordering::SeqCst))
    }
}
