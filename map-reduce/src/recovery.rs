//! Restores master state from the task log and the worker log at startup.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use log::{debug, info, warn};

use crate::state::MasterState;
use crate::transport::WorkerTransport;
use crate::Phase;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Recovery {
    /// No usable log: the job starts over from the map phase.
    Cold,
    Resumed {
        phase: Phase,
        /// Tasks of `phase` that were already complete.
        completed: usize,
        /// Workers asked to register again.
        workers: Vec<String>,
    },
}

/// Decide between a cold start and resuming a recorded phase.
///
/// On a cold start both logs are replaced by fresh headers. When resuming,
/// every worker named in the worker log is asked to register with
/// `master_addr` again, provided a transport is given.
pub(crate) async fn recover(
    state: &MasterState,
    transport: Option<&dyn WorkerTransport>,
    master_addr: &str,
    timeout: Duration,
) -> Result<Recovery> {
    let job = state.job();
    let log = match state.read_task_log().await? {
        Some(log) if log.job == job.name => log,
        Some(log) => {
            info!("task log belongs to job {:?}, starting over", log.job);
            return cold_start(state).await;
        }
        None => return cold_start(state).await,
    };
    let mut records = log.records.into_iter();
    let phase = match records.next().map(|p| p.parse::<Phase>()) {
        Some(Ok(phase)) => phase,
        Some(Err(e)) => {
            warn!("corrupt task log ({:#}), starting over", e);
            return cold_start(state).await;
        }
        None => return cold_start(state).await,
    };

    let ntasks = job.ntasks(phase);
    let mut completed = BTreeSet::new();
    for record in records {
        match record.parse::<usize>() {
            Ok(i) if i < ntasks => {
                completed.insert(i);
            }
            _ => warn!("skipping bad task log record {:?}", record),
        }
    }
    state.resume(phase, &completed).await;
    info!(
        "resuming job {} in {} phase, {}/{} tasks complete",
        job.name,
        phase,
        completed.len(),
        ntasks
    );

    let workers = recover_workers(state).await?;
    if let Some(transport) = transport {
        re_register(transport, &workers, master_addr, timeout).await;
    }
    Ok(Recovery::Resumed {
        phase,
        completed: completed.len(),
        workers,
    })
}

async fn cold_start(state: &MasterState) -> Result<Recovery> {
    debug!("cold start of job {}", state.job().name);
    state.enter_phase(Phase::Map).await?;
    state.reset_worker_log(&[]).await?;
    Ok(Recovery::Cold)
}

/// Known worker addresses, each once, in first-seen order. The worker log is
/// rewritten to exactly that list.
async fn recover_workers(state: &MasterState) -> Result<Vec<String>> {
    let mut workers = Vec::new();
    match state.read_worker_log().await? {
        Some(log) if log.job == state.job().name => {
            let mut seen = HashSet::new();
            for w in log.records {
                if !w.is_empty() && seen.insert(w.clone()) {
                    workers.push(w);
                }
            }
        }
        Some(log) => warn!("worker log belongs to job {:?}, ignored", log.job),
        None => {}
    }
    state.reset_worker_log(&workers).await?;
    Ok(workers)
}

async fn re_register(
    transport: &dyn WorkerTransport,
    workers: &[String],
    master_addr: &str,
    timeout: Duration,
) {
    let calls = workers.iter().map(|w| async move {
        match tokio::time::timeout(timeout, transport.re_register(w, master_addr)).await {
            Ok(Ok(())) => debug!("{} re-registered", w),
            Ok(Err(e)) => warn!("re-register {} failed: {:#}", w, e),
            Err(_) => warn!("re-register {} timed out", w),
        }
    });
    join_all(calls).await;
}
