//! Scriptable in-memory transport for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::transport::WorkerTransport;
use crate::{DoTaskArgs, Phase};

type Hook = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Script {
    down: HashSet<String>,
    /// Tasks whose next attempt fails.
    fail_once: HashSet<(Phase, usize)>,
    /// Tasks that never answer.
    hang: HashSet<(Phase, usize)>,
    processed: HashMap<String, usize>,
    calls: Vec<(String, Phase, usize, bool)>,
    shutdowns: Vec<String>,
    re_registers: Vec<(String, String)>,
    on_shutdown: Option<Hook>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeTransport {
    script: Arc<Mutex<Script>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, worker: &str) {
        self.script.lock().unwrap().down.insert(worker.to_owned());
    }

    pub fn fail_once(&self, phase: Phase, index: usize) {
        self.script.lock().unwrap().fail_once.insert((phase, index));
    }

    pub fn hang(&self, phase: Phase, index: usize) {
        self.script.lock().unwrap().hang.insert((phase, index));
    }

    pub fn set_processed(&self, worker: &str, n: usize) {
        self.script
            .lock()
            .unwrap()
            .processed
            .insert(worker.to_owned(), n);
    }

    /// Run `f` on every Shutdown, before it is answered.
    pub fn on_shutdown(&self, f: impl Fn() + Send + Sync + 'static) {
        self.script.lock().unwrap().on_shutdown = Some(Arc::new(f));
    }

    /// `(worker, phase, index, succeeded)` for every DoTask, in call order.
    pub fn calls(&self) -> Vec<(String, Phase, usize, bool)> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn successes(&self, phase: Phase, index: usize) -> usize {
        self.calls()
            .iter()
            .filter(|(_, p, i, ok)| *p == phase && *i == index && *ok)
            .count()
    }

    pub fn shutdowns(&self) -> Vec<String> {
        self.script.lock().unwrap().shutdowns.clone()
    }

    pub fn re_registers(&self) -> Vec<(String, String)> {
        self.script.lock().unwrap().re_registers.clone()
    }
}

#[async_trait]
impl WorkerTransport for FakeTransport {
    async fn do_task(&self, worker: &str, args: DoTaskArgs) -> Result<()> {
        let task = (args.phase, args.task_number);
        let (ok, hang) = {
            let mut s = self.script.lock().unwrap();
            let hang = s.hang.contains(&task);
            let ok = !hang && !s.down.contains(worker) && !s.fail_once.remove(&task);
            s.calls.push((worker.to_owned(), task.0, task.1, ok));
            (ok, hang)
        };
        if hang {
            futures::future::pending::<()>().await;
        }
        if !ok {
            bail!("{} failed task {:?}", worker, task);
        }
        Ok(())
    }

    async fn shutdown(&self, worker: &str) -> Result<usize> {
        let hook = self.script.lock().unwrap().on_shutdown.clone();
        if let Some(hook) = hook {
            hook();
        }
        let mut s = self.script.lock().unwrap();
        s.shutdowns.push(worker.to_owned());
        if s.down.contains(worker) {
            bail!("{} is down", worker);
        }
        Ok(s.processed.get(worker).copied().unwrap_or(0))
    }

    async fn re_register(&self, worker: &str, master: &str) -> Result<()> {
        let mut s = self.script.lock().unwrap();
        s.re_registers.push((worker.to_owned(), master.to_owned()));
        if s.down.contains(worker) {
            bail!("{} is down", worker);
        }
        Ok(())
    }
}
