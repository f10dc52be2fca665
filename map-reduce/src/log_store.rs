//! Flat-file write-ahead logs of the master.
//!
//! Both logs start with the job name. The task log continues with the current
//! phase and then one completed task index per line; the worker log continues
//! with one worker address per line. Headers are replaced atomically, records
//! are appended and synced one line at a time.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use atomicwrites::{AllowOverwrite, AtomicFile};
use log::{trace, warn};

use crate::config::{TASK_LOG, WORKER_LOG};
use crate::Phase;

/// Contents of a log split into its first line and the lines after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogContents {
    pub job: String,
    pub records: Vec<String>,
}

/// Append-only text file, one record per line.
#[derive(Debug, Clone)]
pub struct LineLog {
    path: PathBuf,
}

impl LineLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` if the file is missing, empty or not text.
    pub fn read(&self) -> Result<Option<LogContents>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                warn!("{} is not a text log, ignored", self.path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("unable to read {}", self.path.display()))
            }
        };
        let mut lines = contents.lines().map(str::to_owned);
        Ok(lines.next().map(|job| LogContents {
            job,
            records: lines.collect(),
        }))
    }

    /// Replace the whole file with `lines`.
    pub fn rewrite<I, S>(&self, lines: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut s = String::new();
        for line in lines {
            s.push_str(line.as_ref());
            s.push('\n');
        }
        AtomicFile::new(&self.path, AllowOverwrite)
            .write(|f| f.write_all(s.as_bytes()))
            .with_context(|| format!("unable to rewrite {}", self.path.display()))?;
        trace!("rewrote {}", self.path.display());
        Ok(())
    }

    pub fn append(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .with_context(|| format!("unable to open {}", self.path.display()))?;
        writeln!(f, "{}", line)
            .and_then(|_| f.sync_data())
            .with_context(|| format!("unable to append to {}", self.path.display()))?;
        trace!("{} += {}", self.path.display(), line);
        Ok(())
    }

    /// Remove the file. A missing file is not an error.
    pub fn delete(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != ErrorKind::NotFound => {
                Err(e).with_context(|| format!("unable to delete {}", self.path.display()))
            }
            _ => Ok(()),
        }
    }
}

/// `[job name][phase]{completed index}*`
#[derive(Debug, Clone)]
pub struct TaskLog {
    log: LineLog,
}

impl TaskLog {
    pub fn open(dir: &Path) -> Self {
        Self {
            log: LineLog::new(dir.join(TASK_LOG)),
        }
    }

    pub fn path(&self) -> &Path {
        self.log.path()
    }

    pub fn read(&self) -> Result<Option<LogContents>> {
        self.log.read()
    }

    /// Truncate to the two-line header of `phase`.
    pub fn start_phase(&self, job: &str, phase: Phase) -> Result<()> {
        self.log.rewrite([job.to_owned(), phase.to_string()])
    }

    pub fn record(&self, index: usize) -> Result<()> {
        self.log.append(&index.to_string())
    }

    pub fn delete(&self) -> Result<()> {
        self.log.delete()
    }
}

/// `[job name]{worker address}*`
#[derive(Debug, Clone)]
pub struct WorkerLog {
    log: LineLog,
}

impl WorkerLog {
    pub fn open(dir: &Path) -> Self {
        Self {
            log: LineLog::new(dir.join(WORKER_LOG)),
        }
    }

    pub fn path(&self) -> &Path {
        self.log.path()
    }

    pub fn read(&self) -> Result<Option<LogContents>> {
        self.log.read()
    }

    pub fn reset(&self, job: &str, workers: &[String]) -> Result<()> {
        self.log
            .rewrite(std::iter::once(job).chain(workers.iter().map(String::as_str)))
    }

    pub fn record(&self, worker: &str) -> Result<()> {
        self.log.append(worker)
    }

    pub fn delete(&self) -> Result<()> {
        self.log.delete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_task_log() {
        let dir = TempDir::new().unwrap();
        let log = TaskLog::open(dir.path());
        assert!(log.read().unwrap().is_none());

        log.start_phase("wc", Phase::Map).unwrap();
        log.record(1).unwrap();
        log.record(0).unwrap();
        assert_eq!(
            fs::read_to_string(log.path()).unwrap(),
            "wc\nMap\n1\n0\n"
        );

        // A new phase drops the completions of the previous one.
        log.start_phase("wc", Phase::Reduce).unwrap();
        let c = log.read().unwrap().unwrap();
        assert_eq!(c.job, "wc");
        assert_eq!(c.records, vec!["Reduce".to_owned()]);

        log.delete().unwrap();
        assert!(!log.path().exists());
        log.delete().unwrap();
    }

    #[test]
    fn test_worker_log() {
        let dir = TempDir::new().unwrap();
        let log = WorkerLog::open(dir.path());
        log.reset("wc", &[]).unwrap();
        log.record("w1").unwrap();
        log.record("w2").unwrap();
        let c = log.read().unwrap().unwrap();
        assert_eq!(c.job, "wc");
        assert_eq!(c.records, vec!["w1".to_owned(), "w2".to_owned()]);

        log.reset("wc", &["w2".to_owned()]).unwrap();
        assert_eq!(fs::read_to_string(log.path()).unwrap(), "wc\nw2\n");
    }

    #[test]
    fn test_unreadable_logs() {
        let dir = TempDir::new().unwrap();
        let log = LineLog::new(dir.path().join("log"));

        fs::write(log.path(), "").unwrap();
        assert!(log.read().unwrap().is_none());

        fs::write(log.path(), [0xff, 0xfe, b'\n']).unwrap();
        assert!(log.read().unwrap().is_none());

        // Appending creates the file.
        let fresh = LineLog::new(dir.path().join("fresh"));
        fresh.append("x").unwrap();
        assert_eq!(fresh.read().unwrap().unwrap().job, "x");
    }

    #[test]
    fn test_missing_dir_is_fatal() {
        let dir = TempDir::new().unwrap();
        let log = TaskLog::open(&dir.path().join("no-such-dir"));
        assert!(log.start_phase("wc", Phase::Map).is_err());
        assert!(log.record(0).is_err());
    }
}
