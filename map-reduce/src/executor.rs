//! Task bodies run by workers, and the final merge run by the master.
//!
//! Every output is written through an atomic rename so that running a task
//! again simply replaces what an earlier attempt produced.

use std::collections::BTreeMap;
use std::fs;
use std::hash::Hasher;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use atomicwrites::{AllowOverwrite, AtomicFile};
use fnv::FnvHasher;
use log::trace;

use crate::{KeyValue, MapFn, ReduceFn};

/// Output of map task `map_task` destined for reduce task `reduce_task`.
pub fn map_output(dir: &Path, job: &str, map_task: usize, reduce_task: usize) -> PathBuf {
    dir.join(format!("mr-{}-{}-{}", job, map_task, reduce_task))
}

/// Output of reduce task `reduce_task`.
pub fn reduce_output(dir: &Path, job: &str, reduce_task: usize) -> PathBuf {
    dir.join(format!("mr-{}-out-{}", job, reduce_task))
}

/// Merged result of the whole job.
pub fn result_path(dir: &Path, job: &str) -> PathBuf {
    dir.join(format!("mr-{}-result", job))
}

/// Partition hash of a key: FNV-1a, folded to 32 bits.
pub fn ihash(key: &str) -> u32 {
    let mut hasher = FnvHasher::default();
    hasher.write(key.as_bytes());
    let h = hasher.finish();
    (h ^ (h >> 32)) as u32
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    AtomicFile::new(path, AllowOverwrite)
        .write(|f| f.write_all(contents.as_bytes()))
        .with_context(|| format!("unable to write {}", path.display()))?;
    trace!("output {:?}", path);
    Ok(())
}

fn read_pairs(path: &Path) -> Result<Vec<KeyValue>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("unable to read {}", path.display()))?;
    contents
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| {
            serde_json::from_str(l).with_context(|| format!("bad record in {}", path.display()))
        })
        .collect()
}

fn encode_pairs<'a>(pairs: impl IntoIterator<Item = &'a KeyValue>) -> Result<String> {
    let mut s = String::new();
    for kv in pairs {
        s.push_str(&serde_json::to_string(kv)?);
        s.push('\n');
    }
    Ok(s)
}

/// Run `map_fn` over `file` and split its output into `n_reduce` partitions.
///
/// All partitions are written, empty ones included, so reducers can rely on
/// every input being present.
pub fn do_map(
    dir: &Path,
    job: &str,
    map_task: usize,
    file: &str,
    n_reduce: usize,
    map_fn: MapFn,
) -> Result<()> {
    ensure!(n_reduce > 0, "--nreduce should be non-zero");
    let contents =
        fs::read_to_string(file).with_context(|| format!("unable to read input {}", file))?;

    let mut partitions = vec![Vec::new(); n_reduce];
    for kv in map_fn(file, &contents) {
        let r = ihash(&kv.key) as usize % n_reduce;
        partitions[r].push(kv);
    }
    for (r, pairs) in partitions.iter().enumerate() {
        write_atomic(&map_output(dir, job, map_task, r), &encode_pairs(pairs)?)?;
    }
    Ok(())
}

/// Collect partition `reduce_task` from all `n_map` map outputs and reduce it
/// key by key, in key order.
pub fn do_reduce(
    dir: &Path,
    job: &str,
    reduce_task: usize,
    n_map: usize,
    reduce_fn: ReduceFn,
) -> Result<()> {
    let mut groups = BTreeMap::<String, Vec<String>>::new();
    for m in 0..n_map {
        for kv in read_pairs(&map_output(dir, job, m, reduce_task))? {
            groups.entry(kv.key).or_default().push(kv.value);
        }
    }
    let reduced: Vec<KeyValue> = groups
        .iter()
        .map(|(key, values)| KeyValue::new(key.as_str(), reduce_fn(key, values)))
        .collect();
    write_atomic(&reduce_output(dir, job, reduce_task), &encode_pairs(&reduced)?)
}

/// Combine every reduce output into one file of `key value` lines sorted by key.
pub fn merge(dir: &Path, job: &str, n_reduce: usize) -> Result<PathBuf> {
    let mut result = BTreeMap::new();
    for r in 0..n_reduce {
        for kv in read_pairs(&reduce_output(dir, job, r))? {
            result.insert(kv.key, kv.value);
        }
    }
    let mut s = String::new();
    for (k, v) in result.iter() {
        s.push_str(&format!("{} {}\n", k, v));
    }
    let path = result_path(dir, job);
    write_atomic(&path, &s)?;
    Ok(path)
}
