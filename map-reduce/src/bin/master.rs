use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use log::{info, warn};
use structopt::StructOpt;

use map_reduce::net::{serve_master, TcpTransport};
use map_reduce::{Job, JobStatus, Master, MasterConfig};

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"), author = env!("CARGO_PKG_AUTHORS"))]
struct Opt {
    /// Address to serve registrations on, as seen by workers
    #[structopt(short, long, default_value = "127.0.0.1:9999")]
    address: String,

    /// Timeout in seconds used for communication with workers
    #[structopt(short, long, default_value = "10")]
    timeout: u64,

    /// Files to process
    #[structopt(name = "FILE", required = true)]
    files: Vec<String>,

    /// Job name; a restarted master resumes a job of the same name
    #[structopt(long, default_value = "wc")]
    job: String,

    #[structopt(long, default_value = "10")]
    nreduce: usize,

    /// Directory of the task log and the worker log
    #[structopt(long, default_value = ".", parse(from_os_str))]
    log_dir: PathBuf,

    /// Directory for intermediate and result files, shared with the workers
    #[structopt(long, default_value = "target", parse(from_os_str))]
    dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    let timeout = Duration::from_secs(opt.timeout);
    let config = MasterConfig {
        address: opt.address,
        log_dir: opt.log_dir,
        work_dir: opt.dir,
        dispatch_timeout: timeout,
    };
    let job = Job::new(opt.job, opt.files, opt.nreduce);
    let m = Master::distributed(config, job, Arc::new(TcpTransport::new(timeout)))?;
    tokio::spawn(serve_master(m.address().to_owned(), m.endpoint()).await?);
    m.start();

    {
        let m = m.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted");
                m.abort();
            }
        });
    }

    match m.wait().await {
        JobStatus::Done => {
            info!("workers processed {:?} tasks", m.stats());
            info!("result in {}", m.result_path().display());
            Ok(())
        }
        status => bail!("job ended with {:?}", status),
    }
}
