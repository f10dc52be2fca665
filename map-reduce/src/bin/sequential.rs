use std::path::PathBuf;

use anyhow::{bail, Result};
use log::info;
use structopt::StructOpt;

use map_reduce::app::wc::{map, reduce};
use map_reduce::{Job, JobStatus, Master, MasterConfig};

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"), author = env!("CARGO_PKG_AUTHORS"))]
struct Opt {
    /// Files to process
    #[structopt(name = "FILE", required = true)]
    files: Vec<String>,

    /// Job name, used in the names of every output file
    #[structopt(long, default_value = "wcseq")]
    job: String,

    #[structopt(long, default_value = "3")]
    nreduce: usize,

    /// Directory for intermediate and result files
    #[structopt(long, default_value = "target", parse(from_os_str))]
    dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    let config = MasterConfig {
        address: "sequential".to_owned(),
        log_dir: opt.dir.clone(),
        work_dir: opt.dir,
        ..MasterConfig::default()
    };
    let m = Master::sequential(config, Job::new(opt.job, opt.files, opt.nreduce), map, reduce)?;
    match m.wait().await {
        JobStatus::Done => {
            info!("result in {}", m.result_path().display());
            Ok(())
        }
        status => bail!("job ended with {:?}", status),
    }
}
