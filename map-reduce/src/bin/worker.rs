use std::path::PathBuf;

use anyhow::Result;
use log::info;
use structopt::StructOpt;

use map_reduce::app::wc;
use map_reduce::net::{join, serve_worker};
use map_reduce::Worker;

#[derive(StructOpt, Debug)]
#[structopt(name = env!("CARGO_PKG_NAME"), version = env!("CARGO_PKG_VERSION"), about = env!("CARGO_PKG_DESCRIPTION"), author = env!("CARGO_PKG_AUTHORS"))]
struct Opt {
    /// Address of the master
    #[structopt(short, long, default_value = "127.0.0.1:9999")]
    master: String,

    /// Address to serve tasks on, as seen by the master
    #[structopt(short, long)]
    address: String,

    /// Directory for intermediate and result files, shared with the master
    #[structopt(long, default_value = "target", parse(from_os_str))]
    dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    let w = Worker::new(opt.address, opt.master, opt.dir, wc::map, wc::reduce);
    let serving = serve_worker(w.clone()).await?;
    join(&w).await?;
    serving.await;
    info!("{} processed {} tasks", w.address(), w.ntasks());
    Ok(())
}
