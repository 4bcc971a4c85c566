mod acceptor;
mod config;
mod device;
mod error;
mod log;
mod memory;
mod pcap;
mod processor;
mod session;
mod stats;
mod vring;
mod wire;

use std::path::PathBuf;

use clap::Parser;
use tracing::Level;

use acceptor::Acceptor;
use config::Config;
use error::AppResult;

#[derive(Parser)]
pub(crate) struct Opts {
    /// Path to configuration file
    pub config: PathBuf,

    /// Path to the unix socket to communicate with the front-end's
    /// vhost-user driver. Overrides the config file's `socket.path`.
    #[arg(short, long)]
    pub socket: Option<PathBuf>,

    /// Path to pcap file, or blank to not capture pcap. Overrides the config
    /// file's `pcap`.
    #[arg(short, long)]
    pub pcap: Option<PathBuf>,

    /// Control the level of output to stdout (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

fn run(opts: Opts) -> AppResult<()> {
    let cfg = Config::load(&opts.config)?;
    tracing::debug!(?cfg, "configuration");

    let socket = opts.socket.unwrap_or(cfg.socket.path);
    let pcap = opts.pcap.or(cfg.pcap);

    let acceptor = Acceptor::new(socket, pcap);
    acceptor.run()
}

fn main() {
    let opts = Opts::parse();

    let level = match opts.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .init();

    if let Err(error) = run(opts) {
        tracing::error!(?error, "vhost-loopbackd exited");
        std::process::exit(1);
    }
}
