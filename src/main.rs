mod filter;
mod identity;
mod replay;
mod session;
mod spool;
mod utils;

use structopt::StructOpt;
use anyhow::Result;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "sigh-session",
    about = "Replay messages through the per-connection session state of the sigh milter",
    author = "2026, Philippe TEMESI <https://www.tems.be>",
    version = "0.1.0"
)]
pub struct Opt {
    /// Directory for temporary spool files (default: /tmp)
    #[structopt(long = "tmpdir", default_value = "/tmp", parse(from_os_str))]
    pub tmpdir: PathBuf,

    /// Keep spool files on disk after cleanup
    #[structopt(long = "keep-temp-files")]
    pub keep_temp_files: bool,

    /// Address of the simulated client (default: 127.0.0.1:25)
    #[structopt(long = "peer", default_value = "127.0.0.1:25")]
    pub peer: SocketAddr,

    /// Simulate a client connected through a local (unix) socket
    #[structopt(long = "unix-peer")]
    pub unix_peer: bool,

    /// Simulate an MTA that hands over no client address at all
    #[structopt(long = "no-peer")]
    pub no_peer: bool,

    /// Host name claimed by the simulated client
    #[structopt(long = "hostname", default_value = "localhost")]
    pub hostname: String,

    /// Send all messages through a single connection
    #[structopt(long = "reuse")]
    pub reuse: bool,

    /// Log file path
    #[structopt(long = "logs", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Verbose mode - display every header handed to the filter
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// Enable raw display (not filtered) - DANGEROUS
    #[structopt(short = "r", long = "raw")]
    pub raw_display: bool,

    /// Message files (.eml) to replay
    #[structopt(parse(from_os_str), required = true)]
    pub messages: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut opt = Opt::from_args();
    opt.keep_temp_files |= cfg!(feature = "keep-temp-files");

    eprintln!("[INFO] sigh-session v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("[INFO] PID: {}", std::process::id());
    eprintln!("[INFO] Temporary directory: {:?}", opt.tmpdir);
    if opt.keep_temp_files {
        eprintln!("[INFO] Spool files are retained after cleanup");
    }

    let replayer = match replay::Replayer::new(opt) {
        Ok(r) => Arc::new(r),
        Err(e) => {
            eprintln!("[ERROR] Failed to start: {:#}", e);
            std::process::exit(1);
        }
    };

    eprintln!("[INFO] Replaying {} message(s)", replayer.opt.messages.len());

    replayer.run().await?;

    Ok(())
}
