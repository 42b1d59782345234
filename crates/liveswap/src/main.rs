//! # liveswap
//!
//! Manager daemon for live filesystem replacement: a stub filesystem
//! occupies a mountpoint inside a container, and on request this daemon
//! swaps it for the real filesystem without restarting the workload. The
//! heavy lifting lives in `libreplace`; this crate owns the control socket,
//! the work directory, logging and child bookkeeping.

mod context;
mod logger;
mod reaper;
mod server;
mod stub;

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{close, dup2, fork, setsid, ForkResult};

use crate::context::ManagerContext;

#[derive(Parser, Debug)]
#[command(
    name = context::PROGNAME,
    version,
    about = "Replaces a live stub filesystem with the real one under running containers"
)]
struct Opts {
    /// working directory
    #[arg(short = 'w', long, value_name = "DIR")]
    work_dir: Option<PathBuf>,

    /// log file
    #[arg(short = 'l', long, value_name = "FILE")]
    log: Option<PathBuf>,

    /// interface socket path
    #[arg(short = 's', long, value_name = "PATH")]
    socket_path: Option<PathBuf>,

    /// daemonize
    #[arg(short = 'd', long)]
    daemon: bool,

    /// exit when the last managed stub has exited
    #[arg(long)]
    exit_with_stub: bool,

    /// increase verbosity (can be used multiple times)
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    // Daemonize before anything pid-derived: the default work directory
    // carries the daemon's pid in its name.
    if opts.daemon {
        daemonize().context("failed to daemonize")?;
    }

    let ctx = ManagerContext::configure(opts).context("failed to configure")?;
    server::run(&ctx)
}

fn daemonize() -> Result<()> {
    match unsafe { fork() }.context("first fork")? {
        ForkResult::Parent { .. } => process::exit(0),
        ForkResult::Child => {}
    }
    setsid().context("setsid")?;
    match unsafe { fork() }.context("second fork")? {
        ForkResult::Parent { .. } => process::exit(0),
        ForkResult::Child => {}
    }

    let null = open("/dev/null", OFlag::O_RDWR, Mode::empty()).context("open /dev/null")?;
    for fd in 0..=2 {
        dup2(null, fd).context("redirect stdio")?;
    }
    if null > 2 {
        close(null).context("close /dev/null")?;
    }
    Ok(())
}
