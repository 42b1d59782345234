//! Manager configuration: work directory, log, control socket, signal
//! discipline and environment. Everything defaults relative to the work
//! directory, which the manager chdirs into.

use std::os::unix::io::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::{env, fs};

use anyhow::{bail, Context, Result};
use nix::sys::socket::{bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};

use crate::reaper;
use crate::Opts;

pub const PROGNAME: &str = "liveswap";

pub struct ManagerContext {
    pub work_dir: PathBuf,
    pub socket_path: PathBuf,
    pub log_file: PathBuf,
    pub exit_with_stub: bool,
    pub ovz_id: Option<String>,
    pub sock: OwnedFd,
    pub reaper_fd: OwnedFd,
}

impl ManagerContext {
    pub fn configure(opts: Opts) -> Result<Self> {
        let work_dir = opts
            .work_dir
            .unwrap_or_else(|| PathBuf::from(format!("/run/{}-{}", PROGNAME, std::process::id())));
        fs::create_dir_all(&work_dir)
            .with_context(|| format!("failed to create work dir {}", work_dir.display()))?;
        env::set_current_dir(&work_dir)
            .with_context(|| format!("failed to chdir into {}", work_dir.display()))?;

        let log_file = opts
            .log
            .unwrap_or_else(|| PathBuf::from(format!("{PROGNAME}.log")));
        // Log setup failures must not kill the manager; diagnostics fall
        // back to stderr.
        if let Err(err) = crate::logger::init(&log_file, opts.verbose) {
            eprintln!("log init failed: {err:?}");
        }

        let socket_path = opts.socket_path.unwrap_or_else(|| {
            tracing::info!("socket path wasn't provided, using {PROGNAME}.sock");
            PathBuf::from(format!("{PROGNAME}.sock"))
        });
        if socket_path.exists() {
            bail!("socket {} already exists. Stale?", socket_path.display());
        }

        let sock = seqpacket_listener(&socket_path)
            .with_context(|| format!("failed to listen on {}", socket_path.display()))?;
        let reaper_fd = reaper::setup()?;

        let ovz_id = env::var("VEID").ok();
        if let Some(id) = &ovz_id {
            tracing::info!(ve = %id, "running on an OpenVZ-like kernel");
        }

        Ok(ManagerContext {
            work_dir,
            socket_path,
            log_file,
            exit_with_stub: opts.exit_with_stub,
            ovz_id,
            sock,
            reaper_fd,
        })
    }
}

impl Drop for ManagerContext {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.socket_path) {
            tracing::warn!(
                "failed to unlink {}: {err}",
                self.socket_path.display()
            );
        }
    }
}

fn seqpacket_listener(path: &Path) -> Result<OwnedFd> {
    let sock = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .context("failed to create socket")?;

    let addr = UnixAddr::new(path).context("invalid socket path")?;
    bind(sock.as_raw_fd(), &addr).context("failed to bind")?;
    listen(&sock, Backlog::new(16)?).context("failed to listen")?;
    Ok(sock)
}
