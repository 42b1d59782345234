//! Control socket service: accepts seqpacket connections, parses the
//! newline-framed textual requests and answers each with exactly one status
//! line, 0 or a negative errno.
//!
//! `replace` runs in a forked job child, so jobs against different freezer
//! cgroups proceed in parallel while jobs on the same cgroup serialize on
//! the freezer lock. The child sends the status reply itself; the reaper
//! collects it later.

use std::os::unix::io::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use libreplace::replace::{replace_resources, ContainerContext, ReplaceJob};
use nix::errno::Errno;
use nix::mount::MsFlags;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::socket::accept;
use nix::sys::wait::WaitStatus;
use nix::unistd::{fork, read, write, ForkResult, Pid};

use crate::context::ManagerContext;
use crate::{reaper, stub};

const REQUEST_MAX: usize = 4096;

#[derive(Debug, PartialEq)]
pub enum Request {
    Mount {
        id: String,
        fstype: String,
        flags: u64,
        source: String,
        options: Option<String>,
    },
    Replace {
        id: String,
        fstype: String,
        flags: u64,
        source: String,
        options: Option<String>,
    },
    Manage {
        id: String,
        freezer_cgroup: PathBuf,
        ns_pid: Pid,
        socket: Option<PathBuf>,
    },
}

pub fn run(ctx: &ManagerContext) -> Result<()> {
    tracing::info!(
        socket = %ctx.socket_path.display(),
        work_dir = %ctx.work_dir.display(),
        "manager ready"
    );

    loop {
        let mut fds = [
            PollFd::new(ctx.sock.as_fd(), PollFlags::POLLIN),
            PollFd::new(ctx.reaper_fd.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno).context("poll on control socket"),
        }

        let sock_ready = fds[0]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN));
        let reaper_ready = fds[1]
            .revents()
            .is_some_and(|r| r.contains(PollFlags::POLLIN));

        if reaper_ready {
            handle_exits(ctx);
        }
        if sock_ready {
            accept_one(ctx);
        }
    }
}

fn handle_exits(ctx: &ManagerContext) {
    for exit in reaper::drain(ctx.reaper_fd.as_raw_fd()) {
        match WaitStatus::from_raw(exit.pid, exit.status) {
            Ok(WaitStatus::Exited(pid, code)) => {
                tracing::info!(pid = pid.as_raw(), code, "child exited")
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                tracing::error!(pid = pid.as_raw(), signal = %sig, "child killed by signal")
            }
            other => tracing::debug!(?other, "child changed state"),
        }

        if let Some(info) = stub::remove_by_pid(exit.pid) {
            tracing::info!(id = %info.id, "stub has exited");
            if ctx.exit_with_stub && stub::is_empty() {
                tracing::info!("stub table is empty, exiting");
                process::exit(0);
            }
        }
    }
}

fn accept_one(ctx: &ManagerContext) {
    let conn = match accept(ctx.sock.as_raw_fd()) {
        Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
        Err(Errno::EINTR | Errno::EAGAIN) => return,
        Err(errno) => {
            tracing::warn!("accept failed: {errno}");
            return;
        }
    };

    if let Err(err) = handle_connection(ctx, &conn) {
        tracing::warn!("failed to handle request: {err}");
    }
}

fn handle_connection(ctx: &ManagerContext, conn: &OwnedFd) -> Result<()> {
    let mut buf = [0u8; REQUEST_MAX];
    let n = read(conn.as_raw_fd(), &mut buf).context("failed to read request")?;
    let line = String::from_utf8_lossy(&buf[..n]);
    let line = line.trim();
    tracing::debug!(request = %line, "received request");

    match parse_request(line) {
        Err(errno) => send_status(conn, -(errno as i32)),
        Ok(Request::Mount { id, .. }) => {
            // Stub installation is the stub's own business; the manager only
            // takes over already-mounted stubs.
            tracing::warn!(id = %id, "mount requests are not served by this manager");
            send_status(conn, -(Errno::EOPNOTSUPP as i32))
        }
        Ok(Request::Manage {
            id,
            freezer_cgroup,
            ns_pid,
            socket,
        }) => {
            stub::manage(&id, freezer_cgroup, ns_pid, socket);
            tracing::info!(id = %id, ns_pid = ns_pid.as_raw(), "managing stub");
            send_status(conn, 0)
        }
        Ok(Request::Replace {
            id,
            fstype,
            flags,
            source,
            options,
        }) => dispatch_replace(ctx, conn, id, fstype, flags, source, options),
    }
}

fn dispatch_replace(
    ctx: &ManagerContext,
    conn: &OwnedFd,
    id: String,
    fstype: String,
    flags: u64,
    source: String,
    options: Option<String>,
) -> Result<()> {
    let Some(info) = stub::find(&id) else {
        tracing::error!(id = %id, "replace for an unmanaged stub");
        return send_status(conn, -(Errno::ESRCH as i32));
    };
    let Some(freezer_cgroup) = info.freezer_cgroup else {
        tracing::error!(id = %id, "stub has no freezer cgroup attached");
        return send_status(conn, -(Errno::ESRCH as i32));
    };

    let job = ReplaceJob {
        mount_id: id,
        fstype,
        flags: MsFlags::from_bits_truncate(flags),
        source,
        options,
        work_dir: ctx.work_dir.clone(),
        stub_socket: info.socket,
    };
    let container = ContainerContext {
        ns_pid: info.ns_pid,
        freezer_cgroup,
        ovz_id: ctx.ovz_id.clone(),
    };

    match unsafe { fork() }.context("failed to fork replace job")? {
        ForkResult::Child => {
            // The job waits for its own workers; the manager's reaper must
            // not steal them.
            let _ = unsafe { signal(Signal::SIGCHLD, SigHandler::SigDfl) };

            let status = match replace_resources(&job, &container) {
                Ok(()) => 0,
                Err(err) => {
                    tracing::error!("replace failed: {err}");
                    -(err.errno() as i32)
                }
            };
            let _ = send_status(conn, status);
            process::exit(0);
        }
        ForkResult::Parent { child } => {
            tracing::debug!(job = child.as_raw(), "forked replace job");
            Ok(())
        }
    }
}

fn send_status(conn: &OwnedFd, status: i32) -> Result<()> {
    let reply = format!("{status}\n");
    write(conn.as_fd(), reply.as_bytes()).context("failed to send status")?;
    Ok(())
}

pub fn parse_request(line: &str) -> Result<Request, Errno> {
    let mut words = line.split_whitespace();
    let verb = words.next().ok_or(Errno::EINVAL)?;
    let rest: Vec<&str> = words.collect();

    match verb {
        "mount" => {
            let (id, fstype, flags, source, options) = parse_mount_args(&rest)?;
            Ok(Request::Mount {
                id,
                fstype,
                flags,
                source,
                options,
            })
        }
        "replace" => {
            let (id, fstype, flags, source, options) = parse_mount_args(&rest)?;
            Ok(Request::Replace {
                id,
                fstype,
                flags,
                source,
                options,
            })
        }
        "manage" => {
            if rest.len() < 3 || rest.len() > 4 {
                return Err(Errno::EINVAL);
            }
            let ns_pid = rest[2].parse::<i32>().map_err(|_| Errno::EINVAL)?;
            Ok(Request::Manage {
                id: rest[0].to_owned(),
                freezer_cgroup: PathBuf::from(rest[1]),
                ns_pid: Pid::from_raw(ns_pid),
                socket: rest.get(3).map(PathBuf::from),
            })
        }
        _ => Err(Errno::EINVAL),
    }
}

fn parse_mount_args(
    rest: &[&str],
) -> Result<(String, String, u64, String, Option<String>), Errno> {
    if rest.len() < 4 || rest.len() > 5 {
        return Err(Errno::EINVAL);
    }
    let flags = rest[2].parse::<u64>().map_err(|_| Errno::EINVAL)?;
    Ok((
        rest[0].to_owned(),
        rest[1].to_owned(),
        flags,
        rest[3].to_owned(),
        rest.get(4).map(|s| (*s).to_owned()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    #[test]
    fn test_parse_replace() {
        let request = parse_request("replace sid nfs 0 server:/export").unwrap();
        assert_eq!(
            request,
            Request::Replace {
                id: "sid".into(),
                fstype: "nfs".into(),
                flags: 0,
                source: "server:/export".into(),
                options: None,
            }
        );

        let request = parse_request("replace sid nfs 1 server:/export vers=4.2,soft").unwrap();
        match request {
            Request::Replace { flags, options, .. } => {
                assert_eq!(flags, 1);
                assert_eq!(options.as_deref(), Some("vers=4.2,soft"));
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_parse_manage() {
        let request = parse_request("manage sid /sys/fs/cgroup/freezer/ct1 4321").unwrap();
        assert_eq!(
            request,
            Request::Manage {
                id: "sid".into(),
                freezer_cgroup: PathBuf::from("/sys/fs/cgroup/freezer/ct1"),
                ns_pid: Pid::from_raw(4321),
                socket: None,
            }
        );

        let request =
            parse_request("manage sid /sys/fs/cgroup/freezer/ct1 4321 ct1.stub.sock").unwrap();
        match request {
            Request::Manage { socket, .. } => {
                assert_eq!(socket, Some(PathBuf::from("ct1.stub.sock")))
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_malformed_requests() {
        for bad in [
            "",
            "destroy sid",
            "replace sid nfs",
            "replace sid nfs notanumber server:/export",
            "replace sid nfs 0 server:/export opts trailing",
            "manage sid /cg notapid",
            "manage sid",
        ] {
            assert_eq!(parse_request(bad).unwrap_err(), Errno::EINVAL, "{bad:?}");
        }
    }

    #[test]
    fn test_status_reply_format() -> Result<()> {
        let (ours, theirs) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::empty(),
        )?;

        send_status(&ours, -(Errno::ENOENT as i32))?;

        let mut buf = [0u8; 16];
        let n = read(theirs.as_raw_fd(), &mut buf)?;
        assert_eq!(&buf[..n], b"-2\n");
        Ok(())
    }
}
