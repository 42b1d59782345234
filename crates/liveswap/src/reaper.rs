//! SIGCHLD discipline.
//!
//! The manager forks stubs, replacement jobs and workers, and must observe
//! all of them without racing the waits its own children perform. All
//! signals except SIGCHLD are blocked; the handler drains waitpid(WNOHANG)
//! and pushes (pid, status) records into a self-pipe. The main poll loop
//! reads the pipe and does the actual bookkeeping, keeping the handler
//! async-signal-safe. Forked children reset the handler to default.

use std::os::unix::io::{IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{sigaction, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::{pipe2, read, Pid};

static REAPER_PIPE_WR: AtomicI32 = AtomicI32::new(-1);

const RECORD_LEN: usize = 8;

#[derive(Debug, Clone, Copy)]
pub struct Exit {
    pub pid: Pid,
    pub status: i32,
}

/// Installs the signal discipline; returns the read side of the self-pipe
/// for the main poll loop.
pub fn setup() -> Result<OwnedFd> {
    let mut mask = SigSet::all();
    mask.remove(Signal::SIGCHLD);
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&mask), None).context("failed to block signals")?;

    let (rd, wr) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC).context("failed to create reaper pipe")?;
    REAPER_PIPE_WR.store(wr.into_raw_fd(), Ordering::SeqCst);

    let mut handled = SigSet::empty();
    handled.add(Signal::SIGCHLD);
    let action = SigAction::new(
        SigHandler::SigAction(handle_sigchld),
        SaFlags::SA_NOCLDSTOP | SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
        handled,
    );
    unsafe { sigaction(Signal::SIGCHLD, &action) }.context("sigaction failed")?;

    Ok(rd)
}

extern "C" fn handle_sigchld(
    _signal: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    let wr = REAPER_PIPE_WR.load(Ordering::SeqCst);
    if wr < 0 {
        return;
    }

    loop {
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }

        let mut record = [0u8; RECORD_LEN];
        record[..4].copy_from_slice(&pid.to_ne_bytes());
        record[4..].copy_from_slice(&status.to_ne_bytes());
        // A full pipe drops records; the poll loop's waits are WNOHANG so
        // nothing blocks on a lost one.
        unsafe { libc::write(wr, record.as_ptr().cast(), RECORD_LEN) };
    }
}

/// Reads every pending exit record off the self-pipe.
pub fn drain(fd: RawFd) -> Vec<Exit> {
    let mut exits = Vec::new();
    let mut record = [0u8; RECORD_LEN];

    loop {
        match read(fd, &mut record) {
            Ok(RECORD_LEN) => {
                let pid = i32::from_ne_bytes([record[0], record[1], record[2], record[3]]);
                let status = i32::from_ne_bytes([record[4], record[5], record[6], record[7]]);
                exits.push(Exit {
                    pid: Pid::from_raw(pid),
                    status,
                });
            }
            Ok(_) => break,
            Err(Errno::EAGAIN) => break,
            Err(Errno::EINTR) => continue,
            Err(errno) => {
                tracing::warn!("failed to read reaper pipe: {errno}");
                break;
            }
        }
    }
    exits
}
