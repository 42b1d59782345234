//! Forked workers running in container context.
//!
//! Joining a pid namespace only affects children, and /proc contents depend
//! on the namespaces of the observer, so every container-context operation
//! runs as a short-lived forked worker. The worker communicates its outcome
//! through its exit status: 0 for success, otherwise an errno value the
//! parent translates back.

use std::path::Path;
use std::process;

use nix::errno::Errno;
use nix::sched::CloneFlags;
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, ForkResult, Pid};

use crate::namespaces::NsSet;

#[derive(thiserror::Error, Debug)]
pub enum ExecError {
    #[error("fork failed: {0}")]
    Fork(Errno),
    #[error("wait failed: {0}")]
    Wait(Errno),
    #[error("worker killed by signal {signal}")]
    Killed { signal: Signal },
    #[error("unexpected wait status {status:?}")]
    Unexpected { status: WaitStatus },
    #[error("worker failed: {0}")]
    Worker(Errno),
}

impl ExecError {
    pub fn errno(&self) -> Errno {
        match self {
            ExecError::Fork(errno) | ExecError::Wait(errno) | ExecError::Worker(errno) => *errno,
            ExecError::Killed { .. } | ExecError::Unexpected { .. } => Errno::EINTR,
        }
    }
}

/// Runs `f` in a forked child after joining `cgroup` and the `mask` subset
/// of `ns`, then waits for it. The child resets SIGCHLD to default first so
/// its own waits do not race the manager's reaper.
///
/// `f` returns an errno value (0 for success) which becomes the child's exit
/// status; the parent maps it back into the returned `Result`.
pub fn run_in_container<F>(
    ns: Option<&NsSet>,
    mask: CloneFlags,
    cgroup: Option<&Path>,
    f: F,
) -> Result<(), ExecError>
where
    F: FnOnce() -> i32,
{
    match unsafe { unistd::fork() }.map_err(ExecError::Fork)? {
        ForkResult::Child => {
            let status = worker_setup(ns, mask, cgroup).map_or_else(|e| e as i32, |_| f());
            process::exit(status);
        }
        ForkResult::Parent { child } => collect_worker(child),
    }
}

fn worker_setup(ns: Option<&NsSet>, mask: CloneFlags, cgroup: Option<&Path>) -> Result<(), Errno> {
    if let Err(errno) = unsafe { signal(Signal::SIGCHLD, SigHandler::SigDfl) } {
        return Err(errno);
    }

    if let Some(path) = cgroup {
        join_cgroup(path)?;
    }

    if let Some(ns) = ns {
        ns.enter(mask).map_err(|err| {
            tracing::error!(?mask, "worker failed to join namespaces: {err}");
            err.errno()
        })?;
    }

    Ok(())
}

/// Moves the calling process into a cgroup by writing to its tasks file.
pub fn join_cgroup(path: &Path) -> Result<(), Errno> {
    libfreezer::write_cgroup_file(path.join("tasks"), unistd::getpid().as_raw()).map_err(|err| {
        tracing::error!(cgroup = %path.display(), "failed to join cgroup: {err}");
        Errno::EACCES
    })
}

/// Waits for a worker and translates its exit status.
pub fn collect_worker(child: Pid) -> Result<(), ExecError> {
    match waitpid(child, None) {
        Ok(WaitStatus::Exited(_, 0)) => Ok(()),
        Ok(WaitStatus::Exited(_, code)) => Err(ExecError::Worker(Errno::from_raw(code))),
        Ok(WaitStatus::Signaled(_, signal, _)) => Err(ExecError::Killed { signal }),
        Ok(status) => Err(ExecError::Unexpected { status }),
        Err(errno) => Err(ExecError::Wait(errno)),
    }
}
