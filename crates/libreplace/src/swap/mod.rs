//! Injection façade.
//!
//! The orchestrator hands the inventory to this module, which drives the
//! ptrace-based injector: seize every process, rebuild each canonical
//! resource under the replacement mount inside the tracees, release. The
//! [`Injector`] trait is the contract with the injection backend; [`Swapfd`]
//! is the real one, tests use a recording double.
//!
//! Ordering rules: a process's fs_struct (root, then cwd) is rewired before
//! its per-fd and per-mapping work, and only canonical registry objects ever
//! reach the backend. Processes sharing an fd table, fs_struct or mm with an
//! already-swapped canonical process carry empty resource lists, so sharing
//! propagates the swap for free.

mod remote;
mod swapfd;

use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::process::{FdKind, ProcessMap, ProcessRecord};
use crate::registry::{FileObject, SocketObject};

pub use swapfd::Swapfd;

#[derive(thiserror::Error, Debug)]
pub enum InjectError {
    #[error("ptrace {op} on pid {pid} failed: {errno}")]
    Ptrace {
        op: &'static str,
        pid: Pid,
        errno: Errno,
    },
    #[error("wait on pid {pid} failed: {errno}")]
    Wait { pid: Pid, errno: Errno },
    #[error("pid {pid} stopped unexpectedly: {status:?}")]
    UnexpectedStop { pid: Pid, status: WaitStatus },
    #[error("remote syscall {nr} in pid {pid} failed: {errno}")]
    Remote { nr: i64, pid: Pid, errno: Errno },
    #[error("failed to write into the address space of pid {pid}: {errno}")]
    Mem { pid: Pid, errno: Errno },
    #[error("failed to open replacement {path}: {errno}")]
    OpenReplacement { path: PathBuf, errno: Errno },
    #[error("socket path {path} does not fit in sockaddr_un")]
    PathTooLong { path: PathBuf },
    #[error("resource injection is not supported on this architecture")]
    Unsupported,
}

impl InjectError {
    pub fn errno(&self) -> Errno {
        match self {
            InjectError::Ptrace { errno, .. }
            | InjectError::Wait { errno, .. }
            | InjectError::Remote { errno, .. }
            | InjectError::Mem { errno, .. }
            | InjectError::OpenReplacement { errno, .. } => *errno,
            InjectError::UnexpectedStop { .. } => Errno::EINTR,
            InjectError::PathTooLong { .. } => Errno::ENAMETOOLONG,
            InjectError::Unsupported => Errno::ENOSYS,
        }
    }
}

/// Contract with the injection backend. All per-resource operations act on a
/// stopped, seized tracee.
pub trait Injector {
    /// Parasite-attaches without signalling the task. Precondition: thawed.
    fn seize(&mut self, pid: Pid) -> Result<(), InjectError>;
    /// Detaches; the task resumes where it was stopped.
    fn release(&mut self, pid: Pid) -> Result<(), InjectError>;
    /// Makes a worker-local fd visible inside the tracee; returns the
    /// tracee-side fd.
    fn attach_fd(&mut self, pid: Pid, local: RawFd, flags: OFlag) -> Result<RawFd, InjectError>;
    /// dup2 src over dst in the tracee, then closes src.
    fn dup_into(&mut self, pid: Pid, src: RawFd, dst: RawFd) -> Result<(), InjectError>;
    fn close_fd(&mut self, pid: Pid, fd: RawFd) -> Result<(), InjectError>;
    fn set_pos(&mut self, pid: Pid, fd: RawFd, pos: u64) -> Result<(), InjectError>;
    fn set_flags(&mut self, pid: Pid, fd: RawFd, flags: OFlag) -> Result<(), InjectError>;
    /// Maps the replacement file fixed over the old address range.
    fn remap(&mut self, pid: Pid, map: &ProcessMap, fd: RawFd) -> Result<(), InjectError>;
    fn set_cwd(&mut self, pid: Pid, fd: RawFd) -> Result<(), InjectError>;
    fn set_root(&mut self, pid: Pid, fd: RawFd) -> Result<(), InjectError>;
    /// Builds a fresh socket bound/connected under the replacement root and
    /// dup2s it over the stub-referencing one.
    fn rewire_socket(
        &mut self,
        pid: Pid,
        fd: RawFd,
        sock: &SocketObject,
        root: &Path,
    ) -> Result<(), InjectError>;
}

/// Seizes every inventoried process. Must only run on a thawed task set:
/// the kernel refuses to seize frozen tasks.
pub fn seize_processes(
    injector: &mut dyn Injector,
    processes: &mut [ProcessRecord],
) -> Result<(), InjectError> {
    for record in processes.iter_mut() {
        injector.seize(record.pid)?;
        record.seized = true;
        tracing::debug!(pid = record.pid.as_raw(), "seized");
    }
    Ok(())
}

/// Detaches every seized process; never-seized records are skipped, so the
/// call is safe on any partially-seized inventory. All processes are
/// attempted; the first error is reported.
pub fn release_processes(
    injector: &mut dyn Injector,
    processes: &mut [ProcessRecord],
) -> Result<(), InjectError> {
    let mut first_error = None;
    for record in processes.iter_mut().filter(|r| r.seized) {
        match injector.release(record.pid) {
            Ok(()) => record.seized = false,
            Err(err) => {
                tracing::warn!(pid = record.pid.as_raw(), "failed to release: {err}");
                first_error.get_or_insert(err);
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Rewires every collected resource of every process to the replacement
/// mount rooted at `root`.
pub fn swap_resources(
    injector: &mut dyn Injector,
    processes: &[ProcessRecord],
    root: &Path,
) -> Result<(), InjectError> {
    for record in processes {
        swap_fs(injector, record, root)?;
        swap_fds(injector, record, root)?;
        swap_maps(injector, record, root)?;
    }
    Ok(())
}

fn swap_fs(
    injector: &mut dyn Injector,
    record: &ProcessRecord,
    root: &Path,
) -> Result<(), InjectError> {
    let Some(plan) = &record.fs else {
        return Ok(());
    };

    // Root first: the cwd handle keeps working across the chroot.
    if let Some(obj) = &plan.root {
        let remote = attach_replacement(injector, record.pid, obj, root)?;
        injector.set_root(record.pid, remote)?;
        injector.close_fd(record.pid, remote)?;
    }
    if let Some(obj) = &plan.cwd {
        let remote = attach_replacement(injector, record.pid, obj, root)?;
        injector.set_cwd(record.pid, remote)?;
        injector.close_fd(record.pid, remote)?;
    }
    Ok(())
}

fn swap_fds(
    injector: &mut dyn Injector,
    record: &ProcessRecord,
    root: &Path,
) -> Result<(), InjectError> {
    for pfd in &record.fds {
        match &pfd.kind {
            FdKind::File(obj) => {
                let remote = attach_replacement(injector, record.pid, obj, root)?;
                injector.set_pos(record.pid, remote, obj.pos)?;
                injector.dup_into(record.pid, remote, pfd.fd)?;
            }
            FdKind::Fifo(obj) => {
                // The worker-local O_RDWR end guarantees both a reader and a
                // writer exist, so the non-blocking reopen in the tracee
                // cannot fail with ENXIO; blocking behavior is restored
                // afterwards.
                let local = ensure_replacement(
                    obj,
                    root,
                    OFlag::O_RDWR | OFlag::O_NONBLOCK | OFlag::O_CLOEXEC,
                )?;
                let remote =
                    injector.attach_fd(record.pid, local, obj.flags | OFlag::O_NONBLOCK)?;
                injector.dup_into(record.pid, remote, pfd.fd)?;
                injector.set_flags(record.pid, pfd.fd, obj.flags)?;
            }
            FdKind::Socket(sock) => {
                injector.rewire_socket(record.pid, pfd.fd, sock, root)?;
            }
        }
    }
    Ok(())
}

fn swap_maps(
    injector: &mut dyn Injector,
    record: &ProcessRecord,
    root: &Path,
) -> Result<(), InjectError> {
    for map in &record.maps {
        let remote = attach_replacement(injector, record.pid, &map.file, root)?;
        injector.remap(record.pid, map, remote)?;
        injector.close_fd(record.pid, remote)?;
    }
    Ok(())
}

fn attach_replacement(
    injector: &mut dyn Injector,
    pid: Pid,
    obj: &FileObject,
    root: &Path,
) -> Result<RawFd, InjectError> {
    let local = ensure_replacement(obj, root, obj.flags | OFlag::O_CLOEXEC)?;
    injector.attach_fd(pid, local, obj.flags)
}

/// Opens the replacement once per canonical object and caches the fd on it.
fn ensure_replacement(
    obj: &FileObject,
    root: &Path,
    open_flags: OFlag,
) -> Result<RawFd, InjectError> {
    if let Some(fd) = obj.replacement_fd() {
        return Ok(fd);
    }

    let path = root.join(&obj.rel_path);
    let fd = nix::fcntl::open(&path, open_flags, Mode::empty()).map_err(|errno| {
        InjectError::OpenReplacement {
            path: path.clone(),
            errno,
        }
    })?;
    tracing::trace!(path = %path.display(), fd, "opened replacement");
    Ok(obj.store_replacement(unsafe { OwnedFd::from_raw_fd(fd) }))
}
