//! Namespace handles for a target process.
//!
//! The handles are opened once from `/proc/<pid>/ns/*` and remain valid even
//! after the process they were taken from exits; joins go through the
//! handles, never through the pid. Entering the pid namespace only affects
//! children forked afterwards, so callers fork a worker after `enter` when
//! they need a pid-namespace view. The user namespace is opened but never
//! re-entered while a stub inventory runs: after a user-namespace join
//! `/proc/<pid>/map_files` would no longer be accessible.

use std::fs::File;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::sched::{setns, CloneFlags};
use nix::unistd::Pid;

// Mount last: every /proc path used to open the other handles resolves in
// the original mount namespace.
static ORDERED_NAMESPACES: &[(CloneFlags, &str)] = &[
    (CloneFlags::CLONE_NEWUSER, "user"),
    (CloneFlags::CLONE_NEWPID, "pid"),
    (CloneFlags::CLONE_NEWUTS, "uts"),
    (CloneFlags::CLONE_NEWIPC, "ipc"),
    (CloneFlags::CLONE_NEWNET, "net"),
    (CloneFlags::CLONE_NEWNS, "mnt"),
];

#[derive(thiserror::Error, Debug)]
pub enum NsError {
    #[error("failed to open {path}: {err}")]
    Open { path: PathBuf, err: std::io::Error },
    #[error("failed to enter {kind} namespace of pid {pid}: {errno}")]
    Enter {
        kind: &'static str,
        pid: i32,
        errno: Errno,
    },
}

impl NsError {
    pub fn errno(&self) -> Errno {
        match self {
            NsError::Open { err, .. } => {
                err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
            }
            NsError::Enter { errno, .. } => *errno,
        }
    }
}

/// One open handle per namespace kind of a single process. Handles close on
/// drop, on success and failure paths alike.
#[derive(Debug)]
pub struct NsSet {
    pid: Pid,
    handles: Vec<(CloneFlags, &'static str, File)>,
}

impl NsSet {
    pub fn open(pid: Pid) -> Result<Self, NsError> {
        let mut handles = Vec::with_capacity(ORDERED_NAMESPACES.len());
        for (flag, name) in ORDERED_NAMESPACES {
            let path = PathBuf::from(format!("/proc/{}/ns/{}", pid.as_raw(), name));
            let file = File::open(&path).map_err(|err| NsError::Open { path, err })?;
            handles.push((*flag, *name, file));
        }
        Ok(NsSet { pid, handles })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Joins the subset of namespaces selected by `mask`, in fixed order.
    pub fn enter(&self, mask: CloneFlags) -> Result<(), NsError> {
        for (flag, name, file) in &self.handles {
            if !mask.contains(*flag) {
                continue;
            }
            tracing::trace!(pid = self.pid.as_raw(), ns = name, "joining namespace");
            setns(file, *flag).map_err(|errno| NsError::Enter {
                kind: name,
                pid: self.pid.as_raw(),
                errno,
            })?;
        }
        Ok(())
    }
}
