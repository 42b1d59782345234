//! The resource swap orchestrator.
//!
//! Sequencing is everything here:
//!
//! 1. lock and freeze the container's freezer cgroup, so the task set
//!    cannot change under the inventory;
//! 2. resolve the stub's identity inside the container's mount namespace;
//! 3. fork a single worker into the container's pid namespace. It reads the
//!    task list (virtual pids), enters mnt+net, switches the stub's
//!    mountpoints over to the real filesystem and builds the inventory.
//!    The proxy-mode mountpoint handle and the per-path handles from the
//!    bind swap live in this worker until every process has been released,
//!    so the detached stub superblock keeps proxying stragglers for the
//!    whole injection window;
//! 4. thaw through the host's cgroupfs and only then seize: the kernel
//!    refuses to seize frozen tasks;
//! 5. inject replacements, release, unlock, tear the staging views down.
//!
//! The user namespace is never re-entered: inventory needs map_files
//! access. On any failure the cgroup is thawed and unlocked and every
//! seized process released; the first error wins.

use std::fs::File;
use std::path::{Path, PathBuf};

use libfreezer::{FreezerCgroup, FreezerError, WrappedIoError};
use nix::errno::Errno;
use nix::mount::MsFlags;
use nix::sched::CloneFlags;
use nix::unistd::{self, Pid};

use crate::exec::{self, run_in_container, ExecError};
use crate::kcmp::KcmpError;
use crate::mount::{
    hold_mountpoint, prepare_staging, resolve_stub_mount, staging_root, swap_mountpoints,
    teardown_staging, MountError, StubMount,
};
use crate::namespaces::{NsError, NsSet};
use crate::process::{collect_processes, InventoryError};
use crate::registry::Registry;
use crate::stub::{self, StubError};
use crate::swap::{
    release_processes, seize_processes, swap_resources, InjectError, Swapfd,
};

const VE_CGROUP_ROOT: &str = "/sys/fs/cgroup/ve";

/// Everything a `replace` request carries: which stub to displace and what
/// to mount in its stead.
#[derive(Debug, Clone)]
pub struct ReplaceJob {
    pub mount_id: String,
    pub fstype: String,
    pub flags: MsFlags,
    pub source: String,
    pub options: Option<String>,
    pub work_dir: PathBuf,
    pub stub_socket: Option<PathBuf>,
}

/// The container the stub lives in: a pid whose namespaces to join, the
/// freezer cgroup holding its tasks, and the OpenVZ container id when the
/// host has a `ve` hierarchy.
#[derive(Debug, Clone)]
pub struct ContainerContext {
    pub ns_pid: Option<Pid>,
    pub freezer_cgroup: PathBuf,
    pub ovz_id: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum ReplaceError {
    #[error("freezer: {0}")]
    Freezer(#[from] FreezerError),
    #[error("namespace: {0}")]
    Ns(#[from] NsError),
    #[error("worker: {0}")]
    Exec(#[from] ExecError),
    #[error("mount: {0}")]
    Mount(#[from] MountError),
    #[error("inventory: {0}")]
    Inventory(#[from] InventoryError),
    #[error("kcmp: {0}")]
    Kcmp(#[from] KcmpError),
    #[error("injection: {0}")]
    Inject(#[from] InjectError),
    #[error("stub: {0}")]
    Stub(#[from] StubError),
    #[error("failed to join ve cgroup: {0}")]
    VeCgroup(Errno),
}

impl ReplaceError {
    /// The errno reported on the control socket and carried in worker exit
    /// statuses.
    pub fn errno(&self) -> Errno {
        match self {
            ReplaceError::Freezer(err) => freezer_errno(err),
            ReplaceError::Ns(err) => err.errno(),
            ReplaceError::Exec(err) => err.errno(),
            ReplaceError::Mount(err) => err.errno(),
            ReplaceError::Inventory(err) => err.errno(),
            ReplaceError::Kcmp(err) => err.errno(),
            ReplaceError::Inject(err) => err.errno(),
            ReplaceError::Stub(err) => err.errno(),
            ReplaceError::VeCgroup(errno) => *errno,
        }
    }
}

fn freezer_errno(err: &FreezerError) -> Errno {
    match err {
        FreezerError::WrappedIo(io) => match io {
            WrappedIoError::Open { err, .. }
            | WrappedIoError::Write { err, .. }
            | WrappedIoError::Read { err, .. } => {
                err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
            }
        },
        FreezerError::Lock { errno, .. } => *errno,
        FreezerError::UnexpectedState { .. } => Errno::EIO,
        FreezerError::UnableToFreeze { .. } => Errno::EBUSY,
        FreezerError::InvalidTask { .. } => Errno::EINVAL,
    }
}

/// Entry point for one replacement job. Returns once every reference to the
/// stub has been rewired, or with the first error after best-effort cleanup.
pub fn replace_resources(job: &ReplaceJob, ctx: &ContainerContext) -> Result<(), ReplaceError> {
    tracing::info!(
        mount = %job.mount_id,
        fstype = %job.fstype,
        source = %job.source,
        "starting resource replacement"
    );

    let ct_ns = ctx.ns_pid.map(NsSet::open).transpose()?;
    let cur_ns = NsSet::open(unistd::getpid())?;

    if let Some(ve_id) = &ctx.ovz_id {
        join_ve_cgroup(ve_id)?;
    }

    let mut freezer = FreezerCgroup::new(&ctx.freezer_cgroup);
    freezer.lock()?;

    let result = frozen_swap(job, &freezer, ct_ns.as_ref(), &cur_ns);

    // Thawed and unlocked on every path; a failed thaw must not shadow the
    // primary error.
    let thaw = freezer.thaw();
    freezer.unlock();

    let result = match (result, thaw) {
        (Err(err), _) => Err(err),
        (Ok(()), Err(err)) => Err(err.into()),
        (Ok(()), Ok(())) => Ok(()),
    };

    if result.is_ok() {
        cleanup_staging(job, ct_ns.as_ref());
        if let Some(sock) = &job.stub_socket {
            if let Err(err) = stub::send_release(sock) {
                tracing::warn!("failed to release stub: {err}");
            }
        }
        tracing::info!(mount = %job.mount_id, "resource replacement complete");
    }
    result
}

/// Detaches the staging views and removes their directory once the job is
/// complete; the bind mounts at the stub paths keep the replacement
/// filesystem alive. Cleanup errors are logged, never propagated.
fn cleanup_staging(job: &ReplaceJob, ct_ns: Option<&NsSet>) {
    let outcome = run_in_container(ct_ns, CloneFlags::CLONE_NEWNS, None, || {
        match teardown_staging(&job.work_dir, &job.fstype) {
            Ok(()) => 0,
            Err(err) => {
                tracing::warn!("failed to tear down staging mounts: {err}");
                err.errno() as i32
            }
        }
    });
    if let Err(err) = outcome {
        tracing::warn!("staging teardown worker failed: {err}");
    }
}

fn frozen_swap(
    job: &ReplaceJob,
    freezer: &FreezerCgroup,
    ct_ns: Option<&NsSet>,
    cur_ns: &NsSet,
) -> Result<(), ReplaceError> {
    freezer.freeze()?;

    let stub = resolve_in_container(job, ct_ns, cur_ns)?;
    tracing::debug!(
        mountpoint = %stub.mountpoint.display(),
        paths = stub.paths.len(),
        dev = stub.dev,
        "resolved stub mount"
    );

    // The pid namespace join only affects children; the worker forked next
    // owns everything from the mount swap through release.
    if let Some(ns) = ct_ns {
        ns.enter(CloneFlags::CLONE_NEWPID)?;
    }
    let outcome = run_in_container(None, CloneFlags::empty(), None, || {
        match run_worker(job, freezer, ct_ns, cur_ns, &stub) {
            Ok(()) => 0,
            Err(err) => {
                tracing::error!("replacement worker failed: {err}");
                err.errno() as i32
            }
        }
    });
    if ct_ns.is_some() {
        // Later jobs fork from this process again; put its child pid
        // namespace back.
        if let Err(err) = cur_ns.enter(CloneFlags::CLONE_NEWPID) {
            tracing::warn!("failed to restore pid namespace: {err}");
        }
    }

    outcome.map_err(Into::into)
}

fn resolve_in_container(
    job: &ReplaceJob,
    ct_ns: Option<&NsSet>,
    cur_ns: &NsSet,
) -> Result<StubMount, ReplaceError> {
    match ct_ns {
        Some(ns) => {
            ns.enter(CloneFlags::CLONE_NEWNS)?;
            let resolved = resolve_stub_mount(&job.mount_id);
            // Failing to come home poisons everything after; it outranks a
            // resolution failure.
            cur_ns.enter(CloneFlags::CLONE_NEWNS)?;
            Ok(resolved?)
        }
        None => Ok(resolve_stub_mount(&job.mount_id)?),
    }
}

/// Keeps the swapped-away stub reachable: the proxy handle on its original
/// mountpoint plus the per-path handles opened before each lazy unmount.
/// Dropped by the worker only after every process has been released.
struct MountGuard {
    _anchor: File,
    _held: Vec<File>,
}

/// Runs in the container's mount namespace: stage the real filesystem, put
/// the stub into proxy mode and bind the replacement over its paths.
fn mount_swap(job: &ReplaceJob, stub: &StubMount) -> Result<MountGuard, ReplaceError> {
    let root = prepare_staging(
        &job.work_dir,
        &job.fstype,
        &job.source,
        job.flags,
        job.options.as_deref(),
    )?;

    let anchor = hold_mountpoint(&stub.mountpoint)?;
    if let Some(sock) = &job.stub_socket {
        stub::send_proxy_mode(sock, &root)?;
    }

    let held = swap_mountpoints(&stub.paths, &root)?;
    Ok(MountGuard {
        _anchor: anchor,
        _held: held,
    })
}

/// Runs as a worker inside the container's pid namespace.
fn run_worker(
    job: &ReplaceJob,
    freezer: &FreezerCgroup,
    ct_ns: Option<&NsSet>,
    cur_ns: &NsSet,
    stub: &StubMount,
) -> Result<(), ReplaceError> {
    // Virtual pids: this process was born into the container's pid
    // namespace, and ptrace wants the pids it sees there.
    let pids = freezer.tasks()?;
    tracing::debug!(tasks = pids.len(), "read freezer task list");

    if let Some(ns) = ct_ns {
        ns.enter(CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWNET)?;
    }

    // The guard outlives the release loop below, so the detached stub can
    // proxy stragglers until the last process is rewired.
    let _mounts = mount_swap(job, stub)?;

    let mut registry = Registry::new();
    let mut processes = collect_processes(&pids, stub, &mut registry)?;

    // The freezer path resolves through the host's cgroupfs; hop back to
    // thaw, then return for the injection work.
    if ct_ns.is_some() {
        cur_ns.enter(CloneFlags::CLONE_NEWNS)?;
    }
    freezer.thaw()?;
    if let Some(ns) = ct_ns {
        ns.enter(CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWNET)?;
    }

    let root = staging_root(&job.work_dir, &job.fstype);
    let mut injector = Swapfd::new();

    let swapped = seize_processes(&mut injector, &mut processes)
        .and_then(|()| swap_resources(&mut injector, &processes, &root));
    let released = release_processes(&mut injector, &mut processes);

    swapped?;
    released?;
    Ok(())
}

fn join_ve_cgroup(ve_id: &str) -> Result<(), ReplaceError> {
    let root = Path::new(VE_CGROUP_ROOT);
    if !root.exists() {
        tracing::warn!(ve_id, "no ve cgroup hierarchy, skipping move");
        return Ok(());
    }
    exec::join_cgroup(root).map_err(ReplaceError::VeCgroup)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use serial_test::serial;
    use std::fs;

    fn fixture_cgroup(dir: &Path) -> Result<()> {
        fs::write(dir.join("freezer.state"), "")?;
        fs::write(dir.join("tasks"), "")?;
        Ok(())
    }

    fn job(work_dir: &Path) -> ReplaceJob {
        ReplaceJob {
            mount_id: "no-such-stub".into(),
            fstype: "nfs".into(),
            flags: MsFlags::empty(),
            source: "server:/export".into(),
            options: None,
            work_dir: work_dir.to_path_buf(),
            stub_socket: None,
        }
    }

    #[test]
    #[serial]
    fn test_abort_leaves_cgroup_thawed_and_unlocked() -> Result<()> {
        let cgroup = tempfile::tempdir()?;
        let work = tempfile::tempdir()?;
        fixture_cgroup(cgroup.path())?;

        let ctx = ContainerContext {
            ns_pid: None,
            freezer_cgroup: cgroup.path().to_path_buf(),
            ovz_id: None,
        };

        // The stub mount cannot resolve, so the job aborts after freezing.
        let err = replace_resources(&job(work.path()), &ctx).unwrap_err();
        assert_eq!(err.errno(), Errno::ENOENT);

        let state = fs::read_to_string(cgroup.path().join("freezer.state"))?;
        assert_eq!(state, "THAWED");

        // Lock must have been dropped: a fresh handle can take it.
        let mut probe = FreezerCgroup::new(cgroup.path());
        assert!(probe.try_lock()?);
        probe.unlock();
        Ok(())
    }

    #[test]
    fn test_errno_mapping_prefers_underlying_errno() {
        let err = ReplaceError::Exec(ExecError::Worker(Errno::ENOSPC));
        assert_eq!(err.errno(), Errno::ENOSPC);

        let err = ReplaceError::VeCgroup(Errno::EACCES);
        assert_eq!(err.errno(), Errno::EACCES);

        let err = ReplaceError::Freezer(FreezerError::UnableToFreeze {
            path: PathBuf::from("/sys/fs/cgroup/freezer/ct"),
        });
        assert_eq!(err.errno(), Errno::EBUSY);
    }
}
