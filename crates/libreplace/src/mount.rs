//! Mount-side half of a replacement job: resolving the stub's mount
//! identity, staging the real filesystem under the work directory and
//! switching every stub mountpoint over to it.

use std::fs::{self, File};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{cmp, thread};

use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::makedev;
use procfs::process::Process;

// Module loading on the host races with mounts requested from inside a
// container; only these two errnos are known to be transient.
const MOUNT_RETRY_INITIAL: Duration = Duration::from_secs(1);
const MOUNT_RETRY_MAX: Duration = Duration::from_secs(32);

/// Name of the directory inside the staging tmpfs that receives the real
/// filesystem.
const STAGING_MOUNT_DIR: &str = "mnt";

#[derive(thiserror::Error, Debug)]
pub enum MountError {
    #[error("failed to read mountinfo: {0}")]
    Proc(#[from] procfs::ProcError),
    #[error("no mount with source {id:?} in this mount namespace")]
    StubNotFound { id: String },
    #[error("malformed device number {majmin:?} for mount {id:?}")]
    BadDevice { id: String, majmin: String },
    #[error("failed to create {path}: {err}")]
    CreateDir { path: PathBuf, err: std::io::Error },
    #[error("failed to remove {path}: {err}")]
    RemoveDir { path: PathBuf, err: std::io::Error },
    #[error("failed to open {path}: {err}")]
    Open { path: PathBuf, err: std::io::Error },
    #[error("failed to mount {target}: {errno}")]
    Mount { target: PathBuf, errno: Errno },
    #[error("failed to unmount {target}: {errno}")]
    Umount { target: PathBuf, errno: Errno },
}

impl MountError {
    pub fn errno(&self) -> Errno {
        match self {
            MountError::Proc(_) => Errno::EIO,
            MountError::StubNotFound { .. } => Errno::ENOENT,
            MountError::BadDevice { .. } => Errno::EINVAL,
            MountError::CreateDir { err, .. }
            | MountError::RemoveDir { err, .. }
            | MountError::Open { err, .. } => {
                err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
            }
            MountError::Mount { errno, .. } | MountError::Umount { errno, .. } => *errno,
        }
    }
}

/// The stub's identity inside the container mount namespace: its device
/// number plus every path it is reachable under (the original mountpoint
/// first, then bind mounts of it). References are matched by device or by
/// path, whichever identifies them.
#[derive(Debug, Clone)]
pub struct StubMount {
    pub id: String,
    pub mnt_id: i32,
    pub dev: u64,
    pub mountpoint: PathBuf,
    pub paths: Vec<PathBuf>,
}

impl StubMount {
    pub fn matches_dev(&self, dev: u64) -> bool {
        self.dev == dev
    }

    /// Strips the longest matching mountpath prefix, yielding the path
    /// relative to the stub root.
    pub fn rel_of(&self, path: &Path) -> Option<PathBuf> {
        self.paths
            .iter()
            .filter_map(|base| path.strip_prefix(base).ok())
            .min_by_key(|rel| rel.as_os_str().len())
            .map(Path::to_path_buf)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.iter().any(|base| path.starts_with(base))
    }
}

/// Looks the stub up by its mount source in the current mount namespace.
/// Must run inside the container's mount namespace, and before the swap
/// detaches the stub from the mount table.
pub fn resolve_stub_mount(id: &str) -> Result<StubMount, MountError> {
    let mounts: Vec<_> = Process::myself()?.mountinfo()?.into_iter().collect();

    let primary = mounts
        .iter()
        .find(|m| m.mount_source.as_deref() == Some(id))
        .ok_or_else(|| MountError::StubNotFound { id: id.to_owned() })?;

    let dev = parse_majmin(id, &primary.majmin)?;
    let mountpoint = primary.mount_point.clone();

    // Bind mounts of the stub share its device; keep the principal
    // mountpoint first so relative paths prefer it.
    let mut paths = vec![mountpoint.clone()];
    for m in &mounts {
        if m.majmin == primary.majmin && m.mount_point != mountpoint {
            paths.push(m.mount_point.clone());
        }
    }

    Ok(StubMount {
        id: id.to_owned(),
        mnt_id: primary.mnt_id,
        dev,
        mountpoint,
        paths,
    })
}

fn parse_majmin(id: &str, majmin: &str) -> Result<u64, MountError> {
    let bad = || MountError::BadDevice {
        id: id.to_owned(),
        majmin: majmin.to_owned(),
    };
    let (major, minor) = majmin.split_once(':').ok_or_else(bad)?;
    let major = major.trim().parse::<u64>().map_err(|_| bad())?;
    let minor = minor.trim().parse::<u64>().map_err(|_| bad())?;
    Ok(makedev(major, minor))
}

/// Where the real filesystem ends up below the work directory.
pub fn staging_root(work_dir: &Path, fstype: &str) -> PathBuf {
    work_dir.join(fstype).join(STAGING_MOUNT_DIR)
}

/// Mounts a small tmpfs at `<work_dir>/<fstype>` and the real filesystem
/// under it, retrying transient failures. Returns the replacement root.
pub fn prepare_staging(
    work_dir: &Path,
    fstype: &str,
    source: &str,
    flags: MsFlags,
    options: Option<&str>,
) -> Result<PathBuf, MountError> {
    let staging = work_dir.join(fstype);
    fs::create_dir_all(&staging).map_err(|err| MountError::CreateDir {
        path: staging.clone(),
        err,
    })?;

    mount(
        Some("tmpfs"),
        &staging,
        Some("tmpfs"),
        MsFlags::empty(),
        Some("size=1m"),
    )
    .map_err(|errno| MountError::Mount {
        target: staging.clone(),
        errno,
    })?;

    let root = staging.join(STAGING_MOUNT_DIR);
    fs::create_dir_all(&root).map_err(|err| MountError::CreateDir {
        path: root.clone(),
        err,
    })?;

    mount_loop(source, &root, fstype, flags, options)?;
    Ok(root)
}

/// Mounts with retry on the two errnos module-loading races produce,
/// indefinitely, with delays doubling from 1s and capped at 32s.
pub fn mount_loop(
    source: &str,
    target: &Path,
    fstype: &str,
    flags: MsFlags,
    options: Option<&str>,
) -> Result<(), MountError> {
    retry_transient(target, || {
        mount(Some(source), target, Some(fstype), flags, options)
    })
}

fn retry_transient(
    target: &Path,
    mut mount_fn: impl FnMut() -> nix::Result<()>,
) -> Result<(), MountError> {
    let mut delay = MOUNT_RETRY_INITIAL;
    loop {
        match mount_fn() {
            Ok(()) => return Ok(()),
            Err(errno @ (Errno::EPROTONOSUPPORT | Errno::EPERM)) => {
                tracing::warn!(
                    target = %target.display(),
                    %errno,
                    delay_secs = delay.as_secs(),
                    "transient mount failure, retrying"
                );
                thread::sleep(delay);
                delay = next_delay(delay);
            }
            Err(errno) => {
                return Err(MountError::Mount {
                    target: target.to_path_buf(),
                    errno,
                })
            }
        }
    }
}

fn next_delay(delay: Duration) -> Duration {
    cmp::min(delay * 2, MOUNT_RETRY_MAX)
}

/// Undoes `prepare_staging` once a job is complete. The bind mounts at the
/// stub paths keep the replacement filesystem alive, so the staging views
/// can be lazily detached and their directory removed. Must run in the same
/// mount namespace the staging was prepared in.
pub fn teardown_staging(work_dir: &Path, fstype: &str) -> Result<(), MountError> {
    let staging = work_dir.join(fstype);
    let root = staging.join(STAGING_MOUNT_DIR);

    umount2(&root, MntFlags::MNT_DETACH).map_err(|errno| MountError::Umount {
        target: root,
        errno,
    })?;
    umount2(&staging, MntFlags::MNT_DETACH).map_err(|errno| MountError::Umount {
        target: staging.clone(),
        errno,
    })?;
    fs::remove_dir_all(&staging).map_err(|err| MountError::RemoveDir {
        path: staging,
        err,
    })?;
    Ok(())
}

/// Opens a mountpoint handle that survives the lazy unmount: as long as it
/// is held, the detached stub superblock stays alive and can keep proxying
/// stragglers.
pub fn hold_mountpoint(path: &Path) -> Result<File, MountError> {
    fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECTORY)
        .open(path)
        .map_err(|err| MountError::Open {
            path: path.to_path_buf(),
            err,
        })
}

/// For each stub path: lazy-unmount it and bind the replacement root over
/// it. Returns the held mountpoint handles; the caller keeps them open until
/// the whole swap is over.
pub fn swap_mountpoints(paths: &[PathBuf], replacement: &Path) -> Result<Vec<File>, MountError> {
    let mut held = Vec::with_capacity(paths.len());
    for path in paths {
        held.push(hold_mountpoint(path)?);

        umount2(path, MntFlags::MNT_DETACH).map_err(|errno| MountError::Umount {
            target: path.clone(),
            errno,
        })?;

        mount(
            Some(replacement),
            path,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|errno| MountError::Mount {
            target: path.clone(),
            errno,
        })?;

        tracing::info!(
            from = %path.display(),
            to = %replacement.display(),
            "bind-mounted replacement over stub path"
        );
    }
    Ok(held)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut delay = MOUNT_RETRY_INITIAL;
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(delay.as_secs());
            delay = next_delay(delay);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 32, 32]);
    }

    #[test]
    fn test_retry_only_on_transient_errnos() {
        let mut calls = 0;
        let err = retry_transient(Path::new("/nonexistent"), || {
            calls += 1;
            Err(Errno::ENODEV)
        })
        .unwrap_err();

        assert_eq!(calls, 1);
        assert!(matches!(
            err,
            MountError::Mount {
                errno: Errno::ENODEV,
                ..
            }
        ));
    }

    #[test]
    fn test_retry_recovers_after_transient_failures() {
        // Two EPROTONOSUPPORT failures cost 1s + 2s of backoff.
        let started = Instant::now();
        let mut calls = 0;
        retry_transient(Path::new("/nonexistent"), || {
            calls += 1;
            if calls <= 2 {
                Err(Errno::EPROTONOSUPPORT)
            } else {
                Ok(())
            }
        })
        .unwrap();

        assert_eq!(calls, 3);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[test]
    fn test_teardown_requires_mounted_staging() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("nfs").join(STAGING_MOUNT_DIR)).unwrap();

        // Nothing is mounted here, so the first detach must fail; the
        // directory stays put.
        let err = teardown_staging(tmp.path(), "nfs").unwrap_err();
        assert!(matches!(err, MountError::Umount { .. }));
        assert!(tmp.path().join("nfs").exists());
    }

    #[test]
    fn test_rel_of_prefers_principal_mountpoint() {
        let stub = StubMount {
            id: "sid".into(),
            mnt_id: 42,
            dev: makedev(0, 66),
            mountpoint: PathBuf::from("/mnt/s"),
            paths: vec![PathBuf::from("/mnt/s"), PathBuf::from("/opt/alias/s")],
        };

        assert_eq!(
            stub.rel_of(Path::new("/mnt/s/data/file")),
            Some(PathBuf::from("data/file"))
        );
        assert_eq!(
            stub.rel_of(Path::new("/opt/alias/s/data/file")),
            Some(PathBuf::from("data/file"))
        );
        assert_eq!(stub.rel_of(Path::new("/var/tmp/file")), None);
        assert!(stub.contains(Path::new("/opt/alias/s")));
        assert!(!stub.contains(Path::new("/opt/alias")));
    }
}
