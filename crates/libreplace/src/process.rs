//! Process inventory.
//!
//! Runs inside the container (target pid + mnt + net namespaces, original
//! user namespace) while the freezer holds the task set still. For every
//! task in the freezer cgroup it records which fds, memory mappings, working
//! directories and roots still reference the stub, folding everything
//! through the registry so each underlying kernel object is collected once.

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::stat::{self, SFlag};
use nix::unistd::Pid;
use procfs::process::{FDTarget, MMapPath, MMPermissions, Process};

use crate::kcmp::KcmpError;
use crate::mount::StubMount;
use crate::registry::{Collected, FileObject, Registry, SocketObject};

// PF_KTHREAD in /proc/<pid>/stat flags; the stable kernel-thread indicator.
const PF_KTHREAD: u64 = 0x0020_0000;

// __SO_ACCEPTCON in the Flags column of /proc/net/unix.
const UNIX_FLAG_LISTENING: u32 = 0x0001_0000;

#[derive(thiserror::Error, Debug)]
pub enum InventoryError {
    #[error(transparent)]
    Kcmp(#[from] KcmpError),
    #[error("failed to read /proc: {0}")]
    Proc(#[from] procfs::ProcError),
    #[error("failed to stat {path}: {errno}")]
    Stat { path: PathBuf, errno: Errno },
    #[error("failed to read {path}: {err}")]
    Io { path: PathBuf, err: std::io::Error },
    #[error("malformed fdinfo for pid {pid} fd {fd}")]
    FdInfo { pid: i32, fd: RawFd },
    #[error("pid {pid} references the stub device through {path}, which is under none of its mountpaths")]
    UnresolvedPath { pid: i32, path: PathBuf },
}

impl InventoryError {
    pub fn errno(&self) -> Errno {
        match self {
            InventoryError::Kcmp(err) => err.errno(),
            InventoryError::Proc(_) => Errno::ESRCH,
            InventoryError::Stat { errno, .. } => *errno,
            InventoryError::Io { err, .. } => {
                err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
            }
            InventoryError::FdInfo { .. } | InventoryError::UnresolvedPath { .. } => Errno::EINVAL,
        }
    }
}

/// One stub-referencing fd of a process. The payload is always the canonical
/// registry object, so replacements are prepared once no matter how many
/// processes hold the description.
#[derive(Debug)]
pub struct ProcessFd {
    pub fd: RawFd,
    pub kind: FdKind,
}

#[derive(Debug)]
pub enum FdKind {
    File(Rc<FileObject>),
    Fifo(Rc<FileObject>),
    Socket(Rc<SocketObject>),
}

/// A stub-backed file mapping to be placed anew over the same address range.
#[derive(Debug)]
pub struct ProcessMap {
    pub start: u64,
    pub end: u64,
    pub prot: i32,
    pub shared: bool,
    pub offset: u64,
    pub file: Rc<FileObject>,
}

/// Working directory and root replacements for one fs_struct.
#[derive(Debug, Default)]
pub struct FsPlan {
    pub cwd: Option<Rc<FileObject>>,
    pub root: Option<Rc<FileObject>>,
}

impl FsPlan {
    fn is_empty(&self) -> bool {
        self.cwd.is_none() && self.root.is_none()
    }
}

#[derive(Debug)]
pub struct ProcessRecord {
    pub pid: Pid,
    pub fds: Vec<ProcessFd>,
    pub maps: Vec<ProcessMap>,
    pub fs: Option<FsPlan>,
    pub fd_table_shared_with: Option<Pid>,
    pub fs_shared_with: Option<Pid>,
    pub mm_shared_with: Option<Pid>,
    pub seized: bool,
}

impl ProcessRecord {
    fn new(pid: Pid) -> Self {
        ProcessRecord {
            pid,
            fds: Vec::new(),
            maps: Vec::new(),
            fs: None,
            fd_table_shared_with: None,
            fs_shared_with: None,
            mm_shared_with: None,
            seized: false,
        }
    }
}

/// Builds the inventory for every task in the list. Kernel threads are
/// skipped; any error on a single process aborts the whole inventory, since
/// a partial replacement is unsafe.
pub fn collect_processes(
    pids: &[Pid],
    stub: &StubMount,
    registry: &mut Registry,
) -> Result<Vec<ProcessRecord>, InventoryError> {
    let sockets = scan_unix_sockets(stub)?;

    let mut records = Vec::with_capacity(pids.len());
    for pid in pids {
        if let Some(record) = collect_one(*pid, stub, registry, &sockets)? {
            records.push(record);
        }
    }

    tracing::info!(
        processes = records.len(),
        fds = registry.fd_entries().len(),
        "inventory complete"
    );
    Ok(records)
}

fn collect_one(
    pid: Pid,
    stub: &StubMount,
    registry: &mut Registry,
    sockets: &HashMap<u64, Rc<SocketObject>>,
) -> Result<Option<ProcessRecord>, InventoryError> {
    let proc = Process::new(pid.as_raw())?;
    let stat = proc.stat()?;
    if u64::from(stat.flags) & PF_KTHREAD != 0 {
        tracing::debug!(pid = pid.as_raw(), comm = %stat.comm, "skipping kernel thread");
        return Ok(None);
    }

    let mut record = ProcessRecord::new(pid);

    match registry.insert_fd_table(pid)? {
        Collected::New(_) => record.fds = collect_fds(&proc, pid, stub, registry, sockets)?,
        Collected::Exists(canonical) => record.fd_table_shared_with = Some(canonical),
    }

    match registry.insert_fs_struct(pid)? {
        Collected::New(_) => record.fs = collect_fs(pid, stub)?,
        Collected::Exists(canonical) => record.fs_shared_with = Some(canonical),
    }

    match registry.insert_mm(pid)? {
        Collected::New(_) => record.maps = collect_maps(&proc, pid, stub, registry)?,
        Collected::Exists(canonical) => record.mm_shared_with = Some(canonical),
    }

    Ok(Some(record))
}

fn collect_fds(
    proc: &Process,
    pid: Pid,
    stub: &StubMount,
    registry: &mut Registry,
    sockets: &HashMap<u64, Rc<SocketObject>>,
) -> Result<Vec<ProcessFd>, InventoryError> {
    let mut fds = Vec::new();

    for fd_info in proc.fd()? {
        let fd_info = fd_info?;
        match fd_info.target {
            FDTarget::Path(ref path) => {
                let path = strip_deleted(path);
                let link = PathBuf::from(format!("/proc/{}/fd/{}", pid.as_raw(), fd_info.fd));
                let st = stat::stat(&link).map_err(|errno| InventoryError::Stat {
                    path: link.clone(),
                    errno,
                })?;

                if !stub.matches_dev(st.st_dev) && !stub.contains(&path) {
                    continue;
                }
                let rel = stub
                    .rel_of(&path)
                    .ok_or_else(|| InventoryError::UnresolvedPath {
                        pid: pid.as_raw(),
                        path: path.clone(),
                    })?;

                let (flags, pos) = read_fdinfo(pid, fd_info.fd)?;
                let obj = FileObject::new(rel, flags, pos);
                let canonical = registry.insert_fd(pid, fd_info.fd, obj)?.into_payload();

                let kind = if SFlag::from_bits_truncate(st.st_mode).contains(SFlag::S_IFIFO) {
                    if registry.insert_fifo(&path) {
                        tracing::debug!(path = %path.display(), "scheduling named pipe");
                    }
                    FdKind::Fifo(canonical)
                } else {
                    FdKind::File(canonical)
                };
                fds.push(ProcessFd {
                    fd: fd_info.fd,
                    kind,
                });
            }
            FDTarget::Socket(ino) => {
                if let Some(sock) = sockets.get(&ino) {
                    let canonical = registry.insert_unix_socket(ino, sock.clone()).into_payload();
                    fds.push(ProcessFd {
                        fd: fd_info.fd,
                        kind: FdKind::Socket(canonical),
                    });
                }
            }
            _ => {}
        }
    }

    Ok(fds)
}

fn collect_fs(pid: Pid, stub: &StubMount) -> Result<Option<FsPlan>, InventoryError> {
    let mut plan = FsPlan::default();

    for (name, slot) in [("cwd", &mut plan.cwd), ("root", &mut plan.root)] {
        let link = PathBuf::from(format!("/proc/{}/{}", pid.as_raw(), name));
        let target = std::fs::read_link(&link).map_err(|err| InventoryError::Io {
            path: link,
            err,
        })?;
        let target = strip_deleted(&target);
        if stub.contains(&target) {
            if let Some(rel) = stub.rel_of(&target) {
                *slot = Some(FileObject::new(
                    rel,
                    OFlag::O_DIRECTORY | OFlag::O_RDONLY,
                    0,
                ));
            }
        }
    }

    Ok((!plan.is_empty()).then_some(plan))
}

fn collect_maps(
    proc: &Process,
    pid: Pid,
    stub: &StubMount,
    registry: &mut Registry,
) -> Result<Vec<ProcessMap>, InventoryError> {
    let mut maps = Vec::new();

    for map in proc.maps()? {
        let MMapPath::Path(ref path) = map.pathname else {
            continue;
        };
        let path = strip_deleted(path);
        let (start, end) = map.address;

        // map_files entries exist exactly for file-backed ranges and stat
        // through to the mapped file even after unlink.
        let entry = PathBuf::from(format!(
            "/proc/{}/map_files/{:x}-{:x}",
            pid.as_raw(),
            start,
            end
        ));
        let st = match stat::stat(&entry) {
            Ok(st) => Some(st),
            Err(Errno::ENOENT) => continue,
            // map_files may want more privilege than the worker has; the
            // path filter still applies.
            Err(Errno::EPERM | Errno::EACCES) => None,
            Err(errno) => return Err(InventoryError::Stat { path: entry, errno }),
        };

        let dev_matches = st.is_some_and(|st| stub.matches_dev(st.st_dev));
        if !dev_matches && !stub.contains(&path) {
            continue;
        }
        let rel = stub
            .rel_of(&path)
            .ok_or_else(|| InventoryError::UnresolvedPath {
                pid: pid.as_raw(),
                path: path.clone(),
            })?;

        let shared = map.perms.contains(MMPermissions::SHARED);
        let writable = map.perms.contains(MMPermissions::WRITE);
        // Private writable mappings are copy-on-write; the backing file only
        // needs to be readable.
        let flags = if shared && writable {
            OFlag::O_RDWR
        } else {
            OFlag::O_RDONLY
        };

        let mut prot = 0;
        if map.perms.contains(MMPermissions::READ) {
            prot |= libc::PROT_READ;
        }
        if writable {
            prot |= libc::PROT_WRITE;
        }
        if map.perms.contains(MMPermissions::EXECUTE) {
            prot |= libc::PROT_EXEC;
        }

        let obj = FileObject::new(rel, flags, 0);
        let canonical = registry.insert_mapping(&path, flags, obj).into_payload();

        maps.push(ProcessMap {
            start,
            end,
            prot,
            shared,
            offset: map.offset,
            file: canonical,
        });
    }

    Ok(maps)
}

/// Reads open flags (octal) and file position out of /proc/<pid>/fdinfo.
fn read_fdinfo(pid: Pid, fd: RawFd) -> Result<(OFlag, u64), InventoryError> {
    let path = PathBuf::from(format!("/proc/{}/fdinfo/{}", pid.as_raw(), fd));
    let content =
        std::fs::read_to_string(&path).map_err(|err| InventoryError::Io { path, err })?;

    let mut pos = None;
    let mut flags = None;
    for line in content.lines() {
        if let Some(value) = line.strip_prefix("pos:") {
            pos = value.trim().parse::<u64>().ok();
        } else if let Some(value) = line.strip_prefix("flags:") {
            flags = i32::from_str_radix(value.trim(), 8).ok();
        }
    }

    match (flags, pos) {
        (Some(flags), Some(pos)) => Ok((OFlag::from_bits_truncate(flags), pos)),
        _ => Err(InventoryError::FdInfo {
            pid: pid.as_raw(),
            fd,
        }),
    }
}

/// Readlink output for unlinked files carries a marker suffix.
fn strip_deleted(path: &Path) -> PathBuf {
    match path.to_str().and_then(|s| s.strip_suffix(" (deleted)")) {
        Some(stripped) => PathBuf::from(stripped),
        None => path.to_path_buf(),
    }
}

/// Indexes /proc/net/unix by inode, keeping the sockets whose bound path
/// lies below the stub. Rows without a filesystem path (abstract or
/// unbound sockets) cannot reference the stub and are ignored.
fn scan_unix_sockets(
    stub: &StubMount,
) -> Result<HashMap<u64, Rc<SocketObject>>, InventoryError> {
    let path = PathBuf::from("/proc/net/unix");
    let content =
        std::fs::read_to_string(&path).map_err(|err| InventoryError::Io { path, err })?;

    let mut map = HashMap::new();
    for line in content.lines().skip(1) {
        if let Some((ino, sock)) = parse_unix_socket_line(line, stub) {
            map.insert(ino, Rc::new(sock));
        }
    }
    Ok(map)
}

// Columns: Num RefCount Protocol Flags Type St Inode Path
fn parse_unix_socket_line(line: &str, stub: &StubMount) -> Option<(u64, SocketObject)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 8 {
        return None;
    }

    let flags = u32::from_str_radix(fields[3], 16).ok()?;
    let sock_type = i32::from_str_radix(fields[4], 16).ok()?;
    let ino = fields[6].parse::<u64>().ok()?;
    let path = Path::new(fields[7]);
    if !path.is_absolute() {
        return None;
    }

    let rel = stub.rel_of(path)?;
    Some((
        ino,
        SocketObject {
            rel_path: rel,
            sock_type,
            listening: flags & UNIX_FLAG_LISTENING != 0,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use nix::sys::stat::makedev;
    use nix::unistd::getpid;
    use std::io::{Seek, SeekFrom, Write};

    fn test_stub(root: &Path) -> StubMount {
        StubMount {
            id: "test-stub".into(),
            mnt_id: 1,
            // A device number no real filesystem carries, so only the path
            // filter matches.
            dev: makedev(511, 511),
            mountpoint: root.to_path_buf(),
            paths: vec![root.to_path_buf()],
        }
    }

    fn kcmp_available() -> bool {
        crate::kcmp::kcmp(
            crate::kcmp::KcmpType::Files,
            getpid(),
            getpid(),
            0,
            0,
        )
        .is_ok()
    }

    #[test]
    fn test_fdinfo_of_own_fd() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(tmp.path().join("data"))?;
        file.write_all(b"hello")?;
        file.seek(SeekFrom::Start(3))?;

        let (flags, pos) = read_fdinfo(getpid(), std::os::unix::io::AsRawFd::as_raw_fd(&file))?;
        assert_eq!(pos, 3);
        assert_eq!(flags & OFlag::O_ACCMODE, OFlag::O_RDWR);
        Ok(())
    }

    #[test]
    fn test_collect_own_process_finds_stub_fd() -> Result<()> {
        if !kcmp_available() {
            return Ok(());
        }

        let tmp = tempfile::tempdir()?;
        let stub = test_stub(tmp.path());
        let file = std::fs::File::create(tmp.path().join("held.log"))?;

        let mut registry = Registry::new();
        let record = collect_one(getpid(), &stub, &mut registry, &HashMap::new())?
            .expect("own process is not a kthread");

        let held_fd = std::os::unix::io::AsRawFd::as_raw_fd(&file);
        let found = record
            .fds
            .iter()
            .find(|pfd| pfd.fd == held_fd)
            .expect("fd into the stub directory must be collected");
        match &found.kind {
            FdKind::File(obj) => assert_eq!(obj.rel_path, Path::new("held.log")),
            other => panic!("unexpected fd kind {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_second_collection_shares_singletons() -> Result<()> {
        if !kcmp_available() {
            return Ok(());
        }

        let tmp = tempfile::tempdir()?;
        let stub = test_stub(tmp.path());
        let me = getpid();

        let mut registry = Registry::new();
        let first = collect_one(me, &stub, &mut registry, &HashMap::new())?.unwrap();
        assert_eq!(first.fd_table_shared_with, None);

        let second = collect_one(me, &stub, &mut registry, &HashMap::new())?.unwrap();
        assert_eq!(second.fd_table_shared_with, Some(me));
        assert_eq!(second.fs_shared_with, Some(me));
        assert_eq!(second.mm_shared_with, Some(me));
        assert!(second.fds.is_empty());
        assert!(second.maps.is_empty());
        Ok(())
    }

    #[test]
    fn test_kernel_thread_is_skipped() -> Result<()> {
        if !kcmp_available() {
            return Ok(());
        }

        // kthreadd is pid 2 in the initial pid namespace; absent (e.g. in a
        // container) there is nothing to verify.
        let Ok(proc) = Process::new(2) else {
            return Ok(());
        };
        let Ok(stat) = proc.stat() else {
            return Ok(());
        };
        if u64::from(stat.flags) & PF_KTHREAD == 0 {
            return Ok(());
        }

        let tmp = tempfile::tempdir()?;
        let mut registry = Registry::new();
        let record = collect_one(
            Pid::from_raw(2),
            &test_stub(tmp.path()),
            &mut registry,
            &HashMap::new(),
        )?;
        assert!(record.is_none());
        Ok(())
    }

    #[test]
    fn test_unix_socket_line_parsing() {
        let tmp = Path::new("/mnt/s");
        let stub = StubMount {
            id: "sid".into(),
            mnt_id: 7,
            dev: makedev(0, 66),
            mountpoint: tmp.to_path_buf(),
            paths: vec![tmp.to_path_buf()],
        };

        let listener =
            "ffff880000000000: 00000002 00000000 00010000 0001 01 49863 /mnt/s/run/ctl.sock";
        let (ino, sock) = parse_unix_socket_line(listener, &stub).unwrap();
        assert_eq!(ino, 49863);
        assert_eq!(sock.rel_path, Path::new("run/ctl.sock"));
        assert_eq!(sock.sock_type, libc::SOCK_STREAM);
        assert!(sock.listening);

        // Bound elsewhere: not ours.
        let other = "ffff880000000000: 00000002 00000000 00010000 0001 01 49864 /run/other.sock";
        assert!(parse_unix_socket_line(other, &stub).is_none());

        // Abstract socket: no filesystem path.
        let abstract_sock =
            "ffff880000000000: 00000002 00000000 00010000 0001 01 49865 @hidden";
        assert!(parse_unix_socket_line(abstract_sock, &stub).is_none());

        // Unbound: too few columns.
        let unbound = "ffff880000000000: 00000003 00000000 00000000 0001 03 49866";
        assert!(parse_unix_socket_line(unbound, &stub).is_none());
    }

    #[test]
    fn test_strip_deleted_suffix() {
        assert_eq!(
            strip_deleted(Path::new("/mnt/s/gone (deleted)")),
            Path::new("/mnt/s/gone")
        );
        assert_eq!(
            strip_deleted(Path::new("/mnt/s/present")),
            Path::new("/mnt/s/present")
        );
    }
}
