//! Kcmp-keyed object registry.
//!
//! Processes in a container reference the stub filesystem through fds, maps,
//! fs_structs and mm_structs that may share underlying kernel objects in
//! arbitrary ways (dup, fork, CLONE_FILES/FS/VM). The registry collapses
//! those references into one canonical record per kernel object, so each
//! replacement is prepared exactly once. Identity is decided by kcmp(2) for
//! the kernel-object kinds, lexicographically for path-keyed kinds and
//! numerically for socket inodes.
//!
//! Because the comparator for kernel objects is a syscall, `Ord`-based
//! collections cannot hold these keys; each set is a sorted vector searched
//! with a fallible comparator, preserving the O(log n) lookup of a search
//! tree.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use nix::fcntl::OFlag;
use nix::unistd::Pid;

use crate::kcmp::{kcmp, KcmpError, KcmpType};

/// How to reproduce one collected file reference under the replacement
/// mount: path relative to the stub mountpoint, the open flags and the file
/// position at collection time. The replacement fd is opened lazily and
/// cached, once per canonical object.
#[derive(Debug)]
pub struct FileObject {
    pub rel_path: PathBuf,
    pub flags: OFlag,
    pub pos: u64,
    replacement: RefCell<Option<OwnedFd>>,
}

impl FileObject {
    pub fn new<P: Into<PathBuf>>(rel_path: P, flags: OFlag, pos: u64) -> Rc<Self> {
        Rc::new(FileObject {
            rel_path: rel_path.into(),
            flags,
            pos,
            replacement: RefCell::new(None),
        })
    }

    pub fn replacement_fd(&self) -> Option<RawFd> {
        self.replacement.borrow().as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn store_replacement(&self, fd: OwnedFd) -> RawFd {
        let raw = fd.as_raw_fd();
        *self.replacement.borrow_mut() = Some(fd);
        raw
    }
}

/// A unix socket bound or connected to a path below the stub mountpoint.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SocketObject {
    pub rel_path: PathBuf,
    pub sock_type: i32,
    pub listening: bool,
}

/// Outcome of a registry insertion. `Exists` carries the canonical payload;
/// the caller's candidate has been discarded.
#[derive(Debug)]
pub enum Collected<T> {
    New(T),
    Exists(T),
}

impl<T> Collected<T> {
    pub fn payload(&self) -> &T {
        match self {
            Collected::New(payload) | Collected::Exists(payload) => payload,
        }
    }

    pub fn into_payload(self) -> T {
        match self {
            Collected::New(payload) | Collected::Exists(payload) => payload,
        }
    }

    pub fn already_existed(&self) -> bool {
        matches!(self, Collected::Exists(_))
    }
}

#[derive(Debug)]
pub struct FdEntry {
    pub pid: Pid,
    pub fd: RawFd,
    pub file: Rc<FileObject>,
    pub shared: bool,
}

#[derive(Debug)]
struct MappingEntry {
    path: PathBuf,
    flags: OFlag,
    file: Rc<FileObject>,
}

#[derive(Debug)]
struct SocketEntry {
    ino: u64,
    sock: Rc<SocketObject>,
}

/// One registry per replacement job; everything it owns is dropped with it.
#[derive(Debug, Default)]
pub struct Registry {
    fds: Vec<FdEntry>,
    fd_tables: Vec<Pid>,
    fs_structs: Vec<Pid>,
    mms: Vec<Pid>,
    mappings: Vec<MappingEntry>,
    fifos: Vec<PathBuf>,
    sockets: Vec<SocketEntry>,
}

/// Binary search over a sorted slice with a comparator that may fail. The
/// comparator reports the ordering of the probed element relative to the
/// candidate key.
fn search<T, F>(items: &[T], mut cmp: F) -> Result<std::result::Result<usize, usize>, KcmpError>
where
    F: FnMut(&T) -> Result<Ordering, KcmpError>,
{
    let mut lo = 0;
    let mut hi = items.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match cmp(&items[mid])? {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Ok(Ok(mid)),
        }
    }
    Ok(Err(lo))
}

fn search_pids(
    items: &[Pid],
    ty: KcmpType,
    pid: Pid,
) -> Result<std::result::Result<usize, usize>, KcmpError> {
    search(items, |other| kcmp(ty, *other, pid, 0, 0))
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Collects one (pid, fd) reference. If the kernel reports that the pair
    /// aliases an already collected file description, the canonical entry is
    /// marked shared and its payload returned.
    pub fn insert_fd(
        &mut self,
        pid: Pid,
        fd: RawFd,
        file: Rc<FileObject>,
    ) -> Result<Collected<Rc<FileObject>>, KcmpError> {
        let slot = search(&self.fds, |entry| {
            kcmp(
                KcmpType::File,
                entry.pid,
                pid,
                entry.fd as u64,
                fd as u64,
            )
        })?;

        match slot {
            Ok(found) => {
                let entry = &mut self.fds[found];
                entry.shared = true;
                tracing::debug!(
                    pid = pid.as_raw(),
                    fd,
                    canonical_pid = entry.pid.as_raw(),
                    canonical_fd = entry.fd,
                    "fd shares a file description with an already collected one"
                );
                Ok(Collected::Exists(entry.file.clone()))
            }
            Err(insert_at) => {
                self.fds.insert(
                    insert_at,
                    FdEntry {
                        pid,
                        fd,
                        file: file.clone(),
                        shared: false,
                    },
                );
                Ok(Collected::New(file))
            }
        }
    }

    pub fn fd_entries(&self) -> &[FdEntry] {
        &self.fds
    }

    /// Collects a process's fd table; `Exists` names the canonical pid whose
    /// enumeration already covers this table (CLONE_FILES sharers).
    pub fn insert_fd_table(&mut self, pid: Pid) -> Result<Collected<Pid>, KcmpError> {
        Self::insert_singleton(&mut self.fd_tables, KcmpType::Files, pid)
    }

    pub fn lookup_fd_table(&self, pid: Pid) -> Result<Option<Pid>, KcmpError> {
        Ok(search_pids(&self.fd_tables, KcmpType::Files, pid)?
            .ok()
            .map(|i| self.fd_tables[i]))
    }

    pub fn insert_fs_struct(&mut self, pid: Pid) -> Result<Collected<Pid>, KcmpError> {
        Self::insert_singleton(&mut self.fs_structs, KcmpType::Fs, pid)
    }

    pub fn lookup_fs_struct(&self, pid: Pid) -> Result<Option<Pid>, KcmpError> {
        Ok(search_pids(&self.fs_structs, KcmpType::Fs, pid)?
            .ok()
            .map(|i| self.fs_structs[i]))
    }

    pub fn insert_mm(&mut self, pid: Pid) -> Result<Collected<Pid>, KcmpError> {
        Self::insert_singleton(&mut self.mms, KcmpType::Vm, pid)
    }

    pub fn lookup_mm(&self, pid: Pid) -> Result<Option<Pid>, KcmpError> {
        Ok(search_pids(&self.mms, KcmpType::Vm, pid)?
            .ok()
            .map(|i| self.mms[i]))
    }

    fn insert_singleton(
        items: &mut Vec<Pid>,
        ty: KcmpType,
        pid: Pid,
    ) -> Result<Collected<Pid>, KcmpError> {
        match search_pids(items, ty, pid)? {
            Ok(found) => {
                let canonical = items[found];
                tracing::debug!(
                    pid = pid.as_raw(),
                    canonical = canonical.as_raw(),
                    kind = ?ty,
                    "process shares a kernel object with an already collected process"
                );
                Ok(Collected::Exists(canonical))
            }
            Err(insert_at) => {
                items.insert(insert_at, pid);
                Ok(Collected::New(pid))
            }
        }
    }

    /// Collects a file-backed mapping, keyed by (path, flags).
    pub fn insert_mapping(
        &mut self,
        path: &Path,
        flags: OFlag,
        file: Rc<FileObject>,
    ) -> Collected<Rc<FileObject>> {
        let slot = self.mappings.binary_search_by(|entry| {
            entry
                .path
                .as_path()
                .cmp(path)
                .then(entry.flags.bits().cmp(&flags.bits()))
        });

        match slot {
            Ok(found) => Collected::Exists(self.mappings[found].file.clone()),
            Err(insert_at) => {
                self.mappings.insert(
                    insert_at,
                    MappingEntry {
                        path: path.to_path_buf(),
                        flags,
                        file: file.clone(),
                    },
                );
                Collected::New(file)
            }
        }
    }

    /// Records that a named pipe path is scheduled for replacement; returns
    /// false if it already was.
    pub fn insert_fifo(&mut self, path: &Path) -> bool {
        match self.fifos.binary_search_by(|p| p.as_path().cmp(path)) {
            Ok(_) => false,
            Err(insert_at) => {
                self.fifos.insert(insert_at, path.to_path_buf());
                true
            }
        }
    }

    pub fn insert_unix_socket(
        &mut self,
        ino: u64,
        sock: Rc<SocketObject>,
    ) -> Collected<Rc<SocketObject>> {
        match self.sockets.binary_search_by(|entry| entry.ino.cmp(&ino)) {
            Ok(found) => Collected::Exists(self.sockets[found].sock.clone()),
            Err(insert_at) => {
                self.sockets
                    .insert(insert_at, SocketEntry { ino, sock: sock.clone() });
                Collected::New(sock)
            }
        }
    }

    pub fn find_unix_socket(&self, ino: u64) -> Option<Rc<SocketObject>> {
        self.sockets
            .binary_search_by(|entry| entry.ino.cmp(&ino))
            .ok()
            .map(|i| self.sockets[i].sock.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use nix::errno::Errno;
    use nix::unistd::{dup, getpid};
    use std::os::unix::io::AsRawFd;

    fn kcmp_available() -> bool {
        !matches!(
            kcmp(KcmpType::Files, getpid(), getpid(), 0, 0),
            Err(KcmpError::Syscall {
                errno: Errno::ENOSYS | Errno::EPERM | Errno::EACCES,
                ..
            })
        )
    }

    #[test]
    fn test_duplicated_fd_collapses_to_canonical() -> Result<()> {
        if !kcmp_available() {
            return Ok(());
        }

        let me = getpid();
        let file = tempfile::tempfile()?;
        let copy = dup(file.as_raw_fd())?;

        let mut registry = Registry::new();
        let obj = FileObject::new("data/log", OFlag::O_RDWR, 0);
        let first = registry.insert_fd(me, file.as_raw_fd(), obj.clone())?;
        assert!(!first.already_existed());

        let decoy = FileObject::new("data/log", OFlag::O_RDWR, 0);
        let second = registry.insert_fd(me, copy, decoy)?;
        assert!(second.already_existed());
        // Same payload pointer, not a copy of it.
        assert!(Rc::ptr_eq(second.payload(), &obj));

        let entries = registry.fd_entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].shared);

        nix::unistd::close(copy)?;
        Ok(())
    }

    #[test]
    fn test_distinct_fds_stay_distinct() -> Result<()> {
        if !kcmp_available() {
            return Ok(());
        }

        let me = getpid();
        let first = tempfile::tempfile()?;
        let second = tempfile::tempfile()?;

        let mut registry = Registry::new();
        registry.insert_fd(
            me,
            first.as_raw_fd(),
            FileObject::new("a", OFlag::O_RDONLY, 0),
        )?;
        registry.insert_fd(
            me,
            second.as_raw_fd(),
            FileObject::new("b", OFlag::O_RDONLY, 0),
        )?;

        let entries = registry.fd_entries();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|entry| !entry.shared));
        Ok(())
    }

    #[test]
    fn test_singletons_report_canonical_pid() -> Result<()> {
        if !kcmp_available() {
            return Ok(());
        }

        let me = getpid();
        let mut registry = Registry::new();

        assert!(!registry.insert_fd_table(me)?.already_existed());
        match registry.insert_fd_table(me)? {
            Collected::Exists(canonical) => assert_eq!(canonical, me),
            Collected::New(_) => panic!("second insertion must collapse"),
        }

        assert!(!registry.insert_fs_struct(me)?.already_existed());
        assert!(registry.insert_fs_struct(me)?.already_existed());

        assert!(!registry.insert_mm(me)?.already_existed());
        assert!(registry.insert_mm(me)?.already_existed());

        assert_eq!(registry.lookup_fd_table(me)?, Some(me));
        assert_eq!(registry.lookup_fs_struct(me)?, Some(me));
        assert_eq!(registry.lookup_mm(me)?, Some(me));
        Ok(())
    }

    #[test]
    fn test_mapping_identity_is_path_and_flags() {
        let mut registry = Registry::new();
        let path = Path::new("/mnt/s/lib/libfoo.so");

        let obj = FileObject::new("lib/libfoo.so", OFlag::O_RDONLY, 0);
        let first = registry.insert_mapping(path, OFlag::O_RDONLY, obj.clone());
        assert!(!first.already_existed());

        let second = registry.insert_mapping(
            path,
            OFlag::O_RDONLY,
            FileObject::new("lib/libfoo.so", OFlag::O_RDONLY, 0),
        );
        assert!(second.already_existed());
        assert!(Rc::ptr_eq(second.payload(), &obj));

        // Same path with different flags is a different mapping object.
        let third = registry.insert_mapping(
            path,
            OFlag::O_RDWR,
            FileObject::new("lib/libfoo.so", OFlag::O_RDWR, 0),
        );
        assert!(!third.already_existed());
    }

    #[test]
    fn test_fifo_set_deduplicates() {
        let mut registry = Registry::new();
        assert!(registry.insert_fifo(Path::new("/mnt/s/run/queue")));
        assert!(!registry.insert_fifo(Path::new("/mnt/s/run/queue")));
        assert!(registry.insert_fifo(Path::new("/mnt/s/run/other")));
    }

    #[test]
    fn test_unix_socket_table() {
        let mut registry = Registry::new();
        let sock = Rc::new(SocketObject {
            rel_path: PathBuf::from("run/ctl.sock"),
            sock_type: libc::SOCK_STREAM,
            listening: true,
        });

        assert!(!registry.insert_unix_socket(4242, sock.clone()).already_existed());
        assert!(registry.insert_unix_socket(4242, sock.clone()).already_existed());

        assert_eq!(registry.find_unix_socket(4242), Some(sock));
        assert_eq!(registry.find_unix_socket(17), None);
    }
}
