//! The real injection backend: ptrace SEIZE plus remote syscalls.
//!
//! The worker driving this backend runs in the same pid and mount
//! namespaces as its tracees, which is what makes fd attachment work: the
//! tracee reopens the worker's replacement fd through /proc. Only syscall
//! numbers shared by the 64-bit ABIs are used (dup3, not dup2).

use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getpid, Pid};

use super::remote;
use super::{InjectError, Injector};
use crate::process::ProcessMap;
use crate::registry::SocketObject;

const SOCKET_BACKLOG: u64 = 128;

#[derive(Debug, Default)]
pub struct Swapfd;

impl Swapfd {
    pub fn new() -> Self {
        Swapfd
    }
}

fn ptrace_err(op: &'static str, pid: Pid) -> impl Fn(Errno) -> InjectError {
    move |errno| InjectError::Ptrace { op, pid, errno }
}

fn remote_open(pid: Pid, path: &Path, flags: OFlag) -> Result<RawFd, InjectError> {
    let mut bytes = path.as_os_str().as_bytes().to_vec();
    bytes.push(0);
    let addr = remote::push_bytes(pid, &bytes)?;

    let fd = remote::syscall(
        pid,
        libc::SYS_openat,
        [
            libc::AT_FDCWD as u64,
            addr,
            flags.bits() as u64,
            0,
            0,
            0,
        ],
    )?;
    Ok(fd as RawFd)
}

fn sockaddr_un(path: &Path) -> Result<(Vec<u8>, u64), InjectError> {
    let bytes = path.as_os_str().as_bytes();
    let capacity = mem::size_of::<libc::sockaddr_un>() - 2;
    if bytes.len() >= capacity {
        return Err(InjectError::PathTooLong {
            path: path.to_path_buf(),
        });
    }

    let mut buf = vec![0u8; mem::size_of::<libc::sockaddr_un>()];
    buf[0..2].copy_from_slice(&(libc::AF_UNIX as u16).to_ne_bytes());
    buf[2..2 + bytes.len()].copy_from_slice(bytes);
    // family + path + terminating NUL
    Ok((buf, (2 + bytes.len() + 1) as u64))
}

impl Injector for Swapfd {
    fn seize(&mut self, pid: Pid) -> Result<(), InjectError> {
        ptrace::seize(pid, ptrace::Options::empty()).map_err(ptrace_err("seize", pid))?;
        ptrace::interrupt(pid).map_err(ptrace_err("interrupt", pid))?;

        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::PtraceEvent(..)) | Ok(WaitStatus::Stopped(..)) => Ok(()),
            Ok(status) => Err(InjectError::UnexpectedStop { pid, status }),
            Err(errno) => Err(InjectError::Wait { pid, errno }),
        }
    }

    fn release(&mut self, pid: Pid) -> Result<(), InjectError> {
        ptrace::detach(pid, None).map_err(ptrace_err("detach", pid))
    }

    fn attach_fd(&mut self, pid: Pid, local: RawFd, flags: OFlag) -> Result<RawFd, InjectError> {
        let path = format!("/proc/{}/fd/{}", getpid().as_raw(), local);
        remote_open(pid, Path::new(&path), flags)
    }

    fn dup_into(&mut self, pid: Pid, src: RawFd, dst: RawFd) -> Result<(), InjectError> {
        remote::syscall(pid, libc::SYS_dup3, [src as u64, dst as u64, 0, 0, 0, 0])?;
        self.close_fd(pid, src)
    }

    fn close_fd(&mut self, pid: Pid, fd: RawFd) -> Result<(), InjectError> {
        remote::syscall(pid, libc::SYS_close, [fd as u64, 0, 0, 0, 0, 0])?;
        Ok(())
    }

    fn set_pos(&mut self, pid: Pid, fd: RawFd, pos: u64) -> Result<(), InjectError> {
        remote::syscall(
            pid,
            libc::SYS_lseek,
            [fd as u64, pos, libc::SEEK_SET as u64, 0, 0, 0],
        )?;
        Ok(())
    }

    fn set_flags(&mut self, pid: Pid, fd: RawFd, flags: OFlag) -> Result<(), InjectError> {
        remote::syscall(
            pid,
            libc::SYS_fcntl,
            [
                fd as u64,
                libc::F_SETFL as u64,
                flags.bits() as u64,
                0,
                0,
                0,
            ],
        )?;
        Ok(())
    }

    fn remap(&mut self, pid: Pid, map: &ProcessMap, fd: RawFd) -> Result<(), InjectError> {
        let visibility = if map.shared {
            libc::MAP_SHARED
        } else {
            libc::MAP_PRIVATE
        };
        // MAP_FIXED atomically replaces the old range with the new backing.
        remote::syscall(
            pid,
            libc::SYS_mmap,
            [
                map.start,
                map.end - map.start,
                map.prot as u64,
                (libc::MAP_FIXED | visibility) as u64,
                fd as u64,
                map.offset,
            ],
        )?;
        Ok(())
    }

    fn set_cwd(&mut self, pid: Pid, fd: RawFd) -> Result<(), InjectError> {
        remote::syscall(pid, libc::SYS_fchdir, [fd as u64, 0, 0, 0, 0, 0])?;
        Ok(())
    }

    fn set_root(&mut self, pid: Pid, fd: RawFd) -> Result<(), InjectError> {
        remote::syscall(pid, libc::SYS_fchdir, [fd as u64, 0, 0, 0, 0, 0])?;
        let dot = remote::push_bytes(pid, b".\0")?;
        remote::syscall(pid, libc::SYS_chroot, [dot, 0, 0, 0, 0, 0])?;
        Ok(())
    }

    fn rewire_socket(
        &mut self,
        pid: Pid,
        fd: RawFd,
        sock: &SocketObject,
        root: &Path,
    ) -> Result<(), InjectError> {
        let new_fd = remote::syscall(
            pid,
            libc::SYS_socket,
            [libc::AF_UNIX as u64, sock.sock_type as u64, 0, 0, 0, 0],
        )? as RawFd;

        let path = root.join(&sock.rel_path);
        let (bytes, addr_len) = sockaddr_un(&path)?;
        let addr = remote::push_bytes(pid, &bytes)?;

        if sock.listening {
            remote::syscall(
                pid,
                libc::SYS_bind,
                [new_fd as u64, addr, addr_len, 0, 0, 0],
            )?;
            remote::syscall(
                pid,
                libc::SYS_listen,
                [new_fd as u64, SOCKET_BACKLOG, 0, 0, 0, 0],
            )?;
        } else {
            remote::syscall(
                pid,
                libc::SYS_connect,
                [new_fd as u64, addr, addr_len, 0, 0, 0],
            )?;
        }

        self.dup_into(pid, new_fd, fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sockaddr_encoding() {
        let (bytes, len) = sockaddr_un(Path::new("/run/s/ctl.sock")).unwrap();
        assert_eq!(bytes.len(), mem::size_of::<libc::sockaddr_un>());
        assert_eq!(
            u16::from_ne_bytes([bytes[0], bytes[1]]),
            libc::AF_UNIX as u16
        );
        assert_eq!(&bytes[2..17], b"/run/s/ctl.sock");
        assert_eq!(bytes[17], 0);
        assert_eq!(len, 18);
    }

    #[test]
    fn test_sockaddr_rejects_oversized_path() {
        let long = format!("/run/{}", "x".repeat(200));
        assert!(matches!(
            sockaddr_un(Path::new(&long)),
            Err(InjectError::PathTooLong { .. })
        ));
    }
}
