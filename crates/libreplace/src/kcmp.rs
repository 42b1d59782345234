//! Thin wrapper over kcmp(2). The syscall answers the only question the
//! registry can trust: do two (pid, index) pairs refer to the same kernel
//! object? The answer is a total order, which makes kernel objects sortable
//! from userspace without naming them.

use std::cmp::Ordering;

use nix::errno::Errno;
use nix::unistd::Pid;

/// Object classes understood by kcmp(2); values match the kernel's
/// `enum kcmp_type`. libc carries no binding for this syscall.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i32)]
pub enum KcmpType {
    File = 0,
    Vm = 1,
    Files = 2,
    Fs = 3,
    Sighand = 4,
    Io = 5,
    Sysvsem = 6,
}

#[derive(thiserror::Error, Debug)]
pub enum KcmpError {
    #[error("kcmp({ty:?}, {pid1}, {pid2}, {idx1}, {idx2}) failed: {errno}")]
    Syscall {
        ty: KcmpType,
        pid1: Pid,
        pid2: Pid,
        idx1: u64,
        idx2: u64,
        errno: Errno,
    },
    #[error("kcmp({ty:?}, {pid1}, {pid2}, {idx1}, {idx2}) returned {ret}")]
    Unordered {
        ty: KcmpType,
        pid1: Pid,
        pid2: Pid,
        idx1: u64,
        idx2: u64,
        ret: i64,
    },
}

impl KcmpError {
    pub fn errno(&self) -> Errno {
        match self {
            KcmpError::Syscall { errno, .. } => *errno,
            KcmpError::Unordered { .. } => Errno::EIO,
        }
    }
}

pub fn kcmp(
    ty: KcmpType,
    pid1: Pid,
    pid2: Pid,
    idx1: u64,
    idx2: u64,
) -> Result<Ordering, KcmpError> {
    let ret = unsafe {
        libc::syscall(
            libc::SYS_kcmp,
            pid1.as_raw(),
            pid2.as_raw(),
            ty as libc::c_int,
            idx1,
            idx2,
        )
    };

    match ret {
        0 => Ok(Ordering::Equal),
        1 => Ok(Ordering::Less),
        2 => Ok(Ordering::Greater),
        -1 => Err(KcmpError::Syscall {
            ty,
            pid1,
            pid2,
            idx1,
            idx2,
            errno: Errno::last(),
        }),
        ret => Err(KcmpError::Unordered {
            ty,
            pid1,
            pid2,
            idx1,
            idx2,
            ret,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{dup, getpid};
    use std::os::unix::io::AsRawFd;

    // kcmp may be compiled out (CONFIG_KCMP) or refused by an LSM; tests
    // that depend on it bail out instead of failing.
    pub(crate) fn kcmp_available() -> bool {
        !matches!(
            kcmp(KcmpType::Files, getpid(), getpid(), 0, 0),
            Err(KcmpError::Syscall {
                errno: Errno::ENOSYS | Errno::EPERM | Errno::EACCES,
                ..
            })
        )
    }

    #[test]
    fn test_dup_compares_equal() -> anyhow::Result<()> {
        if !kcmp_available() {
            return Ok(());
        }

        let file = tempfile::tempfile()?;
        let copy = dup(file.as_raw_fd())?;
        let me = getpid();

        assert_eq!(
            kcmp(KcmpType::File, me, me, file.as_raw_fd() as u64, copy as u64)?,
            Ordering::Equal
        );
        nix::unistd::close(copy)?;
        Ok(())
    }

    #[test]
    fn test_distinct_files_are_ordered() -> anyhow::Result<()> {
        if !kcmp_available() {
            return Ok(());
        }

        let first = tempfile::tempfile()?;
        let second = tempfile::tempfile()?;
        let me = getpid();

        let fd1 = first.as_raw_fd() as u64;
        let fd2 = second.as_raw_fd() as u64;

        let forward = kcmp(KcmpType::File, me, me, fd1, fd2)?;
        let backward = kcmp(KcmpType::File, me, me, fd2, fd1)?;
        assert_ne!(forward, Ordering::Equal);
        assert_eq!(forward, backward.reverse());
        Ok(())
    }

    #[test]
    fn test_own_fd_table_is_self_equal() -> anyhow::Result<()> {
        if !kcmp_available() {
            return Ok(());
        }

        let me = getpid();
        assert_eq!(kcmp(KcmpType::Files, me, me, 0, 0)?, Ordering::Equal);
        assert_eq!(kcmp(KcmpType::Fs, me, me, 0, 0)?, Ordering::Equal);
        assert_eq!(kcmp(KcmpType::Vm, me, me, 0, 0)?, Ordering::Equal);
        Ok(())
    }
}
