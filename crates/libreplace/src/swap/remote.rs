//! Remote syscall execution inside a stopped tracee.
//!
//! One syscall instruction is planted at the tracee's instruction pointer,
//! registers are loaded with the request, the tracee is single-stepped and
//! everything is restored afterwards. Argument memory (paths, sockaddrs) is
//! staged on the tracee's stack, below the red zone.

#[cfg(not(target_arch = "x86_64"))]
use nix::unistd::Pid;

#[cfg(not(target_arch = "x86_64"))]
use super::InjectError;

#[cfg(target_arch = "x86_64")]
pub(super) use imp::{push_bytes, syscall};

#[cfg(target_arch = "x86_64")]
mod imp {
    use std::io::IoSlice;

    use nix::errno::Errno;
    use nix::sys::ptrace::{self, AddressType};
    use nix::sys::signal::Signal;
    use nix::sys::uio::{process_vm_writev, RemoteIoVec};
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::Pid;

    use super::super::InjectError;

    // 0f 05 = syscall
    const SYSCALL_INSN: libc::c_long = 0x050f;

    // Scratch space is placed this far below rsp: past the 128-byte red zone
    // with headroom for alignment.
    const STACK_SKIP: u64 = 512;

    fn ptrace_err(op: &'static str, pid: Pid) -> impl Fn(Errno) -> InjectError {
        move |errno| InjectError::Ptrace { op, pid, errno }
    }

    /// Executes one syscall inside the stopped tracee and returns its result.
    pub(in super::super) fn syscall(
        pid: Pid,
        nr: i64,
        args: [u64; 6],
    ) -> Result<i64, InjectError> {
        let saved_regs = ptrace::getregs(pid).map_err(ptrace_err("getregs", pid))?;
        let ip = saved_regs.rip;
        let saved_text =
            ptrace::read(pid, ip as AddressType).map_err(ptrace_err("peektext", pid))?;

        unsafe { ptrace::write(pid, ip as AddressType, SYSCALL_INSN as AddressType) }
            .map_err(ptrace_err("poketext", pid))?;

        let mut regs = saved_regs;
        regs.rax = nr as u64;
        regs.rdi = args[0];
        regs.rsi = args[1];
        regs.rdx = args[2];
        regs.r10 = args[3];
        regs.r8 = args[4];
        regs.r9 = args[5];
        regs.rip = ip;
        ptrace::setregs(pid, regs).map_err(ptrace_err("setregs", pid))?;

        let step_result = step_over_syscall(pid);

        // Restore text and registers even if the step went wrong; the tracee
        // must be detachable in its original state.
        let restore_text = unsafe { ptrace::write(pid, ip as AddressType, saved_text as AddressType) }
            .map_err(ptrace_err("poketext", pid));
        let restore_regs = ptrace::setregs(pid, saved_regs).map_err(ptrace_err("setregs", pid));

        let ret = step_result?;
        restore_text?;
        restore_regs?;

        if (-4095..0).contains(&ret) {
            return Err(InjectError::Remote {
                nr,
                pid,
                errno: Errno::from_raw(-ret as i32),
            });
        }
        Ok(ret)
    }

    fn step_over_syscall(pid: Pid) -> Result<i64, InjectError> {
        ptrace::step(pid, None).map_err(ptrace_err("singlestep", pid))?;

        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => {}
            Ok(status) => return Err(InjectError::UnexpectedStop { pid, status }),
            Err(errno) => return Err(InjectError::Wait { pid, errno }),
        }

        let regs = ptrace::getregs(pid).map_err(ptrace_err("getregs", pid))?;
        Ok(regs.rax as i64)
    }

    /// Stages bytes on the tracee's stack; returns their remote address.
    pub(in super::super) fn push_bytes(pid: Pid, bytes: &[u8]) -> Result<u64, InjectError> {
        let regs = ptrace::getregs(pid).map_err(ptrace_err("getregs", pid))?;
        let addr = (regs.rsp - STACK_SKIP - bytes.len() as u64) & !0xf;

        let local = [IoSlice::new(bytes)];
        let remote = [RemoteIoVec {
            base: addr as usize,
            len: bytes.len(),
        }];
        let written = process_vm_writev(pid, &local, &remote)
            .map_err(|errno| InjectError::Mem { pid, errno })?;
        if written != bytes.len() {
            return Err(InjectError::Mem {
                pid,
                errno: Errno::EFAULT,
            });
        }
        Ok(addr)
    }
}

#[cfg(not(target_arch = "x86_64"))]
pub(super) fn syscall(_pid: Pid, _nr: i64, _args: [u64; 6]) -> Result<i64, InjectError> {
    Err(InjectError::Unsupported)
}

#[cfg(not(target_arch = "x86_64"))]
pub(super) fn push_bytes(_pid: Pid, _bytes: &[u8]) -> Result<u64, InjectError> {
    Err(InjectError::Unsupported)
}
