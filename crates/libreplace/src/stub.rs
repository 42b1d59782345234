//! Client side of the stub filesystem's control protocol.
//!
//! The stub is an external collaborator; the engine only needs two words
//! with it: switch into proxy mode right before its mountpoint is swapped
//! (so straggler syscalls are forwarded to the real mount through the held
//! directory handle), and release it once the swap is complete. Requests
//! are newline-framed text over a seqpacket socket, answered with a status
//! integer, mirroring the manager's own control protocol.

use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::socket::{connect, socket, AddressFamily, SockFlag, SockType, UnixAddr};
use nix::unistd::{read, write};

#[derive(thiserror::Error, Debug)]
pub enum StubError {
    #[error("failed to create stub control socket: {0}")]
    Socket(Errno),
    #[error("failed to connect to stub socket {path}: {errno}")]
    Connect { path: PathBuf, errno: Errno },
    #[error("stub control io failed: {0}")]
    Io(Errno),
    #[error("stub replied with garbage: {reply:?}")]
    Protocol { reply: String },
    #[error("stub refused request: {status}")]
    Refused { status: i32 },
}

impl StubError {
    pub fn errno(&self) -> Errno {
        match self {
            StubError::Socket(errno) | StubError::Io(errno) => *errno,
            StubError::Connect { errno, .. } => *errno,
            StubError::Protocol { .. } => Errno::EPROTO,
            StubError::Refused { status } => Errno::from_raw(-status),
        }
    }
}

/// Tells the stub to proxy further operations through to the real mount.
pub fn send_proxy_mode(sock: &Path, proxy_dir: &Path) -> Result<(), StubError> {
    request(sock, &format!("mode proxy {}\n", proxy_dir.display()))
}

/// Tells the stub the swap is over and it may wind down.
pub fn send_release(sock: &Path) -> Result<(), StubError> {
    request(sock, "release\n")
}

fn request(sock_path: &Path, line: &str) -> Result<(), StubError> {
    let fd = socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(StubError::Socket)?;

    let addr = UnixAddr::new(sock_path).map_err(|errno| StubError::Connect {
        path: sock_path.to_path_buf(),
        errno,
    })?;
    connect(fd.as_raw_fd(), &addr).map_err(|errno| StubError::Connect {
        path: sock_path.to_path_buf(),
        errno,
    })?;

    write(&fd, line.as_bytes()).map_err(StubError::Io)?;

    let mut buf = [0u8; 64];
    let n = read(fd.as_raw_fd(), &mut buf).map_err(StubError::Io)?;
    let reply = String::from_utf8_lossy(&buf[..n]);
    let status = reply
        .trim()
        .parse::<i32>()
        .map_err(|_| StubError::Protocol {
            reply: reply.into_owned(),
        })?;

    if status != 0 {
        return Err(StubError::Refused { status });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_socket_is_a_connect_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = send_release(&tmp.path().join("gone.sock")).unwrap_err();
        assert!(matches!(err, StubError::Connect { .. }));
    }
}
