use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{thread, time};

use nix::fcntl::{Flock, FlockArg};
use nix::unistd::Pid;

use crate::common::{read_cgroup_file, write_cgroup_file, WrappedIoError};

const CGROUP_FREEZER_STATE: &str = "freezer.state";
const CGROUP_TASKS: &str = "tasks";

const FREEZER_STATE_THAWED: &str = "THAWED";
const FREEZER_STATE_FROZEN: &str = "FROZEN";
const FREEZER_STATE_FREEZING: &str = "FREEZING";

// FREEZING can persist for a while on a loaded host; retry generously
// before declaring the cgroup unfreezable.
const FREEZE_RETRIES: u32 = 1000;

#[derive(thiserror::Error, Debug)]
pub enum FreezerError {
    #[error("io error: {0}")]
    WrappedIo(#[from] WrappedIoError),
    #[error("failed to lock cgroup {path}: {errno}")]
    Lock {
        path: PathBuf,
        errno: nix::errno::Errno,
    },
    #[error("unexpected freezer state {state:?}")]
    UnexpectedState { state: String },
    #[error("cgroup {path} did not settle into FROZEN")]
    UnableToFreeze { path: PathBuf },
    #[error("invalid pid {pid:?} in task list")]
    InvalidTask { pid: String },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FreezerState {
    Thawed,
    Freezing,
    Frozen,
}

impl FromStr for FreezerState {
    type Err = FreezerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            FREEZER_STATE_THAWED => Ok(FreezerState::Thawed),
            FREEZER_STATE_FREEZING => Ok(FreezerState::Freezing),
            FREEZER_STATE_FROZEN => Ok(FreezerState::Frozen),
            other => Err(FreezerError::UnexpectedState {
                state: other.to_owned(),
            }),
        }
    }
}

/// A freezer cgroup plus the advisory lock serializing freeze operations on
/// it. The lock is an exclusive flock on the cgroup directory handle, so it
/// is released by the kernel if the holder dies.
pub struct FreezerCgroup {
    path: PathBuf,
    lock: Option<Flock<File>>,
}

impl FreezerCgroup {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        FreezerCgroup {
            path: path.into(),
            lock: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Blocks until the advisory lock is acquired. Concurrent replacement
    /// jobs on the same cgroup serialize here.
    pub fn lock(&mut self) -> Result<(), FreezerError> {
        if self.lock.is_some() {
            return Ok(());
        }

        let dir = File::open(&self.path).map_err(|err| WrappedIoError::Open {
            err,
            path: self.path.clone(),
        })?;
        let lock =
            Flock::lock(dir, FlockArg::LockExclusive).map_err(|(_, errno)| FreezerError::Lock {
                path: self.path.clone(),
                errno,
            })?;

        self.lock = Some(lock);
        Ok(())
    }

    /// Non-blocking variant; returns false when another holder has the lock.
    pub fn try_lock(&mut self) -> Result<bool, FreezerError> {
        if self.lock.is_some() {
            return Ok(true);
        }

        let dir = File::open(&self.path).map_err(|err| WrappedIoError::Open {
            err,
            path: self.path.clone(),
        })?;
        match Flock::lock(dir, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                self.lock = Some(lock);
                Ok(true)
            }
            Err((_, nix::errno::Errno::EAGAIN)) => Ok(false),
            Err((_, errno)) => Err(FreezerError::Lock {
                path: self.path.clone(),
                errno,
            }),
        }
    }

    /// Idempotent; dropping the flock handle releases it.
    pub fn unlock(&mut self) {
        self.lock.take();
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    pub fn state(&self) -> Result<FreezerState, FreezerError> {
        read_cgroup_file(self.path.join(CGROUP_FREEZER_STATE))?.parse()
    }

    /// Writes FROZEN and polls until the kernel reports the whole task set
    /// frozen. Freezing an already-frozen cgroup is a no-op. On failure the
    /// cgroup is thawed back: leaving tasks stuck in FREEZING is worse than
    /// reporting the error.
    pub fn freeze(&self) -> Result<(), FreezerError> {
        let state_file = self.path.join(CGROUP_FREEZER_STATE);

        let result = (|| {
            for i in 0..FREEZE_RETRIES {
                write_cgroup_file(&state_file, FREEZER_STATE_FROZEN)?;

                match read_cgroup_file(&state_file)?.parse()? {
                    FreezerState::Frozen => {
                        if i > 0 {
                            tracing::debug!(retries = i, cgroup = ?self.path, "frozen after retries");
                        }
                        return Ok(());
                    }
                    FreezerState::Freezing | FreezerState::Thawed => {
                        if i % 25 == 24 {
                            thread::sleep(time::Duration::from_millis(10));
                        }
                    }
                }
            }
            Err(FreezerError::UnableToFreeze {
                path: self.path.clone(),
            })
        })();

        if result.is_err() {
            let _ = write_cgroup_file(&state_file, FREEZER_STATE_THAWED);
        }
        result
    }

    pub fn thaw(&self) -> Result<(), FreezerError> {
        write_cgroup_file(self.path.join(CGROUP_FREEZER_STATE), FREEZER_STATE_THAWED)?;
        Ok(())
    }

    /// The pids as seen by the reader's pid namespace, one per line. A worker
    /// that joined the container's pid namespace reads virtual pids here.
    pub fn tasks(&self) -> Result<Vec<Pid>, FreezerError> {
        read_cgroup_file(self.path.join(CGROUP_TASKS))?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                line.trim()
                    .parse::<i32>()
                    .map(Pid::from_raw)
                    .map_err(|_| FreezerError::InvalidTask {
                        pid: line.to_owned(),
                    })
            })
            .collect()
    }
}
