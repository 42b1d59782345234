//! The stub table: the one piece of process-wide state.
//!
//! `manage` requests attach a freezer cgroup and a namespace pid to a stub
//! id; `replace` requests consult the table; the reaper removes entries
//! when a stub process dies. Everything else in the manager is per-job.

use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use nix::unistd::Pid;
use once_cell::sync::Lazy;

#[derive(Debug, Clone)]
pub struct StubInfo {
    pub id: String,
    /// Pid of the stub process itself, when known; the reaper matches on it.
    pub pid: Option<Pid>,
    /// The stub's control socket, for proxy-mode and release messages.
    pub socket: Option<PathBuf>,
    pub freezer_cgroup: Option<PathBuf>,
    pub ns_pid: Option<Pid>,
}

static STUBS: Lazy<Mutex<Vec<StubInfo>>> = Lazy::new(|| Mutex::new(Vec::new()));

fn table() -> MutexGuard<'static, Vec<StubInfo>> {
    STUBS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Creates or updates the entry for `id` with managing information.
pub fn manage(id: &str, freezer_cgroup: PathBuf, ns_pid: Pid, socket: Option<PathBuf>) {
    let mut stubs = table();
    if let Some(info) = stubs.iter_mut().find(|info| info.id == id) {
        info.freezer_cgroup = Some(freezer_cgroup);
        info.ns_pid = Some(ns_pid);
        if socket.is_some() {
            info.socket = socket;
        }
        return;
    }
    stubs.push(StubInfo {
        id: id.to_owned(),
        pid: None,
        socket,
        freezer_cgroup: Some(freezer_cgroup),
        ns_pid: Some(ns_pid),
    });
}

pub fn find(id: &str) -> Option<StubInfo> {
    table().iter().find(|info| info.id == id).cloned()
}

pub fn remove_by_pid(pid: Pid) -> Option<StubInfo> {
    let mut stubs = table();
    let index = stubs.iter().position(|info| info.pid == Some(pid))?;
    Some(stubs.remove(index))
}

pub fn is_empty() -> bool {
    table().is_empty()
}

#[cfg(test)]
pub fn clear() {
    table().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_manage_upserts() {
        clear();

        manage("sid", PathBuf::from("/sys/fs/cgroup/freezer/ct1"), Pid::from_raw(100), None);
        manage(
            "sid",
            PathBuf::from("/sys/fs/cgroup/freezer/ct1"),
            Pid::from_raw(200),
            Some(PathBuf::from("ct1.stub.sock")),
        );

        let info = find("sid").unwrap();
        assert_eq!(info.ns_pid, Some(Pid::from_raw(200)));
        assert_eq!(info.socket, Some(PathBuf::from("ct1.stub.sock")));
        assert!(find("other").is_none());

        clear();
    }

    #[test]
    #[serial]
    fn test_remove_by_pid_only_matches_known_pids() {
        clear();

        manage("sid", PathBuf::from("/cg"), Pid::from_raw(100), None);
        assert!(remove_by_pid(Pid::from_raw(4242)).is_none());
        assert!(!is_empty());

        table().iter_mut().for_each(|info| info.pid = Some(Pid::from_raw(4242)));
        let removed = remove_by_pid(Pid::from_raw(4242)).unwrap();
        assert_eq!(removed.id, "sid");
        assert!(is_empty());
    }
}
