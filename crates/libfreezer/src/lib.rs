//! Control over a freezer cgroup: locking, freezing, thawing and reading the
//! task list. The freezer is what keeps a container's task set stable while
//! its resources are inventoried for replacement.

mod common;
mod freezer;

pub use common::{read_cgroup_file, write_cgroup_file, WrappedIoError};
pub use freezer::{FreezerCgroup, FreezerError, FreezerState};
