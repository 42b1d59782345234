//! Engine for replacing a stub filesystem under live processes.
//!
//! A stub filesystem occupies a mountpoint inside a container. This crate
//! freezes the container, inventories every file descriptor, memory mapping,
//! working directory and root that still references the stub, deduplicates
//! the underlying kernel objects with kcmp(2), bind-mounts the real
//! filesystem over the stub's paths and finally rewires each process through
//! ptrace so the workload never notices the exchange.
//!
//! The top-level entry point is [`replace::replace_resources`].

pub mod exec;
pub mod kcmp;
pub mod mount;
pub mod namespaces;
pub mod process;
pub mod registry;
pub mod replace;
pub mod stub;
pub mod swap;
