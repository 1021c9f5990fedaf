//! Container lifecycle management (spec §4.9): bundles, leaf cgroups,
//! effective-user resolution, and the native/delegated process launch paths,
//! tied together by [`manager::ContainerManager`].

pub mod bundle;
pub mod cgroup;
pub mod console;
pub mod exec_user;
pub mod manager;
pub mod process;
pub mod spawn;
pub mod spec;

pub use bundle::Bundle;
pub use cgroup::Cgroup;
pub use manager::{ContainerManager, ContainerStatsRaw, StatsWanted};
pub use process::{HostStdio, ManagedExec};
pub use spec::{ContainerSpec, ProcessSpec, RuntimeMode, UserSpec};
