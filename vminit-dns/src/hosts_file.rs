//! Thin re-export surface over the hosts-file renderer in [`crate::resolver_file`].
//!
//! Kept as its own module (mirroring the split between `/etc/resolv.conf`
//! and `/etc/hosts` in spec §6) even though both share the atomic-write
//! helper, so callers can `use vminit_dns::hosts_file::*` without pulling
//! in resolver-specific types.

pub use crate::resolver_file::{render_hosts_file, write_atomic, HostsEntry};
