//! Resolver configuration state: the last host-provided DNS record plus
//! the set of IPv6 nameservers learned from router advertisements, each
//! with an absolute expiry (spec §3 "Resolver configuration").

use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::time::{Duration, SystemTime};

use crate::config::HostResolverConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LearnedNameserver {
    pub address: Ipv6Addr,
    pub expires_at: SystemTime,
}

#[derive(Debug, Clone)]
pub struct ResolverFileState {
    host: HostResolverConfig,
    learned: Vec<LearnedNameserver>,
}

impl Default for ResolverFileState {
    fn default() -> Self {
        Self {
            host: HostResolverConfig::default(),
            learned: Vec::new(),
        }
    }
}

impl ResolverFileState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached host-provided config. Idempotent: calling with an
    /// identical config changes nothing observable (spec §4.4 "Update
    /// registration is idempotent").
    pub fn update_host_config(&mut self, config: HostResolverConfig) {
        self.host = config;
    }

    pub fn host_config(&self) -> &HostResolverConfig {
        &self.host
    }

    pub fn learned(&self) -> &[LearnedNameserver] {
        &self.learned
    }

    /// Merge a batch of RDNSS `(address, lifetime)` pairs from one router
    /// advertisement (spec §4.4 step 3).
    pub fn merge_rdnss(&mut self, now: SystemTime, entries: &[(Ipv6Addr, u32)]) {
        let mut incoming: HashMap<Ipv6Addr, u32> = HashMap::new();
        for (addr, lifetime) in entries {
            incoming.insert(*addr, *lifetime);
        }

        let mut merged = Vec::with_capacity(self.learned.len() + incoming.len());
        for existing in self.learned.drain(..) {
            match incoming.remove(&existing.address) {
                Some(0) => {
                    // lifetime zero on an update: drop.
                    continue;
                }
                Some(lifetime) => merged.push(LearnedNameserver {
                    address: existing.address,
                    expires_at: now + Duration::from_secs(lifetime as u64),
                }),
                None => merged.push(existing), // carry over untouched.
            }
        }

        // Remaining incoming entries were never seen before. A zero
        // lifetime on a never-seen entry is a no-op (spec §9 Open Question:
        // "current behavior: they are effectively no-ops").
        for (address, lifetime) in incoming {
            if lifetime == 0 {
                continue;
            }
            merged.push(LearnedNameserver {
                address,
                expires_at: now + Duration::from_secs(lifetime as u64),
            });
        }

        self.learned = merged;
    }

    /// Drop learned entries whose expiry has already passed.
    pub fn prune_expired(&mut self, now: SystemTime) {
        self.learned.retain(|ns| ns.expires_at > now);
    }

    /// Minimum positive remaining lifetime across known learned
    /// nameservers (spec §4.4 step 1). `None` when there are none — the
    /// caller should solicit immediately in that case.
    pub fn min_positive_wait(&self, now: SystemTime) -> Option<Duration> {
        self.learned
            .iter()
            .filter_map(|ns| ns.expires_at.duration_since(now).ok())
            .filter(|d| !d.is_zero())
            .min()
    }

    /// Render the merged nameserver list for one resolver file: host
    /// entries first (truncated to 2 when learned entries exist), then
    /// learned entries, with a total of at most 3 (spec §3, §4.4 step 4).
    pub fn render_nameservers(&self, now: SystemTime) -> Vec<String> {
        let active_learned: Vec<&LearnedNameserver> =
            self.learned.iter().filter(|ns| ns.expires_at > now).collect();

        let host_take = if active_learned.is_empty() { 3 } else { 2 };
        let mut result: Vec<String> = self
            .host
            .nameservers
            .iter()
            .take(host_take)
            .cloned()
            .collect();

        let remaining = 3usize.saturating_sub(result.len());
        for ns in active_learned.into_iter().take(remaining) {
            result.push(ns.address.to_string());
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u16) -> Ipv6Addr {
        Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, last)
    }

    #[test]
    fn merge_appends_new_entries_and_drops_zero_lifetime_updates() {
        let mut state = ResolverFileState::new();
        let now = SystemTime::now();
        state.merge_rdnss(now, &[(addr(1), 600), (addr(2), 600)]);
        assert_eq!(state.learned().len(), 2);

        // Update addr(1) with lifetime 0 -> dropped; addr(2) carried/refreshed.
        state.merge_rdnss(now, &[(addr(1), 0), (addr(2), 300)]);
        let learned = state.learned();
        assert_eq!(learned.len(), 1);
        assert_eq!(learned[0].address, addr(2));
    }

    #[test]
    fn never_seen_zero_lifetime_entry_is_a_no_op() {
        let mut state = ResolverFileState::new();
        let now = SystemTime::now();
        state.merge_rdnss(now, &[(addr(9), 0)]);
        assert!(state.learned().is_empty());
    }

    #[test]
    fn min_positive_wait_is_none_when_no_learned_entries() {
        let state = ResolverFileState::new();
        assert!(state.min_positive_wait(SystemTime::now()).is_none());
    }

    #[test]
    fn render_truncates_host_to_two_when_learned_present() {
        let mut state = ResolverFileState::new();
        state.update_host_config(HostResolverConfig {
            nameservers: vec![
                "10.0.0.1".into(),
                "10.0.0.2".into(),
                "10.0.0.3".into(),
                "10.0.0.4".into(),
            ],
            ..Default::default()
        });
        let now = SystemTime::now();
        state.merge_rdnss(now, &[(addr(1), 600), (addr(2), 600)]);

        let rendered = state.render_nameservers(now);
        assert_eq!(rendered, vec!["10.0.0.1", "10.0.0.2", addr(1).to_string()]);
    }

    #[test]
    fn render_allows_three_host_entries_when_no_learned_entries() {
        let mut state = ResolverFileState::new();
        state.update_host_config(HostResolverConfig {
            nameservers: vec!["10.0.0.1".into(), "10.0.0.2".into(), "10.0.0.3".into()],
            ..Default::default()
        });
        let rendered = state.render_nameservers(SystemTime::now());
        assert_eq!(rendered.len(), 3);
    }

    #[test]
    fn expired_learned_entries_are_excluded_from_render() {
        let mut state = ResolverFileState::new();
        let past = SystemTime::now() - Duration::from_secs(10);
        state.merge_rdnss(past, &[(addr(1), 1)]); // expires 1s after `past`, already gone
        let rendered = state.render_nameservers(SystemTime::now());
        assert!(rendered.is_empty());
    }
}
