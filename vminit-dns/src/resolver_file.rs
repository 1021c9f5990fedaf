//! Resolver and hosts file writers (spec §6 "Resolver file format",
//! "Hosts file format"). Both are written atomically via a temp file plus
//! rename, the same "write-then-rename" discipline the rest of this
//! workspace uses for config files it cannot afford to leave half-written.

use std::path::Path;

use tokio::io::AsyncWriteExt;
use vminit_common::{AgentError, ErrorKind};

use crate::config::HostResolverConfig;
use crate::resolver_state::ResolverFileState;

/// Render the resolver file body for one path registration.
pub fn render_resolver_file(state: &ResolverFileState, now: std::time::SystemTime) -> String {
    let mut out = String::new();
    for ns in state.render_nameservers(now) {
        out.push_str("nameserver ");
        out.push_str(&ns);
        out.push('\n');
    }
    if let Some(domain) = &state.host_config().domain {
        out.push_str("domain ");
        out.push_str(domain);
        out.push('\n');
    }
    if !state.host_config().search.is_empty() {
        out.push_str("search ");
        out.push_str(&state.host_config().search.join(" "));
        out.push('\n');
    }
    if !state.host_config().options.is_empty() {
        out.push_str("options ");
        out.push_str(&state.host_config().options.join(" "));
        out.push('\n');
    }
    out
}

/// Write `contents` to `path` atomically: write to `path.tmp` in the same
/// directory, then rename over the destination.
pub async fn write_atomic(path: &Path, contents: &str) -> Result<(), AgentError> {
    let tmp_path = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| AgentError::from_errno("resolver_file::write_atomic", e))?;
    file.write_all(contents.as_bytes())
        .await
        .map_err(|e| AgentError::from_errno("resolver_file::write_atomic", e))?;
    file.flush()
        .await
        .map_err(|e| AgentError::from_errno("resolver_file::write_atomic", e))?;
    drop(file);
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| AgentError::from_errno("resolver_file::write_atomic", e))?;
    Ok(())
}

/// One hosts-file entry (spec §6 "Hosts file format").
#[derive(Debug, Clone)]
pub struct HostsEntry {
    pub address: String,
    pub hostnames: Vec<String>,
    pub comment: Option<String>,
}

/// Render a hosts file from entries, with an optional file-level comment.
pub fn render_hosts_file(entries: &[HostsEntry], file_comment: Option<&str>) -> Result<String, AgentError> {
    let mut out = String::new();
    if let Some(comment) = file_comment {
        out.push_str("# ");
        out.push_str(comment);
        out.push('\n');
    }
    for entry in entries {
        if entry.hostnames.is_empty() {
            return Err(AgentError::new(
                ErrorKind::InvalidArgument,
                "hosts_file::render",
                format!("entry for {} has no hostnames", entry.address),
            ));
        }
        out.push_str(&entry.address);
        out.push(' ');
        out.push_str(&entry.hostnames.join(" "));
        if let Some(comment) = &entry.comment {
            out.push_str(" # ");
            out.push_str(comment);
        }
        out.push('\n');
    }
    Ok(out)
}

/// Build a host-provided config plus the current in-memory state into a
/// fully rendered resolver file and write it. Used both by the DNS monitor
/// and by the `update(path, config)` request handler path (spec §4.10 DNS
/// / hosts).
pub async fn rewrite_resolver_file(
    path: &Path,
    state: &ResolverFileState,
    now: std::time::SystemTime,
) -> Result<(), AgentError> {
    let body = render_resolver_file(state, now);
    write_atomic(path, &body).await
}

pub fn default_host_config_from(nameservers: Vec<String>, domain: Option<String>) -> HostResolverConfig {
    HostResolverConfig {
        nameservers,
        domain,
        search: Vec::new(),
        options: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostResolverConfig;
    use std::time::SystemTime;

    #[test]
    fn renders_nameserver_domain_search_and_options_lines() {
        let mut state = ResolverFileState::new();
        state.update_host_config(HostResolverConfig {
            nameservers: vec!["10.0.0.1".into()],
            domain: Some("lan".into()),
            search: vec!["lan".into(), "corp".into()],
            options: vec!["edns0".into()],
        });
        let body = render_resolver_file(&state, SystemTime::now());
        assert_eq!(
            body,
            "nameserver 10.0.0.1\ndomain lan\nsearch lan corp\noptions edns0\n"
        );
    }

    #[tokio::test]
    async fn write_atomic_round_trips_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");
        write_atomic(&path, "nameserver 1.1.1.1\n").await.unwrap();
        let read_back = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(read_back, "nameserver 1.1.1.1\n");
        // tmp file must not linger.
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn hosts_file_rejects_entry_with_no_hostnames() {
        let entries = vec![HostsEntry {
            address: "10.0.0.1".into(),
            hostnames: vec![],
            comment: None,
        }];
        let err = render_hosts_file(&entries, None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[test]
    fn hosts_file_renders_address_names_and_comment() {
        let entries = vec![HostsEntry {
            address: "10.0.0.1".into(),
            hostnames: vec!["container-a".into(), "a.local".into()],
            comment: Some("static".into()),
        }];
        let body = render_hosts_file(&entries, Some("managed by vminitd")).unwrap();
        assert_eq!(
            body,
            "# managed by vminitd\n10.0.0.1 container-a a.local # static\n"
        );
    }
}
