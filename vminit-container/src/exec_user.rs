//! Resolves the effective process owner against a rootfs's `/etc/passwd`
//! and `/etc/group` (spec §4.9 step 2, "getExecUser"), and fills in the
//! environment defaults a shell expects.

use std::collections::BTreeSet;
use std::path::Path;

use vminit_common::{AgentError, ErrorKind};

use crate::spec::UserSpec;

/// A resolved process owner, ready to be applied after fork (`setuid` /
/// `setgid` / `setgroups`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUser {
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    /// Deduplicated, sorted supplementary group ids (spec §4.9 step 2:
    /// "deduplicate supplementary groups").
    pub supplementary_gids: Vec<u32>,
}

/// Resolve `requested` against `rootfs`'s passwd/group files. A bare
/// username is looked up by name; `uid[:gid]` is used directly without a
/// passwd lookup except to fill in `home`, falling back to `/` when the
/// uid has no passwd entry.
pub async fn resolve(rootfs: &Path, requested: &UserSpec) -> Result<ResolvedUser, AgentError> {
    let passwd = read_passwd(rootfs).await;
    let group = read_group(rootfs).await;

    let (uid, gid, home) = if let Some(name) = &requested.username {
        match passwd.iter().find(|e| &e.name == name) {
            Some(entry) => (entry.uid, entry.gid, entry.home.clone()),
            None => {
                return Err(AgentError::new(
                    ErrorKind::NotFound,
                    "exec_user::resolve",
                    format!("no passwd entry for user {name}"),
                ))
            }
        }
    } else {
        let uid = requested.uid.unwrap_or(0);
        let gid = requested
            .gid
            .or_else(|| passwd.iter().find(|e| e.uid == uid).map(|e| e.gid))
            .unwrap_or(0);
        let home = passwd
            .iter()
            .find(|e| e.uid == uid)
            .map(|e| e.home.clone())
            .unwrap_or_else(|| "/".to_string());
        (uid, gid, home)
    };

    let mut gids: BTreeSet<u32> = requested.additional_gids.iter().copied().collect();
    for name_membership in &group {
        if name_membership.members.iter().any(|m| passwd.iter().any(|p| &p.name == m && p.uid == uid)) {
            gids.insert(name_membership.gid);
        }
    }
    gids.insert(gid);

    Ok(ResolvedUser {
        uid,
        gid,
        home,
        supplementary_gids: gids.into_iter().collect(),
    })
}

/// Fill `PATH`, `HOME`, `TERM` into an environment list when they are not
/// already present (spec §4.9 step 2: "fill missing PATH/HOME/TERM
/// environment").
pub fn fill_default_env(env: &[String], home: &str, terminal: bool) -> Vec<String> {
    let mut result = env.to_vec();
    let has = |prefix: &str| result.iter().any(|e| e.starts_with(prefix));

    if !has("PATH=") {
        result.push("PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string());
    }
    if !has("HOME=") {
        result.push(format!("HOME={home}"));
    }
    if terminal && !has("TERM=") {
        result.push("TERM=xterm".to_string());
    }
    result
}

struct PasswdEntry {
    name: String,
    uid: u32,
    gid: u32,
    home: String,
}

struct GroupEntry {
    gid: u32,
    members: Vec<String>,
}

async fn read_passwd(rootfs: &Path) -> Vec<PasswdEntry> {
    let Ok(contents) = tokio::fs::read_to_string(rootfs.join("etc/passwd")).await else {
        return Vec::new();
    };
    contents
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 6 {
                return None;
            }
            Some(PasswdEntry {
                name: fields[0].to_string(),
                uid: fields[2].parse().ok()?,
                gid: fields[3].parse().ok()?,
                home: fields[5].to_string(),
            })
        })
        .collect()
}

async fn read_group(rootfs: &Path) -> Vec<GroupEntry> {
    let Ok(contents) = tokio::fs::read_to_string(rootfs.join("etc/group")).await else {
        return Vec::new();
    };
    contents
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 4 {
                return None;
            }
            Some(GroupEntry {
                gid: fields[2].parse().ok()?,
                members: fields[3].split(',').filter(|m| !m.is_empty()).map(String::from).collect(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_rootfs(dir: &Path) {
        tokio::fs::create_dir_all(dir.join("etc")).await.unwrap();
        tokio::fs::write(
            dir.join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\napp:x:1000:1000:App:/home/app:/bin/sh\n",
        )
        .await
        .unwrap();
        tokio::fs::write(dir.join("etc/group"), "root:x:0:\ndocker:x:999:app\n").await.unwrap();
    }

    #[tokio::test]
    async fn resolves_by_username_and_picks_up_supplementary_group() {
        let dir = tempfile::tempdir().unwrap();
        write_rootfs(dir.path()).await;

        let resolved = resolve(
            dir.path(),
            &UserSpec { username: Some("app".into()), ..Default::default() },
        )
        .await
        .unwrap();

        assert_eq!(resolved.uid, 1000);
        assert_eq!(resolved.gid, 1000);
        assert_eq!(resolved.home, "/home/app");
        assert!(resolved.supplementary_gids.contains(&999));
        assert!(resolved.supplementary_gids.contains(&1000));
    }

    #[tokio::test]
    async fn unknown_username_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        write_rootfs(dir.path()).await;
        let err = resolve(dir.path(), &UserSpec { username: Some("ghost".into()), ..Default::default() })
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn bare_uid_defaults_to_root_when_unresolvable() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve(dir.path(), &UserSpec::default()).await.unwrap();
        assert_eq!(resolved.uid, 0);
        assert_eq!(resolved.gid, 0);
    }

    #[test]
    fn fill_default_env_only_adds_missing_keys() {
        let env = fill_default_env(&["PATH=/custom".to_string()], "/home/app", true);
        assert!(env.contains(&"PATH=/custom".to_string()));
        assert!(env.iter().any(|e| e.starts_with("HOME=")));
        assert!(env.iter().any(|e| e.starts_with("TERM=")));
    }

    #[test]
    fn supplementary_gids_are_deduplicated_and_sorted() {
        let env = fill_default_env(&[], "/root", false);
        assert!(!env.iter().any(|e| e.starts_with("TERM=")));
    }
}
