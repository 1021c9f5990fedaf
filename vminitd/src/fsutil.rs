//! Filesystem, mount and tar-archive verbs (spec §4.10 "Filesystem
//! utilities", "Mounting"). Kept free of any framing concerns so
//! [`crate::transfer`] and [`crate::dispatcher`] can share it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::mount::{mount as nix_mount, umount2, MntFlags, MsFlags};
use tokio::io::AsyncWriteExt;
use vminit_common::{AgentError, ErrorKind};
use vminit_protocol::WriteFileFlags;

const UNMOUNT_RETRY_ATTEMPTS: u32 = 50;
const UNMOUNT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// `mkdir -p`-or-plain, depending on `create_parents` (spec §4.10 "Make
/// directories").
pub async fn mkdir(path: &Path, mode: u32, create_parents: bool) -> Result<(), AgentError> {
    let result = if create_parents {
        tokio::fs::create_dir_all(path).await
    } else {
        tokio::fs::create_dir(path).await
    };
    result.map_err(|e| AgentError::from_errno("fsutil::mkdir", e))?;
    set_mode(path, mode).await
}

/// Write a whole file with the create-parent/create-if-missing/append
/// flags (spec §4.10 "write whole files with flags").
pub async fn write_file(path: &Path, mode: u32, flags: WriteFileFlags, data: &[u8]) -> Result<(), AgentError> {
    if flags.create_parent {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::from_errno("fsutil::write_file", e))?;
        }
    }

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true);
    if flags.append {
        options.append(true);
    } else {
        options.truncate(true);
    }
    if flags.create_if_missing {
        options.create(true);
    } else {
        options.create(false);
    }

    let mut file = options.open(path).await.map_err(|e| AgentError::from_errno("fsutil::write_file", e))?;
    file.write_all(data).await.map_err(|e| AgentError::from_errno("fsutil::write_file", e))?;
    file.flush().await.map_err(|e| AgentError::from_errno("fsutil::write_file", e))?;
    drop(file);
    set_mode(path, mode).await
}

async fn set_mode(path: &Path, mode: u32) -> Result<(), AgentError> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| AgentError::from_errno("fsutil::set_mode", e))
}

/// Generic mount (spec §4.10 "Generic mount and unmount").
pub async fn mount(source: &str, target: &str, fstype: &str, flags: u64, data: &str) -> Result<(), AgentError> {
    let source = source.to_string();
    let target = target.to_string();
    let fstype = fstype.to_string();
    let data = data.to_string();
    tokio::task::spawn_blocking(move || {
        let ms_flags = MsFlags::from_bits_truncate(flags);
        let data = if data.is_empty() { None } else { Some(data.as_str()) };
        let source = if source.is_empty() { None } else { Some(source.as_str()) };
        nix_mount(source, target.as_str(), Some(fstype.as_str()), ms_flags, data)
            .map_err(|e| AgentError::new(ErrorKind::Internal, "fsutil::mount", format!("mount {target} failed: {e} (errno {})", e as i32)))
    })
    .await
    .map_err(|e| AgentError::new(ErrorKind::Internal, "fsutil::mount", e.to_string()))?
}

/// Unmount, retrying on EBUSY up to 50 times with a 10ms fixed delay (spec
/// §4.10: "unmount retries on EBUSY up to 50 times with 10 ms sleep").
/// `force` maps to `MNT_FORCE`.
pub async fn unmount(target: &str, force: bool) -> Result<(), AgentError> {
    let flags = if force { MntFlags::MNT_FORCE } else { MntFlags::empty() };
    let target = target.to_string();

    let mut attempt = 0;
    loop {
        attempt += 1;
        let t = target.clone();
        let result = tokio::task::spawn_blocking(move || umount2(t.as_str(), flags))
            .await
            .map_err(|e| AgentError::new(ErrorKind::Internal, "fsutil::unmount", e.to_string()))?;

        match result {
            Ok(()) => return Ok(()),
            Err(nix::errno::Errno::EBUSY) if attempt < UNMOUNT_RETRY_ATTEMPTS => {
                tokio::time::sleep(UNMOUNT_RETRY_DELAY).await;
                continue;
            }
            Err(e) => {
                return Err(AgentError::new(
                    ErrorKind::Internal,
                    "fsutil::unmount",
                    format!("umount {target} failed: {e} (errno {})", e as i32),
                ))
            }
        }
    }
}

/// Tar up `source_dir` into a fresh temp file, returning its path (spec
/// §4.10 "out-copy tars the source then streams the bytes").
pub async fn tar_directory(source_dir: PathBuf) -> Result<tempfile::NamedTempFile, AgentError> {
    tokio::task::spawn_blocking(move || -> Result<tempfile::NamedTempFile, AgentError> {
        let file = tempfile::NamedTempFile::new().map_err(|e| AgentError::from_errno("fsutil::tar_directory", e))?;
        {
            let mut builder = tar::Builder::new(file.reopen().map_err(|e| AgentError::from_errno("fsutil::tar_directory", e))?);
            builder
                .append_dir_all(".", &source_dir)
                .map_err(|e| AgentError::from_errno("fsutil::tar_directory", e))?;
            builder.finish().map_err(|e| AgentError::from_errno("fsutil::tar_directory", e))?;
        }
        Ok(file)
    })
    .await
    .map_err(|e| AgentError::new(ErrorKind::Internal, "fsutil::tar_directory", e.to_string()))?
}

/// Extract a tar archive from `archive_path` into `dest_dir`, rejecting any
/// entry whose normalized path escapes the destination (spec §9 "Tar
/// traversal rejection": "accept only entries whose normalized path is
/// relative and does not contain `..` segments").
pub async fn untar_directory(archive_path: PathBuf, dest_dir: PathBuf) -> Result<(), AgentError> {
    tokio::task::spawn_blocking(move || -> Result<(), AgentError> {
        std::fs::create_dir_all(&dest_dir).map_err(|e| AgentError::from_errno("fsutil::untar_directory", e))?;

        let file = std::fs::File::open(&archive_path).map_err(|e| AgentError::from_errno("fsutil::untar_directory", e))?;
        let mut archive = tar::Archive::new(file);
        for entry in archive.entries().map_err(|e| AgentError::from_errno("fsutil::untar_directory", e))? {
            let mut entry = entry.map_err(|e| AgentError::from_errno("fsutil::untar_directory", e))?;
            let raw_path = entry.path().map_err(|e| AgentError::from_errno("fsutil::untar_directory", e))?.into_owned();
            let confined = confine_entry_path(&raw_path).ok_or_else(|| {
                AgentError::new(
                    ErrorKind::InvalidArgument,
                    "fsutil::untar_directory",
                    format!("tar entry {} escapes destination directory", raw_path.display()),
                )
            })?;
            entry
                .unpack(dest_dir.join(confined))
                .map_err(|e| AgentError::from_errno("fsutil::untar_directory", e))?;
        }
        Ok(())
    })
    .await
    .map_err(|e| AgentError::new(ErrorKind::Internal, "fsutil::untar_directory", e.to_string()))?
}

/// Strip a leading separator from an absolute path and reject any `..`
/// component, returning a path safe to join under a destination directory.
fn confine_entry_path(raw: &Path) -> Option<PathBuf> {
    use std::path::Component;
    let mut confined = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => confined.push(part),
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {} // strip leading separator
            Component::ParentDir => return None,
        }
    }
    Some(confined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confine_entry_path_rejects_parent_dir_traversal() {
        assert!(confine_entry_path(Path::new("../../etc/passwd")).is_none());
        assert!(confine_entry_path(Path::new("a/../../b")).is_none());
    }

    #[test]
    fn confine_entry_path_strips_leading_separator() {
        assert_eq!(confine_entry_path(Path::new("/etc/hostname")), Some(PathBuf::from("etc/hostname")));
    }

    #[test]
    fn confine_entry_path_keeps_plain_relative_paths() {
        assert_eq!(confine_entry_path(Path::new("a/b/c")), Some(PathBuf::from("a/b/c")));
    }

    #[tokio::test]
    async fn write_file_respects_create_if_missing_false() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.txt");
        let flags = WriteFileFlags { create_parent: false, create_if_missing: false, append: false };
        let err = write_file(&path, 0o644, flags, b"hi").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
    }

    #[tokio::test]
    async fn write_file_appends_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let flags = WriteFileFlags { create_parent: false, create_if_missing: true, append: false };
        write_file(&path, 0o644, flags, b"first\n").await.unwrap();
        let flags = WriteFileFlags { create_parent: false, create_if_missing: true, append: true };
        write_file(&path, 0o644, flags, b"second\n").await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "first\nsecond\n");
    }

    #[tokio::test]
    async fn tar_round_trip_preserves_tree() {
        let src = tempfile::tempdir().unwrap();
        tokio::fs::create_dir(src.path().join("sub")).await.unwrap();
        tokio::fs::write(src.path().join("sub/file.txt"), b"contents").await.unwrap();

        let archive = tar_directory(src.path().to_path_buf()).await.unwrap();
        let dest = tempfile::tempdir().unwrap();
        untar_directory(archive.path().to_path_buf(), dest.path().to_path_buf()).await.unwrap();

        let round_tripped = tokio::fs::read_to_string(dest.path().join("sub/file.txt")).await.unwrap();
        assert_eq!(round_tripped, "contents");
    }
}
