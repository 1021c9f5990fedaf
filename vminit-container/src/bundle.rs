//! On-disk bundle layout: one directory per container, holding the runtime
//! spec, per-exec process specs, and a scratch area (spec §3 "Bundle", §6
//! "Persisted state").
//!
//! Deterministic from the container id: `<bundle_root>/<id>`, matching the
//! fixed root `/run/container/<id>` from spec §6, with exec specs at
//! `<bundle>/execs/<exec-id>/process.json`.

use std::path::{Path, PathBuf};

use vminit_common::{AgentError, ErrorKind};

use crate::spec::ProcessSpec;

pub struct Bundle {
    root: PathBuf,
}

impl Bundle {
    /// Deterministic bundle path for `container_id` under `bundle_root`
    /// (spec §3: "The bundle path is deterministic from the ID").
    pub fn path_for(bundle_root: &Path, container_id: &str) -> PathBuf {
        bundle_root.join(container_id)
    }

    fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Materialize the bundle directory, write the init process spec, and
    /// create the scratch subdirectory (spec §4.9 step 2).
    pub async fn create(bundle_root: &Path, container_id: &str, init: &ProcessSpec) -> Result<Self, AgentError> {
        let root = Self::path_for(bundle_root, container_id);
        if root.exists() {
            return Err(AgentError::already_exists(
                "Bundle::create",
                format!("bundle for container {container_id} already exists at {}", root.display()),
            ));
        }

        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| AgentError::from_errno("Bundle::create", e))?;
        tokio::fs::create_dir_all(root.join("execs"))
            .await
            .map_err(|e| AgentError::from_errno("Bundle::create", e))?;
        tokio::fs::create_dir_all(root.join("scratch"))
            .await
            .map_err(|e| AgentError::from_errno("Bundle::create", e))?;

        let bundle = Self::new(root);
        bundle.write_process_spec_at(&bundle.config_path(), init).await?;
        Ok(bundle)
    }

    /// Open a handle to an already-materialized bundle (used when the
    /// manager is reconstructed for an already-running container).
    pub fn open(bundle_root: &Path, container_id: &str) -> Self {
        Self::new(Self::path_for(bundle_root, container_id))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join("scratch")
    }

    fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn read_init_spec(&self) -> Result<ProcessSpec, AgentError> {
        self.read_process_spec_at(&self.config_path())
    }

    /// Overwrite the stored init process spec in place (used by the
    /// `GetEnv`/`SetEnv` request verbs, spec §4.10 "Environment").
    pub async fn rewrite_init_spec(&self, spec: &ProcessSpec) -> Result<(), AgentError> {
        self.write_process_spec_at(&self.config_path(), spec).await
    }

    fn exec_dir(&self, exec_id: &str) -> PathBuf {
        self.root.join("execs").join(exec_id)
    }

    fn exec_spec_path(&self, exec_id: &str) -> PathBuf {
        self.exec_dir(exec_id).join("process.json")
    }

    /// Serialize a per-exec process spec into the bundle (spec §4.9
    /// `createExec`).
    pub async fn write_exec_spec(&self, exec_id: &str, process: &ProcessSpec) -> Result<(), AgentError> {
        tokio::fs::create_dir_all(self.exec_dir(exec_id))
            .await
            .map_err(|e| AgentError::from_errno("Bundle::write_exec_spec", e))?;
        self.write_process_spec_at(&self.exec_spec_path(exec_id), process).await
    }

    pub fn read_exec_spec(&self, exec_id: &str) -> Result<ProcessSpec, AgentError> {
        self.read_process_spec_at(&self.exec_spec_path(exec_id))
    }

    /// Remove one exec's spec directory (spec §4.9 `deleteExec`).
    pub async fn remove_exec_spec(&self, exec_id: &str) -> Result<(), AgentError> {
        let dir = self.exec_dir(exec_id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|e| AgentError::from_errno("Bundle::remove_exec_spec", e))?;
        }
        Ok(())
    }

    pub fn exec_spec_exists(&self, exec_id: &str) -> bool {
        self.exec_spec_path(exec_id).exists()
    }

    /// Tear down the whole bundle directory (spec §4.9 `delete`, §8
    /// "the bundle directory does not exist").
    pub async fn remove(&self) -> Result<(), AgentError> {
        if self.root.exists() {
            tokio::fs::remove_dir_all(&self.root)
                .await
                .map_err(|e| AgentError::from_errno("Bundle::remove", e))?;
        }
        Ok(())
    }

    async fn write_process_spec_at(&self, path: &Path, spec: &ProcessSpec) -> Result<(), AgentError> {
        let json = serde_json::to_vec_pretty(spec)
            .map_err(|e| AgentError::new(ErrorKind::InvalidArgument, "Bundle::write_process_spec", e.to_string()))?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| AgentError::from_errno("Bundle::write_process_spec", e))
    }

    fn read_process_spec_at(&self, path: &Path) -> Result<ProcessSpec, AgentError> {
        let bytes = std::fs::read(path).map_err(|e| AgentError::from_errno("Bundle::read_process_spec", e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| AgentError::new(ErrorKind::InvalidArgument, "Bundle::read_process_spec", e.to_string()))
    }

    /// Ensure `/etc/hostname` exists in the rootfs when the container spec
    /// carries a hostname (spec §4.9 step 2).
    pub async fn ensure_hostname(rootfs: &Path, hostname: Option<&str>) -> Result<(), AgentError> {
        let Some(hostname) = hostname else { return Ok(()) };
        let path = rootfs.join("etc/hostname");
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::from_errno("Bundle::ensure_hostname", e))?;
        }
        tokio::fs::write(&path, format!("{hostname}\n"))
            .await
            .map_err(|e| AgentError::from_errno("Bundle::ensure_hostname", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ProcessSpec;

    fn sample_spec() -> ProcessSpec {
        ProcessSpec {
            args: vec!["/bin/sh".into()],
            env: vec![],
            cwd: "/".into(),
            terminal: false,
            user: Default::default(),
        }
    }

    #[tokio::test]
    async fn create_materializes_directories_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = Bundle::create(dir.path(), "c1", &sample_spec()).await.unwrap();
        assert!(bundle.root().join("execs").is_dir());
        assert!(bundle.root().join("scratch").is_dir());
        let read_back = bundle.read_init_spec().unwrap();
        assert_eq!(read_back.args, vec!["/bin/sh".to_string()]);
    }

    #[tokio::test]
    async fn create_twice_is_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        Bundle::create(dir.path(), "c1", &sample_spec()).await.unwrap();
        let err = Bundle::create(dir.path(), "c1", &sample_spec()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn exec_spec_round_trips_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = Bundle::create(dir.path(), "c1", &sample_spec()).await.unwrap();
        bundle.write_exec_spec("e1", &sample_spec()).await.unwrap();
        assert!(bundle.exec_spec_exists("e1"));
        bundle.read_exec_spec("e1").unwrap();

        bundle.remove_exec_spec("e1").await.unwrap();
        assert!(!bundle.exec_spec_exists("e1"));
    }

    #[tokio::test]
    async fn remove_deletes_whole_bundle_directory() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = Bundle::create(dir.path(), "c1", &sample_spec()).await.unwrap();
        let root = bundle.root().to_path_buf();
        bundle.remove().await.unwrap();
        assert!(!root.exists());
    }
}
