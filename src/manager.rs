//! Sandbox Manager (C5): the registry of live sandboxes, their UID/GID allocation, and
//! the semaphore bounding how many run concurrently.
//!
//! Grounded on `manager/manager.go`'s role as the single owner of sandbox lifecycle:
//! callers never talk to a `Sandbox` directly, only through `create_sandbox` /
//! `run_sandbox` / `destroy_sandbox`.

use crate::{
    allocator::Allocator,
    config::Config,
    error::ServiceError,
    oci_runtime::OCIRuntime,
    sandbox::{
        config::{SandboxConfig, UserNamespaceConfig},
        report::Report,
        EngineContext, Sandbox,
    },
};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex as StdMutex},
};
use thiserror::Error;
use tokio::sync::{Mutex as TokioMutex, Semaphore};
use tokio_util::sync::CancellationToken;

/// The cgroup v2 unified hierarchy mountpoint. Not configurable: every supported host
/// mounts cgroup v2 here.
const CGROUP_ROOT: &str = "/sys/fs/cgroup";

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("sandbox {0} already exists")]
    JobConflict(String),

    #[error("sandbox {0} not found")]
    NotFound(String),
}

/// Owns every live sandbox, the UID/GID allocator they draw from, and the concurrency
/// limit on how many may run at once.
pub struct Manager {
    allocator: Allocator,
    semaphore: Arc<Semaphore>,
    sandboxes: StdMutex<HashMap<String, Arc<TokioMutex<Sandbox>>>>,
    runtime: OCIRuntime,
    ctx: EngineContext,
}

impl Manager {
    pub fn new(config: &Config, runtime: OCIRuntime) -> Self {
        let ncpu = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            allocator: Allocator::new(ncpu),
            semaphore: Arc::new(Semaphore::new(config.max_parallel_sandboxes())),
            sandboxes: StdMutex::new(HashMap::new()),
            runtime,
            ctx: EngineContext {
                runtime_state_dir: config.libcontainer_dir().clone(),
                cgroup_root: PathBuf::from(CGROUP_ROOT),
                bundle_dir: config.rootfs_dir().clone(),
                overlayfs_dir: config.overlayfs_dir().clone(),
            },
        }
    }

    /// Register a new sandbox under `id`, allocating it a disjoint UID/GID range. Does
    /// not run anything; call `run_sandbox` to execute it.
    pub fn create_sandbox(&self, id: String, mut sandbox_config: SandboxConfig) -> Result<(), ServiceError> {
        let mut sandboxes = self.sandboxes.lock().expect("sandbox map mutex");
        if sandboxes.contains_key(&id) {
            return Err(ManagerError::JobConflict(id).into());
        }

        let alloc = self.allocator.allocate()?;

        // The caller builds a `SandboxConfig` before an allocation exists; wire the real
        // UID/GID range and CPU pin in here, per the allocator->config handoff.
        sandbox_config.user_namespace = UserNamespaceConfig {
            host_uid_start: alloc.id().uid_start(),
            host_gid_start: alloc.id().gid_start(),
            size: alloc.id().uid_size(),
        };
        if sandbox_config.cgroup.cpuset_cpus.is_none() {
            sandbox_config.cgroup.cpuset_cpus = Some(alloc.cpu().to_string());
        }

        let sandbox = Sandbox::new(id.clone(), sandbox_config, alloc, &self.ctx.overlayfs_dir);
        sandboxes.insert(id, Arc::new(TokioMutex::new(sandbox)));
        Ok(())
    }

    /// Run a previously created sandbox to completion, respecting the global
    /// concurrency limit. `cancel` fires the same `SIGKILL` path as a timeout, reported
    /// as `Status::Terminated`.
    pub async fn run_sandbox(&self, id: &str, cancel: &CancellationToken) -> Result<Report, ServiceError> {
        let handle = self.handle(id)?;
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("semaphore is never closed");

        let mut sandbox = handle.lock().await;
        let report = sandbox.run(&self.runtime, &self.ctx, cancel).await?;
        Ok(report)
    }

    /// Tear down a sandbox and reclaim its UID/GID range. A no-op if `id` is unknown
    /// (already destroyed, or never created).
    pub async fn destroy_sandbox(&self, id: &str) -> Result<(), ServiceError> {
        let handle = {
            let mut sandboxes = self.sandboxes.lock().expect("sandbox map mutex");
            sandboxes.remove(id)
        };
        let Some(handle) = handle else {
            return Ok(());
        };

        let mut sandbox = handle.lock().await;
        let index = sandbox.alloc_index();
        let destroy_result = sandbox.destroy(&self.runtime, &self.ctx).await;
        self.allocator.free(index)?;
        destroy_result.map_err(ServiceError::Internal)?;
        Ok(())
    }

    fn handle(&self, id: &str) -> Result<Arc<TokioMutex<Sandbox>>, ServiceError> {
        let sandboxes = self.sandboxes.lock().expect("sandbox map mutex");
        sandboxes
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(id.to_string()).into())
    }

    #[cfg(test)]
    async fn user_namespace(&self, id: &str) -> UserNamespaceConfig {
        let handle = self.handle(id).expect("sandbox exists");
        let sandbox = handle.lock().await;
        *sandbox.config().user_namespace()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ConfigBuilder,
        oci_runtime::OCIRuntimeBuilder,
        sandbox::config::{
            CgroupConfigBuilder, Rlimit, RlimitConfigBuilder, SandboxConfigBuilder,
            UserNamespaceConfigBuilder,
        },
    };

    fn test_manager(dir: &std::path::Path) -> Manager {
        let config = ConfigBuilder::default()
            .overlayfs_dir(dir.join("overlayfs"))
            .libcontainer_dir(dir.join("libcontainer"))
            .rootfs_dir(dir.join("bundles"))
            .max_parallel_sandboxes(2usize)
            .build()
            .unwrap();
        let runtime = OCIRuntimeBuilder::default()
            .binary(which::which("echo").unwrap())
            .build()
            .unwrap();
        Manager::new(&config, runtime)
    }

    fn test_sandbox_config(dir: &std::path::Path) -> SandboxConfig {
        SandboxConfigBuilder::default()
            .rootfs_image_dir(dir.join("image"))
            .box_dir(dir.join("box"))
            .time_limit_ms(1000u64)
            .cgroup(CgroupConfigBuilder::default().build().unwrap())
            .rlimit(
                RlimitConfigBuilder::default()
                    .core(Rlimit::new(0, 0))
                    .fsize(Rlimit::new(1024 * 1024, 1024 * 1024))
                    .nofile(Rlimit::new(64, 64))
                    .build()
                    .unwrap(),
            )
            .user_namespace(
                UserNamespaceConfigBuilder::default()
                    .host_uid_start(1_000_000u32)
                    .host_gid_start(1_000_000u32)
                    .size(65536u32)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn create_sandbox_rejects_duplicate_id() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());

        manager
            .create_sandbox("job-1".to_string(), test_sandbox_config(dir.path()))
            .unwrap();
        let err = manager
            .create_sandbox("job-1".to_string(), test_sandbox_config(dir.path()))
            .unwrap_err();
        assert_eq!(err.http_status(), 409);
    }

    #[tokio::test]
    async fn run_sandbox_unknown_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());

        let err = manager
            .run_sandbox("missing", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.http_status(), 404);
    }

    #[tokio::test]
    async fn destroy_sandbox_unknown_id_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());
        manager.destroy_sandbox("missing").await.unwrap();
    }

    #[tokio::test]
    async fn create_sandbox_wires_the_real_allocation_into_the_config() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());

        // The caller's placeholder user_namespace (all zeros) must be overwritten by the
        // real allocation, and an unset cpuset_cpus must be filled from the allocated CPU.
        let mut config = test_sandbox_config(dir.path());
        config.user_namespace = UserNamespaceConfigBuilder::default()
            .host_uid_start(0u32)
            .host_gid_start(0u32)
            .size(0u32)
            .build()
            .unwrap();
        assert!(config.cgroup.cpuset_cpus.is_none());

        manager
            .create_sandbox("job-1".to_string(), config)
            .unwrap();

        let wired = manager.user_namespace("job-1").await;
        assert_ne!(wired.host_uid_start(), 0);
        assert_eq!(wired.size(), crate::allocator::SLOT_SIZE);
    }
}
