//! The Sandbox Engine (C4): runs a single sandboxed execution end to end.
//!
//! Grounded on `sandbox/sandbox.go`'s run sequence: build the overlayfs, stage input
//! files, write an OCI bundle, spawn the container with piped stdio, race a wall-clock
//! hard-kill against the process exiting on its own, then classify the outcome from
//! cgroup accounting.

pub mod cgroup;
pub mod config;
pub mod report;

use crate::{
    allocator::AllocResult,
    oci_runtime::{GlobalArgs, KillArgs, OCIRuntime, RunArgs, Subcommand},
    oci_spec,
    rootfs::Overlayfs,
    stager,
};
use anyhow::Context;
use config::SandboxConfig;
use report::{classify, CgroupStats, Report, Status};
use std::{
    os::unix::process::ExitStatusExt,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("prepare overlayfs: {0}")]
    Overlayfs(#[source] anyhow::Error),

    #[error("stage files: {0}")]
    Stage(#[source] anyhow::Error),

    #[error("write OCI bundle: {0}")]
    Bundle(#[source] anyhow::Error),

    #[error("spawn container process: {0}")]
    Spawn(#[source] anyhow::Error),

    #[error("sandbox {0} is already running")]
    AlreadyRunning(String),
}

/// Lifecycle state of one sandbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Created,
    Running,
    Finished,
    Destroyed,
}

/// Paths the engine needs that outlive any single sandbox: where the container runtime
/// keeps its state, where cgroup v2 is mounted, and where OCI bundles are written.
#[derive(Clone, Debug)]
pub struct EngineContext {
    pub runtime_state_dir: PathBuf,
    pub cgroup_root: PathBuf,
    pub bundle_dir: PathBuf,
    pub overlayfs_dir: PathBuf,
}

/// One sandboxed execution: an allocated UID/GID range, an overlayfs rootfs and the
/// config describing what to run inside it.
pub struct Sandbox {
    id: String,
    config: SandboxConfig,
    alloc: AllocResult,
    overlayfs: Overlayfs,
    state: State,
}

impl Sandbox {
    pub fn new(id: String, config: SandboxConfig, alloc: AllocResult, overlayfs_dir: &Path) -> Self {
        let overlayfs = Overlayfs::new(overlayfs_dir, &id, config.rootfs_image_dir().clone());
        Self {
            id,
            config,
            alloc,
            overlayfs,
            state: State::Created,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub(crate) fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// The allocator slot this sandbox holds, so the owner can free it on teardown.
    pub fn alloc_index(&self) -> usize {
        self.alloc.index()
    }

    fn bundle_dir(&self, ctx: &EngineContext) -> PathBuf {
        ctx.bundle_dir.join(format!("bundle-{}", self.id))
    }

    /// Run the sandbox to completion and produce a `Report`. Failures before the
    /// container process starts are returned as `SandboxError`; failures afterwards
    /// (e.g. cgroup stats unreadable) are absorbed into a best-effort `Report` with
    /// `Status::Unknown` rather than discarding whatever output was captured.
    ///
    /// `cancel` races alongside the wall-clock hard-kill: a caller cancelling mid-run
    /// gets the same `SIGKILL` treatment as a timeout, but is reported as
    /// `Status::Terminated` rather than `TimeLimitExceeded`.
    pub async fn run(
        &mut self,
        runtime: &OCIRuntime,
        ctx: &EngineContext,
        cancel: &CancellationToken,
    ) -> Result<Report, SandboxError> {
        if self.state != State::Created {
            return Err(SandboxError::AlreadyRunning(self.id.clone()));
        }

        self.overlayfs
            .prepare(self.alloc.id().uid_start(), self.alloc.id().gid_start())
            .map_err(SandboxError::Overlayfs)?;

        stager::stage(self.config.box_dir(), self.config.files()).map_err(SandboxError::Stage)?;

        let bundle_dir = self.bundle_dir(ctx);
        std::fs::create_dir_all(&bundle_dir)
            .with_context(|| format!("create bundle dir {}", bundle_dir.display()))
            .map_err(SandboxError::Bundle)?;

        let spec = oci_spec::build_spec(&self.id, &self.config, &self.alloc, &self.overlayfs);
        spec.save(&bundle_dir.join("config.json"))
            .map_err(SandboxError::Bundle)?;

        let global_args = [
            GlobalArgs::Root(ctx.runtime_state_dir.clone()),
            GlobalArgs::SystemdCgroup,
        ];

        let mut child = runtime
            .spawn(
                &Subcommand::Run((self.id.clone(), vec![RunArgs::Bundle(bundle_dir)])),
                &global_args,
            )
            .await
            .map_err(SandboxError::Spawn)?;

        self.state = State::Running;
        let start_at = now_ms();

        let mut stdin = child.stdin.take().expect("spawn() always pipes stdin");
        let stdin_bytes = self.config.stdin().clone().into_bytes();
        let stdin_task = tokio::spawn(async move {
            let _ = stdin.write_all(&stdin_bytes).await;
            drop(stdin);
        });

        let mut stdout_pipe = child.stdout.take().expect("spawn() always pipes stdout");
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stdout_pipe.read_to_end(&mut buf).await;
            buf
        });

        let mut stderr_pipe = child.stderr.take().expect("spawn() always pipes stderr");
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Race {
            Exited,
            TimedOut,
            Cancelled,
        }

        let race = tokio::select! {
            _ = child.wait() => Race::Exited,
            _ = tokio::time::sleep(self.config.hard_kill_after()) => Race::TimedOut,
            _ = cancel.cancelled() => Race::Cancelled,
        };

        if !matches!(race, Race::Exited) {
            let _ = runtime
                .run_output(
                    &Subcommand::Kill((self.id.clone(), vec![KillArgs::All])),
                    &[GlobalArgs::Root(ctx.runtime_state_dir.clone())],
                )
                .await;
        }

        let exit_status = child.wait().await.ok();
        let finish_at = now_ms();
        self.state = State::Finished;

        let _ = stdin_task.await;
        let stdout_bytes = stdout_task.await.unwrap_or_default();
        let stderr_bytes = stderr_task.await.unwrap_or_default();

        let (exit_code, signal) = match exit_status {
            Some(status) => (status.code().unwrap_or(-1), status.signal().unwrap_or(0)),
            None => (-1, 0),
        };

        let scope = cgroup::scope_path(&ctx.cgroup_root, &self.id);
        let (stats, forced_unknown) = match cgroup::read_stats(&scope) {
            Ok(stats) => (stats, false),
            Err(_) => (CgroupStats::default(), true),
        };

        let status = match (forced_unknown, race) {
            (true, _) => Status::Unknown,
            (false, Race::Cancelled) => Status::Terminated,
            (false, _) => classify(
                race == Race::TimedOut,
                stats,
                self.config.time_limit_ms(),
                self.config.cgroup().memory(),
                exit_code,
                signal,
            ),
        };

        Ok(Report {
            status,
            exit_code,
            signal,
            stdout: String::from_utf8_lossy(&stdout_bytes).into_owned(),
            stderr: String::from_utf8_lossy(&stderr_bytes).into_owned(),
            cpu_time_usec: stats.cpu_time_usec() as i64,
            memory_bytes: stats.memory_peak_bytes() as i64,
            wall_time_ms: finish_at - start_at,
            start_at,
            finish_at,
        })
    }

    /// Tear down the sandbox's container and overlayfs. Idempotent: safe to call after a
    /// failed or already-destroyed sandbox.
    pub async fn destroy(&mut self, runtime: &OCIRuntime, ctx: &EngineContext) -> anyhow::Result<()> {
        if self.state == State::Destroyed {
            return Ok(());
        }

        let _ = runtime
            .run_output(
                &Subcommand::Delete(self.id.clone()),
                &[GlobalArgs::Root(ctx.runtime_state_dir.clone())],
            )
            .await;

        self.overlayfs.destroy()?;
        self.state = State::Destroyed;
        Ok(())
    }
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::config::{
        CgroupConfigBuilder, Rlimit, RlimitConfigBuilder, SandboxConfigBuilder,
        UserNamespaceConfigBuilder,
    };

    fn test_config(box_dir: &Path) -> SandboxConfig {
        SandboxConfigBuilder::default()
            .rootfs_image_dir("/images/cpp")
            .box_dir(box_dir.to_path_buf())
            .args(vec!["/bin/true".to_string()])
            .time_limit_ms(1000u64)
            .cgroup(CgroupConfigBuilder::default().memory(256u64 * 1024 * 1024).build().unwrap())
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
    fn new_sandbox_starts_in_created_state() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = crate::allocator::Allocator::new(4).allocate().unwrap();
        let config = test_config(dir.path());
        let sandbox = Sandbox::new("id".to_string(), config, alloc, dir.path());
        assert_eq!(sandbox.state(), State::Created);
        assert_eq!(sandbox.id(), "id");
    }

    #[tokio::test]
    async fn destroy_before_run_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let alloc = crate::allocator::Allocator::new(4).allocate().unwrap();
        let config = test_config(dir.path());
        let mut sandbox = Sandbox::new("id".to_string(), config, alloc, dir.path());

        let runtime = crate::oci_runtime::OCIRuntimeBuilder::default()
            .binary(which::which("echo").unwrap())
            .build()
            .unwrap();
        let ctx = EngineContext {
            runtime_state_dir: dir.path().to_path_buf(),
            cgroup_root: dir.path().to_path_buf(),
            bundle_dir: dir.path().to_path_buf(),
            overlayfs_dir: dir.path().to_path_buf(),
        };

        sandbox.destroy(&runtime, &ctx).await.unwrap();
        assert_eq!(sandbox.state(), State::Destroyed);
        sandbox.destroy(&runtime, &ctx).await.unwrap();
    }
}
