//! SandboxConfig: the data a caller hands to the Sandbox Engine to describe one
//! execution. Grounded on the original `sandbox/config.go`.

use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use std::path::PathBuf;

/// A single rlimit's hard/soft pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Builder, CopyGetters)]
#[builder(pattern = "owned", setter(into))]
pub struct Rlimit {
    #[getset(get_copy = "pub")]
    pub hard: u64,
    #[getset(get_copy = "pub")]
    pub soft: u64,
}

impl Rlimit {
    pub fn new(hard: u64, soft: u64) -> Self {
        Self { hard, soft }
    }
}

/// POSIX rlimits applied to the sandboxed process.
#[derive(Clone, Debug, Builder, Getters)]
#[builder(pattern = "owned", setter(into))]
pub struct RlimitConfig {
    #[getset(get = "pub")]
    pub core: Rlimit,
    #[getset(get = "pub")]
    pub fsize: Rlimit,
    #[getset(get = "pub")]
    pub nofile: Rlimit,
}

/// cgroup v2 resource limits for one sandbox.
#[derive(Clone, Debug, Default, Builder, Getters, CopyGetters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
pub struct CgroupConfig {
    #[getset(get_copy = "pub")]
    pub memory: Option<u64>,
    #[getset(get_copy = "pub")]
    pub pids_limit: Option<i64>,
    #[getset(get_copy = "pub")]
    pub cpu_quota: Option<i64>,
    #[getset(get_copy = "pub")]
    pub cpu_shares: Option<u64>,
    #[getset(get = "pub")]
    pub cpuset_cpus: Option<String>,
    #[getset(get = "pub")]
    pub cpuset_mems: Option<String>,
}

/// User namespace mapping: the container always maps its own UID/GID 0 onto a disjoint
/// host-side sub-range handed out by the allocator.
#[derive(Clone, Copy, Debug, Builder, CopyGetters)]
#[builder(pattern = "owned", setter(into))]
pub struct UserNamespaceConfig {
    #[getset(get_copy = "pub")]
    pub host_uid_start: u32,
    #[getset(get_copy = "pub")]
    pub host_gid_start: u32,
    #[getset(get_copy = "pub")]
    pub size: u32,
}

/// Source of a file to stage into the sandbox: either copied from disk, or written
/// verbatim from inline content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileSource {
    Path(PathBuf),
    Content(String),
}

/// One file staging entry: `src` is copied or written to `dst` inside the box directory
/// before the sandbox runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    pub src: FileSource,
    pub dst: PathBuf,
}

/// Default wall-clock hard-kill multiplier over `time_limit_ms`, per the timeout race
/// design: two independent mechanisms, this one a last-resort safety net.
pub const DEFAULT_TIMEOUT_MULTIPLIER: u32 = 3;

/// SandboxConfig fully describes one sandboxed execution.
#[derive(Clone, Debug, Builder, Getters, CopyGetters)]
#[builder(pattern = "owned", setter(into, strip_option))]
pub struct SandboxConfig {
    #[getset(get = "pub")]
    /// Shared, read-only rootfs lower layer (an unpacked image directory).
    pub rootfs_image_dir: PathBuf,

    #[getset(get = "pub")]
    /// Host directory bind-mounted at `/box` inside the sandbox.
    pub box_dir: PathBuf,

    #[getset(get = "pub")]
    #[builder(default)]
    pub args: Vec<String>,

    #[getset(get = "pub")]
    #[builder(default)]
    pub env: Vec<String>,

    #[getset(get = "pub")]
    #[builder(default = "\"/box\".to_string()")]
    pub cwd: String,

    #[getset(get = "pub")]
    #[builder(default)]
    pub stdin: String,

    #[getset(get_copy = "pub")]
    pub time_limit_ms: u64,

    #[getset(get_copy = "pub")]
    #[builder(default = "DEFAULT_TIMEOUT_MULTIPLIER")]
    /// Wall-clock hard-kill fires at `time_limit_ms * timeout_multiplier`.
    pub timeout_multiplier: u32,

    #[getset(get = "pub")]
    #[builder(default)]
    pub cgroup: CgroupConfig,

    #[getset(get = "pub")]
    pub rlimit: RlimitConfig,

    #[getset(get = "pub")]
    pub user_namespace: UserNamespaceConfig,

    #[getset(get = "pub")]
    #[builder(default)]
    pub files: Vec<FileEntry>,
}

impl SandboxConfig {
    /// The wall-clock duration after which the sandbox is forcibly killed regardless of
    /// process state.
    pub fn hard_kill_after(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.time_limit_ms * self.timeout_multiplier as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rlimit_config() -> RlimitConfig {
        RlimitConfigBuilder::default()
            .core(Rlimit::new(0, 0))
            .fsize(Rlimit::new(1024 * 1024, 1024 * 1024))
            .nofile(Rlimit::new(64, 64))
            .build()
            .unwrap()
    }

    #[test]
    fn hard_kill_after_applies_multiplier() {
        let cfg = SandboxConfigBuilder::default()
            .rootfs_image_dir("/images/cpp")
            .box_dir("/storage/job/proc-0")
            .time_limit_ms(1000u64)
            .rlimit(rlimit_config())
            .user_namespace(
                UserNamespaceConfigBuilder::default()
                    .host_uid_start(1_000_000u32)
                    .host_gid_start(1_000_000u32)
                    .size(65536u32)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();

        assert_eq!(cfg.hard_kill_after(), std::time::Duration::from_millis(3000));
    }

    #[test]
    fn cwd_defaults_to_box() {
        let cfg = SandboxConfigBuilder::default()
            .rootfs_image_dir("/images/cpp")
            .box_dir("/storage/job/proc-0")
            .time_limit_ms(1000u64)
            .rlimit(rlimit_config())
            .user_namespace(
                UserNamespaceConfigBuilder::default()
                    .host_uid_start(1_000_000u32)
                    .host_gid_start(1_000_000u32)
                    .size(65536u32)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();

        assert_eq!(cfg.cwd(), "/box");
    }
}
