//! OCI Spec Builder (C3): translates a `SandboxConfig` plus its allocated UID/GID range
//! into a full OCI runtime `Spec`.
//!
//! Grounded on `internal/sandbox/spec.go`: namespace list, `/box` bind mount id-map,
//! default mounts, masked/readonly paths and cgroup resource translation are all carried
//! over field-for-field.

pub mod runtime;

use crate::{allocator::AllocResult, rootfs::Overlayfs, sandbox::config::SandboxConfig};
use runtime::*;

/// Paths masked (replaced with a bind mount from /dev/null) inside every sandbox.
/// GHSA-6fw5-f8r9-fgfm and GHSA-jq35-85cj-fj4p document why `/proc/kcore` and friends must
/// never be exposed to an unprivileged, user-namespaced container.
const MASKED_PATHS: &[&str] = &[
    "/proc/asound",
    "/proc/acpi",
    "/proc/interrupts",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
    "/sys/devices/virtual/powercap",
];

const READONLY_PATHS: &[&str] = &[
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

/// Build the full OCI runtime spec for one sandbox.
pub fn build_spec(
    sandbox_id: &str,
    config: &SandboxConfig,
    alloc: &AllocResult,
    overlayfs: &Overlayfs,
) -> Spec {
    let root_mount = MountBuilder::default()
        .destination("/")
        .typ("overlay".to_string())
        .source("overlay")
        .options(split_options(&overlayfs.mount_options()))
        .build()
        .expect("build root mount");

    let box_mount = MountBuilder::default()
        .destination("/box")
        .typ("none".to_string())
        .source(config.box_dir().clone())
        .options(
            ["rbind", "rw", "exec", "nosuid", "nodev", "ridmap"]
                .iter()
                .map(|s| s.to_string())
                .collect::<Vec<_>>(),
        )
        .uid_mappings(vec![LinuxIDMappingBuilder::default()
            .container_id(0u32)
            .host_id(alloc.id().uid_start())
            .size(1u32)
            .build()
            .expect("build box uid mapping")])
        .gid_mappings(vec![LinuxIDMappingBuilder::default()
            .container_id(0u32)
            .host_id(alloc.id().gid_start())
            .size(1u32)
            .build()
            .expect("build box gid mapping")])
        .build()
        .expect("build box mount");

    let mut mounts = vec![root_mount, box_mount];
    mounts.extend(default_mounts());

    let linux = LinuxBuilder::default()
        .uid_mappings(vec![LinuxIDMappingBuilder::default()
            .container_id(0u32)
            .host_id(alloc.id().uid_start())
            .size(alloc.id().uid_size())
            .build()
            .expect("build uid mapping")])
        .gid_mappings(vec![LinuxIDMappingBuilder::default()
            .container_id(0u32)
            .host_id(alloc.id().gid_start())
            .size(alloc.id().gid_size())
            .build()
            .expect("build gid mapping")])
        .resources(cgroup_resources(config))
        .cgroups_path(format!("/castletown.slice/castletown-{}.scope/{}", sandbox_id, sandbox_id))
        .namespaces(
            [
                LinuxNamespaceType::User,
                LinuxNamespaceType::Mount,
                LinuxNamespaceType::Pid,
                LinuxNamespaceType::Ipc,
                LinuxNamespaceType::Uts,
                LinuxNamespaceType::Network,
                LinuxNamespaceType::Cgroup,
            ]
            .iter()
            .map(|typ| {
                LinuxNamespaceBuilder::default()
                    .typ(*typ)
                    .build()
                    .expect("build namespace")
            })
            .collect::<Vec<_>>(),
        )
        .masked_paths(MASKED_PATHS.iter().map(|p| p.to_string()).collect::<Vec<_>>())
        .readonly_paths(
            READONLY_PATHS
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>(),
        )
        .build()
        .expect("build linux section");

    let process = ProcessBuilder::default()
        .user(UserBuilder::default().uid(0u32).gid(0u32).build().expect("build user"))
        .args(config.args().clone())
        .env(config.env().clone())
        .cwd(config.cwd().clone())
        .rlimits(rlimits(config))
        .no_new_privileges(true)
        .build()
        .expect("build process");

    let root = RootBuilder::default()
        .path(overlayfs.upper_dir.clone())
        .readonly(false)
        .build()
        .expect("build root");

    SpecBuilder::default()
        .process(process)
        .root(root)
        .hostname(format!("castletown-{}", sandbox_id))
        .mounts(mounts)
        .linux(linux)
        .build()
        .expect("build spec")
}

fn split_options(opts: &str) -> Vec<String> {
    opts.split(',').map(str::to_string).collect()
}

fn default_mounts() -> Vec<Mount> {
    vec![
        MountBuilder::default()
            .destination("/proc")
            .typ("proc".to_string())
            .source("proc")
            .build()
            .expect("proc mount"),
        MountBuilder::default()
            .destination("/dev")
            .typ("tmpfs".to_string())
            .source("tmpfs")
            .options(vec![
                "nosuid".into(),
                "strictatime".into(),
                "mode=755".into(),
                "size=65536".into(),
            ])
            .build()
            .expect("dev mount"),
        MountBuilder::default()
            .destination("/dev/pts")
            .typ("devpts".to_string())
            .source("devpts")
            .options(vec![
                "nosuid".into(),
                "noexec".into(),
                "newinstance".into(),
                "ptmxmode=0666".into(),
                "mode=0620".into(),
            ])
            .build()
            .expect("devpts mount"),
        MountBuilder::default()
            .destination("/dev/shm")
            .typ("tmpfs".to_string())
            .source("shm")
            .options(vec![
                "nosuid".into(),
                "noexec".into(),
                "nodev".into(),
                "mode=1777".into(),
                "size=65536".into(),
            ])
            .build()
            .expect("shm mount"),
        MountBuilder::default()
            .destination("/dev/mqueue")
            .typ("mqueue".to_string())
            .source("mqueue")
            .options(vec!["nosuid".into(), "noexec".into(), "nodev".into()])
            .build()
            .expect("mqueue mount"),
        MountBuilder::default()
            .destination("/tmp")
            .typ("tmpfs".to_string())
            .source("tmpfs")
            .options(vec![
                "nosuid".into(),
                "noexec".into(),
                "nodev".into(),
                "size=134217728".into(),
                "nr_inodes=4096".into(),
            ])
            .build()
            .expect("tmp mount"),
        MountBuilder::default()
            .destination("/sys")
            .typ("sysfs".to_string())
            .source("sysfs")
            .options(vec![
                "nosuid".into(),
                "noexec".into(),
                "nodev".into(),
                "ro".into(),
            ])
            .build()
            .expect("sys mount"),
    ]
}

fn rlimits(config: &SandboxConfig) -> Vec<POSIXRlimit> {
    let rl = config.rlimit();
    vec![
        POSIXRlimitBuilder::default()
            .typ("RLIMIT_CORE")
            .hard(rl.core().hard())
            .soft(rl.core().soft())
            .build()
            .expect("core rlimit"),
        POSIXRlimitBuilder::default()
            .typ("RLIMIT_FSIZE")
            .hard(rl.fsize().hard())
            .soft(rl.fsize().soft())
            .build()
            .expect("fsize rlimit"),
        POSIXRlimitBuilder::default()
            .typ("RLIMIT_NOFILE")
            .hard(rl.nofile().hard())
            .soft(rl.nofile().soft())
            .build()
            .expect("nofile rlimit"),
    ]
}

/// Translate `CgroupConfig` into `LinuxResources`, only setting fields that were actually
/// configured. A memory limit implies an equal swap limit, so a sandboxed process cannot
/// escape its memory cap by swapping.
fn cgroup_resources(config: &SandboxConfig) -> LinuxResources {
    let cgroup = config.cgroup();

    let memory = cgroup.memory().map(|limit| {
        LinuxMemoryBuilder::default()
            .limit(limit as i64)
            .swap(limit as i64)
            .build()
            .expect("memory resources")
    });

    let cpu = if cgroup.cpu_quota().is_some()
        || cgroup.cpu_shares().is_some()
        || cgroup.cpuset_cpus().is_some()
        || cgroup.cpuset_mems().is_some()
    {
        let mut builder = LinuxCPUBuilder::default();
        if let Some(quota) = cgroup.cpu_quota() {
            builder = builder.quota(quota);
        }
        if let Some(shares) = cgroup.cpu_shares() {
            builder = builder.shares(shares);
        }
        if let Some(cpus) = cgroup.cpuset_cpus() {
            builder = builder.cpus(cpus.clone());
        }
        if let Some(mems) = cgroup.cpuset_mems() {
            builder = builder.mems(mems.clone());
        }
        Some(builder.build().expect("cpu resources"))
    } else {
        None
    };

    let pids = cgroup.pids_limit().map(|limit| {
        LinuxPidsBuilder::default()
            .limit(limit)
            .build()
            .expect("pids resources")
    });

    let mut builder = LinuxResourcesBuilder::default();
    if let Some(memory) = memory {
        builder = builder.memory(memory);
    }
    if let Some(cpu) = cpu {
        builder = builder.cpu(cpu);
    }
    if let Some(pids) = pids {
        builder = builder.pids(pids);
    }
    builder.build().expect("linux resources")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        allocator::Allocator,
        sandbox::config::{
            CgroupConfigBuilder, Rlimit, RlimitConfigBuilder, SandboxConfigBuilder,
            UserNamespaceConfigBuilder,
        },
    };

    fn test_config() -> SandboxConfig {
        SandboxConfigBuilder::default()
            .rootfs_image_dir("/images/cpp")
            .box_dir("/storage/job/proc-0")
            .args(vec!["/bin/cat".to_string(), "hello.txt".to_string()])
            .time_limit_ms(1000u64)
            .cgroup(
                CgroupConfigBuilder::default()
                    .memory(256u64 * 1024 * 1024)
                    .pids_limit(100i64)
                    .build()
                    .unwrap(),
            )
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
    fn spec_has_seven_namespaces() {
        let allocator = Allocator::new(4);
        let alloc = allocator.allocate().unwrap();
        let config = test_config();
        let overlayfs = Overlayfs::new(
            std::path::Path::new("/overlayfs"),
            "id",
            config.rootfs_image_dir().clone(),
        );

        let spec = build_spec("id", &config, &alloc, &overlayfs);
        assert_eq!(spec.linux().as_ref().unwrap().namespaces().as_ref().unwrap().len(), 7);
    }

    #[test]
    fn spec_masks_proc_kcore() {
        let allocator = Allocator::new(4);
        let alloc = allocator.allocate().unwrap();
        let config = test_config();
        let overlayfs = Overlayfs::new(
            std::path::Path::new("/overlayfs"),
            "id",
            config.rootfs_image_dir().clone(),
        );

        let spec = build_spec("id", &config, &alloc, &overlayfs);
        let masked = spec.linux().as_ref().unwrap().masked_paths().as_ref().unwrap();
        assert!(masked.iter().any(|p| p == "/proc/kcore"));
    }

    #[test]
    fn box_mount_maps_only_root_uid() {
        let allocator = Allocator::new(4);
        let alloc = allocator.allocate().unwrap();
        let config = test_config();
        let overlayfs = Overlayfs::new(
            std::path::Path::new("/overlayfs"),
            "id",
            config.rootfs_image_dir().clone(),
        );

        let spec = build_spec("id", &config, &alloc, &overlayfs);
        let box_mount = spec
            .mounts()
            .as_ref()
            .unwrap()
            .iter()
            .find(|m| m.destination() == std::path::Path::new("/box"))
            .unwrap();
        let mapping = &box_mount.uid_mappings().as_ref().unwrap()[0];
        assert_eq!(mapping.container_id(), 0);
        assert_eq!(mapping.size(), 1);
    }

    #[test]
    fn memory_limit_sets_matching_swap() {
        let allocator = Allocator::new(4);
        let alloc = allocator.allocate().unwrap();
        let config = test_config();
        let overlayfs = Overlayfs::new(
            std::path::Path::new("/overlayfs"),
            "id",
            config.rootfs_image_dir().clone(),
        );

        let spec = build_spec("id", &config, &alloc, &overlayfs);
        let memory = spec
            .linux()
            .as_ref()
            .unwrap()
            .resources()
            .as_ref()
            .unwrap()
            .memory()
            .as_ref()
            .unwrap();
        assert_eq!(memory.limit(), &Some(256 * 1024 * 1024));
        assert_eq!(memory.limit(), memory.swap());
    }
}
