//! OCI runtime spec types.
//!
//! A minimal subset of the [OCI runtime specification][0] sufficient to describe a
//! Castletown sandbox: process, root, mounts, and the Linux-specific namespace/cgroup/
//! mapping sections. Platform sections for Solaris, Windows and VM-based containers are
//! not modeled since every sandbox runs on Linux.
//!
//! [0]: https://github.com/opencontainers/runtime-spec

use anyhow::{Context, Result};
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::File,
    path::{Path, PathBuf},
};

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Spec is the base configuration for the container.
pub struct Spec {
    #[getset(get = "pub")]
    #[serde(rename = "ociVersion")]
    /// Version of the Open Container Initiative Runtime Specification with which the bundle
    /// complies.
    version: String,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Process configures the container process.
    process: Option<Process>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Root configures the container's root filesystem.
    root: Option<Root>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Hostname configures the container's hostname.
    hostname: Option<String>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Mounts configures additional mounts (on top of Root).
    mounts: Option<Vec<Mount>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Annotations contains arbitrary metadata for the container.
    annotations: Option<HashMap<String, String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Linux is platform-specific configuration for Linux based containers.
    linux: Option<Linux>,
}

impl Default for Spec {
    fn default() -> Self {
        Self {
            version: "1.0.2".into(),
            process: None,
            root: None,
            hostname: None,
            mounts: None,
            annotations: None,
            linux: None,
        }
    }
}

impl Spec {
    /// Load a new spec from the provided file `Path`.
    pub fn from(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("open file {}", path.display()))?;
        serde_json::from_reader(file)
            .with_context(|| format!("deserialize OCI spec from file {}", path.display()))
    }

    /// Save the loaded spec into the provided file `Path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut file =
            File::create(path).with_context(|| format!("create file {}", path.display()))?;
        serde_json::to_writer(&mut file, self)
            .with_context(|| format!("serialize OCI spec to file {}", path.display()))
    }
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// Process contains information to start a specific application inside the container.
pub struct Process {
    #[getset(get = "pub")]
    /// User specifies user information for the process.
    user: User,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Args specifies the binary and arguments for the application to execute.
    args: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Env populates the process environment for the process.
    env: Option<Vec<String>>,

    #[getset(get = "pub")]
    /// Cwd is the current working directory for the process and must be relative to the
    /// container's root.
    cwd: String,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Rlimits specifies rlimit options to apply to the process.
    rlimits: Option<Vec<POSIXRlimit>>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "noNewPrivileges"
    )]
    /// NoNewPrivileges controls whether additional privileges could be gained by processes in
    /// the container.
    no_new_privileges: Option<bool>,
}

/// User specifies specific user (and group) information for the container process.
#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
pub struct User {
    #[getset(get_copy = "pub")]
    /// UID is the user id.
    uid: u32,

    #[getset(get_copy = "pub")]
    /// GID is the group id.
    gid: u32,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// Root contains information about the container's root filesystem on the host.
pub struct Root {
    #[getset(get = "pub")]
    /// Path is the absolute path to the container's root filesystem.
    path: PathBuf,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Readonly makes the root filesystem for the container readonly before the process is
    /// executed.
    readonly: Option<bool>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Mount specifies a mount for a container.
pub struct Mount {
    #[getset(get = "pub")]
    /// Destination is the absolute path where the mount will be placed in the container.
    destination: PathBuf,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    /// Type specifies the mount kind.
    typ: Option<String>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Source specifies the source path of the mount.
    source: Option<PathBuf>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Options are fstab style mount options.
    options: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "uidMappings"
    )]
    /// UIDMappings specifies how host UIDs are mapped for files created through this mount.
    uid_mappings: Option<Vec<LinuxIDMapping>>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "gidMappings"
    )]
    /// GIDMappings specifies how host GIDs are mapped for files created through this mount.
    gid_mappings: Option<Vec<LinuxIDMapping>>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// Linux contains platform-specific configuration for Linux based containers.
pub struct Linux {
    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "uidMappings"
    )]
    /// UIDMappings specifies user mappings for supporting user namespaces.
    uid_mappings: Option<Vec<LinuxIDMapping>>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "gidMappings"
    )]
    /// GIDMappings specifies group mappings for supporting user namespaces.
    gid_mappings: Option<Vec<LinuxIDMapping>>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Resources contain cgroup information for handling resource constraints for the
    /// container.
    resources: Option<LinuxResources>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "cgroupsPath"
    )]
    /// CgroupsPath specifies the path to cgroups that are created and/or joined by the
    /// container, relative to the cgroups mountpoint.
    cgroups_path: Option<PathBuf>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Namespaces contains the namespaces that are created and/or joined by the container.
    namespaces: Option<Vec<LinuxNamespace>>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "maskedPaths"
    )]
    /// MaskedPaths masks over the provided paths inside the container.
    masked_paths: Option<Vec<String>>,

    #[getset(get = "pub")]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "readonlyPaths"
    )]
    /// ReadonlyPaths sets the provided paths as RO inside the container.
    readonly_paths: Option<Vec<String>>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, CopyGetters, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// LinuxNamespace is the configuration for a Linux namespace.
pub struct LinuxNamespace {
    #[getset(get_copy = "pub")]
    #[serde(rename = "type")]
    /// Type is the type of namespace.
    typ: LinuxNamespaceType,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Path is a path to an existing namespace persisted on disk that can be joined and is of
    /// the same type.
    path: Option<PathBuf>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Clone, Copy)]
pub enum LinuxNamespaceType {
    #[serde(rename = "pid")]
    /// For isolating process IDs.
    Pid,

    #[serde(rename = "network")]
    /// For isolating network devices, stacks, ports, etc.
    Network,

    #[serde(rename = "mount")]
    /// For isolating mount points.
    Mount,

    #[serde(rename = "ipc")]
    /// For isolating System V IPC, POSIX message queues.
    Ipc,

    #[serde(rename = "uts")]
    /// For isolating hostname and NIS domain name.
    Uts,

    #[serde(rename = "user")]
    /// For isolating user and group IDs.
    User,

    #[serde(rename = "cgroup")]
    /// For isolating cgroup hierarchies.
    Cgroup,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, CopyGetters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// LinuxIDMapping specifies UID/GID mappings.
pub struct LinuxIDMapping {
    #[getset(get_copy = "pub")]
    #[serde(rename = "containerID")]
    /// ContainerID is the starting UID/GID in the container.
    container_id: u32,

    #[getset(get_copy = "pub")]
    #[serde(rename = "hostID")]
    /// HostID is the starting UID/GID on the host to be mapped to `container_id`.
    host_id: u32,

    #[getset(get_copy = "pub")]
    /// Size is the number of IDs to be mapped.
    size: u32,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, CopyGetters, Getters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// POSIXRlimit type and restrictions.
pub struct POSIXRlimit {
    #[getset(get = "pub")]
    #[serde(rename = "type")]
    /// Type of the rlimit to set.
    typ: String,

    #[getset(get_copy = "pub")]
    /// Hard is the hard limit for the specified type.
    hard: u64,

    #[getset(get_copy = "pub")]
    /// Soft is the soft limit for the specified type.
    soft: u64,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxResources has container runtime resource constraints.
pub struct LinuxResources {
    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Memory restriction configuration.
    memory: Option<LinuxMemory>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// CPU resource restriction configuration.
    cpu: Option<LinuxCPU>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Task resource restriction configuration.
    pids: Option<LinuxPids>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxMemory for Linux cgroup 'memory' resource management.
pub struct LinuxMemory {
    #[getset(get = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Memory limit (in bytes).
    limit: Option<i64>,

    #[getset(get = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Total memory limit (memory + swap).
    swap: Option<i64>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Default, Builder, Getters)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
/// LinuxCPU for Linux cgroup 'cpu' resource management.
pub struct LinuxCPU {
    #[getset(get = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// CPU shares (relative weight (ratio) vs. other cgroups with cpu shares).
    shares: Option<u64>,

    #[getset(get = "pub")]
    #[serde(skip_serializing_if = "Option::is_none")]
    /// CPU hardcap limit (in usecs). Allowed cpu time in a given period.
    quota: Option<i64>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// CPUs to use within the cpuset. Default is to use any CPU available.
    cpus: Option<String>,

    #[getset(get = "pub")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// List of memory nodes in the cpuset. Default is to use any available memory node.
    mems: Option<String>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Debug, Builder, CopyGetters)]
#[builder(pattern = "owned", setter(into, strip_option))]
/// LinuxPids for Linux cgroup 'pids' resource management.
pub struct LinuxPids {
    #[getset(get_copy = "pub")]
    /// Maximum number of PIDs. Default is "no limit".
    limit: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_roundtrip() -> Result<()> {
        let spec = SpecBuilder::default()
            .root(
                RootBuilder::default()
                    .path("/var/lib/castletown/rootfs-0")
                    .readonly(false)
                    .build()?,
            )
            .process(
                ProcessBuilder::default()
                    .user(UserBuilder::default().uid(0u32).gid(0u32).build()?)
                    .cwd("/box")
                    .args(vec!["/bin/cat".to_string()])
                    .no_new_privileges(true)
                    .build()?,
            )
            .build()?;

        let json = serde_json::to_string(&spec)?;
        let back: Spec = serde_json::from_str(&json)?;
        assert_eq!(spec, back);
        Ok(())
    }

    #[test]
    fn namespace_type_serializes_uts_correctly() -> Result<()> {
        let ns = LinuxNamespaceBuilder::default()
            .typ(LinuxNamespaceType::Uts)
            .build()?;
        assert_eq!(serde_json::to_string(&ns)?, r#"{"type":"uts"}"#);
        Ok(())
    }

    #[test]
    fn linux_resources_skip_unset_fields() -> Result<()> {
        let resources = LinuxResourcesBuilder::default()
            .memory(LinuxMemoryBuilder::default().limit(256 * 1024 * 1024).build()?)
            .build()?;
        let json = serde_json::to_string(&resources)?;
        assert!(json.contains("\"limit\":268435456"));
        assert!(!json.contains("\"cpu\""));
        Ok(())
    }
}
