//! Interface to an OCI compliant CLI runtime (e.g. `runc`) for creating and running
//! containers.
//!
//! Trimmed from the full subcommand surface down to the lifecycle Castletown actually
//! drives: `create`/`run`/`kill`/`delete`/`state`. The `ExecCommand` seam (async, cloneable
//! trait object) is kept verbatim from the original interface so tests can swap in a mock
//! process runner instead of shelling out to a real `runc` binary.

#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use derive_builder::Builder;
use dyn_clone::{clone_trait_object, DynClone};
use getset::{Getters, Setters};
use std::{
    fmt::{self, Debug},
    path::{Path, PathBuf},
    process::Stdio,
};
use strum::{AsRefStr, Display};
use tokio::process::{Child, Command};

#[derive(Builder, Debug, Getters, Setters)]
#[builder(pattern = "owned", setter(into))]
/// OCIRuntime is the main structure to be used when interacting with the container runtime.
pub struct OCIRuntime {
    #[getset(get, set)]
    #[builder(private, default = "Box::new(DefaultOCIRuntimeExecCommand)")]
    /// The executor for the OCIRuntime.
    exec: Box<dyn ExecCommand>,

    #[get]
    /// Path to the runtime binary (e.g. `runc`).
    binary: PathBuf,
}

impl OCIRuntime {
    /// Run a subcommand that does not need to inherit/capture stdio, waiting for it to
    /// finish and returning its output.
    pub async fn run_output(
        &self,
        subcommand: &Subcommand,
        args: &[GlobalArgs],
    ) -> Result<std::process::Output> {
        self.exec()
            .run_output(self.binary(), &subcommand.build_cmd()[..], args)
            .await
    }

    /// Spawn a subcommand with piped stdin/stdout/stderr, returning the live child so the
    /// caller can write stdin, race its exit against a timeout, and send it signals.
    pub async fn spawn(&self, subcommand: &Subcommand, args: &[GlobalArgs]) -> Result<Child> {
        self.exec()
            .spawn(self.binary(), &subcommand.build_cmd()[..], args)
            .await
    }
}

#[derive(Clone, Default, Debug)]
/// DefaultOCIRuntimeExecCommand shells out to the real runtime binary.
struct DefaultOCIRuntimeExecCommand;

impl ExecCommand for DefaultOCIRuntimeExecCommand {}

#[async_trait]
trait ExecCommand: Debug + DynClone + Send + Sync {
    /// Run a command to completion and return its `Output`.
    async fn run_output(
        &self,
        binary: &Path,
        cmd: &[String],
        global_args: &[GlobalArgs],
    ) -> Result<std::process::Output> {
        Command::new(binary)
            .args(cmd)
            .args(global_args.iter().map(ToString::to_string))
            .output()
            .await
            .context("run OCI runtime")
    }

    /// Spawn a command with piped stdio and return the live child process.
    async fn spawn(
        &self,
        binary: &Path,
        cmd: &[String],
        global_args: &[GlobalArgs],
    ) -> Result<Child> {
        Command::new(binary)
            .args(cmd)
            .args(global_args.iter().map(ToString::to_string))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("spawn OCI runtime")
    }
}

clone_trait_object!(ExecCommand);

type ContainerId = String;

#[derive(AsRefStr, Clone, Debug, Hash, Eq, PartialEq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Subcommand {
    /// Create a container without starting its process.
    Create((ContainerId, Vec<CreateArgs>)),
    /// Create and run a container in the foreground, inheriting the caller's stdio.
    Run((ContainerId, Vec<RunArgs>)),
    /// Send the specified signal (default: SIGTERM) to the container's init process.
    Kill((ContainerId, Vec<KillArgs>)),
    /// Delete any resources held by the container.
    Delete(ContainerId),
    /// Output the state of a container.
    State(ContainerId),
}

impl Subcommand {
    fn build_cmd(&self) -> Vec<String> {
        use Subcommand::*;
        match self {
            Create((container_id, args)) => self.build_cmd_vec(
                args.iter().map(ToString::to_string).collect(),
                Some(container_id.clone()),
            ),
            Run((container_id, args)) => self.build_cmd_vec(
                args.iter().map(ToString::to_string).collect(),
                Some(container_id.clone()),
            ),
            Kill((container_id, args)) => self.build_cmd_vec(
                args.iter().map(ToString::to_string).collect(),
                Some(container_id.clone()),
            ),
            Delete(container_id) => self.build_cmd_vec(Vec::new(), Some(container_id.clone())),
            State(container_id) => self.build_cmd_vec(Vec::new(), Some(container_id.clone())),
        }
    }

    /// Build a vec of `[command][args][container_id]`.
    fn build_cmd_vec(&self, args: Vec<String>, container_id: Option<String>) -> Vec<String> {
        let mut res = vec![self.to_string()]
            .into_iter()
            .chain(args.into_iter())
            .collect::<Vec<_>>();
        if let Some(id) = container_id {
            res.push(id)
        }
        res
    }
}

fn write_kv<K, V>(f: &mut fmt::Formatter<'_>, key: K, value: V) -> fmt::Result
where
    K: AsRef<str>,
    V: fmt::Display,
{
    write!(f, "{}={}", key.as_ref(), value)
}

#[derive(AsRefStr, Clone, Debug, Hash, Eq, PartialEq)]
#[strum(serialize_all = "kebab_case")]
/// Available arguments for 'runc create'.
pub enum CreateArgs {
    /// Path to the root of the bundle directory.
    Bundle(PathBuf),
    /// Specify the file to write the process id to.
    PidFile(PathBuf),
    /// Do not create a new session keyring for the container.
    NoNewKeyring,
}

impl fmt::Display for CreateArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use CreateArgs::*;
        write!(f, "--")?;
        match self {
            Bundle(path) => write_kv(f, self, path.display()),
            PidFile(path) => write_kv(f, self, path.display()),
            _ => write!(f, "{}", self.as_ref()),
        }
    }
}

#[derive(AsRefStr, Clone, Debug, Hash, Eq, PartialEq)]
#[strum(serialize_all = "kebab_case")]
/// Available arguments for 'runc run'.
pub enum RunArgs {
    /// Path to the root of the bundle directory, defaults to the current directory.
    Bundle(PathBuf),
    /// Specify the file to write the process id to.
    PidFile(PathBuf),
}

impl fmt::Display for RunArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use RunArgs::*;
        write!(f, "--")?;
        match self {
            Bundle(path) => write_kv(f, self, path.display()),
            PidFile(path) => write_kv(f, self, path.display()),
        }
    }
}

#[derive(AsRefStr, Clone, Debug, Hash, Eq, PartialEq)]
#[strum(serialize_all = "kebab_case")]
/// Available arguments for 'runc kill'.
pub enum KillArgs {
    All,
}

impl fmt::Display for KillArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "--{}", self.as_ref())
    }
}

#[derive(AsRefStr, Clone, Debug, Hash, Eq, PartialEq)]
#[strum(serialize_all = "kebab_case")]
/// Global arguments accepted by every runtime subcommand.
pub enum GlobalArgs {
    /// Enable debug output for logging.
    Debug,
    /// Root directory for storage of container state (should be tmpfs).
    Root(PathBuf),
    /// Enable systemd cgroup support, expects cgroupsPath of form "slice:prefix:name".
    SystemdCgroup,
}

impl fmt::Display for GlobalArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use GlobalArgs::*;
        write!(f, "--")?;
        match self {
            Root(path) => write_kv(f, self, path.display()),
            _ => write!(f, "{}", self.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug)]
    struct MockExecCommand(std::process::Output);

    #[async_trait]
    impl ExecCommand for MockExecCommand {
        async fn run_output(
            &self,
            _binary: &Path,
            _cmd: &[String],
            _global_args: &[GlobalArgs],
        ) -> Result<std::process::Output> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn ociruntime_success_create() -> Result<()> {
        let runtime = OCIRuntimeBuilder::default()
            .binary(which::which("echo")?)
            .build()?;
        let sc = Subcommand::Create((String::from("id"), vec![CreateArgs::NoNewKeyring]));
        let output = runtime.run_output(&sc, &[GlobalArgs::Debug]).await?;
        assert!(output.status.success());
        assert_eq!(
            String::from_utf8(output.stdout)?,
            "create --no-new-keyring id --debug\n"
        );
        Ok(())
    }

    #[tokio::test]
    async fn ociruntime_success_run() -> Result<()> {
        let runtime = OCIRuntimeBuilder::default()
            .binary(which::which("echo")?)
            .build()?;
        let sc = Subcommand::Run((
            String::from("id"),
            vec![RunArgs::Bundle(PathBuf::from("/bundle"))],
        ));
        let output = runtime.run_output(&sc, &[]).await?;
        assert_eq!(
            String::from_utf8(output.stdout)?,
            "run --bundle=/bundle id\n"
        );
        Ok(())
    }

    #[tokio::test]
    async fn ociruntime_spawn_pipes_stdio() -> Result<()> {
        let runtime = OCIRuntimeBuilder::default()
            .binary(which::which("echo")?)
            .build()?;
        let sc = Subcommand::State(String::from("id"));
        let mut child = runtime.spawn(&sc, &[]).await?;

        use tokio::io::AsyncReadExt;
        let mut out = String::new();
        child
            .stdout
            .take()
            .unwrap()
            .read_to_string(&mut out)
            .await?;
        let status = child.wait().await?;
        assert!(status.success());
        assert_eq!(out, "state id\n");
        Ok(())
    }

    #[test]
    fn oci_runtime_success_arg_to_string() {
        assert_eq!(&GlobalArgs::Debug.to_string(), "--debug");
        assert_eq!(&KillArgs::All.to_string(), "--all");
        assert_eq!(
            &CreateArgs::Bundle("test".into()).to_string(),
            "--bundle=test"
        );
    }

    #[test]
    fn ociruntime_failure_no_binary() {
        assert!(OCIRuntimeBuilder::default().build().is_err())
    }
}
