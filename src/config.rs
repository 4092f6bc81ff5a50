//! Configuration related structures.

use clap::Parser;
use derive_builder::Builder;
use getset::{CopyGetters, Getters};
use lazy_static::lazy_static;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum::{AsRefStr, EnumString};

lazy_static! {
    static ref DEFAULT_IMAGES_DIR: String = "/tmp/castletown/images".to_string();
    static ref DEFAULT_OVERLAYFS_DIR: String = "/tmp/castletown/overlayfs".to_string();
    static ref DEFAULT_STORAGE_DIR: String = "/tmp/castletown/storage".to_string();
    static ref DEFAULT_LIBCONTAINER_DIR: String = "/tmp/castletown/libcontainer".to_string();
    static ref DEFAULT_ROOTFS_DIR: String = "/tmp/castletown/rootfs".to_string();
    static ref DEFAULT_MAX_PARALLEL_SANDBOXES: String = num_cpus().to_string();
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Builder, Parser, CopyGetters, Getters, Deserialize, Serialize)]
#[builder(default, pattern = "owned", setter(into, strip_option))]
#[serde(rename_all = "kebab-case")]
#[clap(
    about("Castletown - multi-tenant execution service for untrusted code"),
    after_help("More info at: https://github.com/cri-o/containrs"),
    version
)]
/// Config is the main configuration structure for the server.
pub struct Config {
    #[get_copy = "pub"]
    #[clap(
        default_value("info"),
        env("CASTLETOWN_LOG_LEVEL"),
        long("log-level"),
        possible_values(&["trace", "debug", "info", "warn", "error", "off"]),
        short('l'),
        value_name("LEVEL")
    )]
    /// The logging level of the application.
    log_level: LevelFilter,

    #[get_copy = "pub"]
    #[clap(
        default_value("lib"),
        env("CASTLETOWN_LOG_SCOPE"),
        long("log-scope"),
        possible_values(&[LogScope::Lib.as_ref(), LogScope::Global.as_ref()]),
        value_name("SCOPE")
    )]
    /// The logging scope of the application. If set to `global`, then all dependent crates
    /// log on the provided level too. Otherwise the logs are scoped to this application only.
    log_scope: LogScope,

    #[get = "pub"]
    #[clap(default_value("production"), env("ENV"), long("env"), value_name("ENV"))]
    /// The deployment environment name.
    env: String,

    #[get = "pub"]
    #[clap(
        default_value(&DEFAULT_IMAGES_DIR),
        env("IMAGES_DIR"),
        long("images-dir"),
        value_name("PATH")
    )]
    /// Root directory holding unpacked rootfs images, one subdirectory per image.
    images_dir: PathBuf,

    #[get = "pub"]
    #[clap(
        default_value(&DEFAULT_OVERLAYFS_DIR),
        env("OVERLAYFS_DIR"),
        long("overlayfs-dir"),
        value_name("PATH")
    )]
    /// Root directory under which per-sandbox overlayfs upper/work dirs are created.
    overlayfs_dir: PathBuf,

    #[get = "pub"]
    #[clap(
        default_value(&DEFAULT_STORAGE_DIR),
        env("STORAGE_DIR"),
        long("storage-dir"),
        value_name("PATH")
    )]
    /// Root directory holding per-job, per-step box directories.
    storage_dir: PathBuf,

    #[get = "pub"]
    #[clap(
        default_value(&DEFAULT_LIBCONTAINER_DIR),
        env("LIBCONTAINER_DIR"),
        long("libcontainer-dir"),
        value_name("PATH")
    )]
    /// Root directory used by the container runtime for its own bookkeeping.
    libcontainer_dir: PathBuf,

    #[get = "pub"]
    #[clap(
        default_value(&DEFAULT_ROOTFS_DIR),
        env("ROOTFS_DIR"),
        long("rootfs-dir"),
        value_name("PATH")
    )]
    /// Root directory used for process-wide rootfs staging.
    rootfs_dir: PathBuf,

    #[get_copy = "pub"]
    #[clap(
        default_value("8000"),
        env("SERVER_PORT"),
        long("server-port"),
        value_name("PORT")
    )]
    /// TCP port the HTTP and gRPC facades listen on.
    server_port: u16,

    #[get_copy = "pub"]
    #[clap(
        default_value(&DEFAULT_MAX_PARALLEL_SANDBOXES),
        env("MAX_PARALLEL_SANDBOXES"),
        long("max-parallel-sandboxes"),
        value_name("N")
    )]
    /// Upper bound on sandboxes allowed to run concurrently.
    max_parallel_sandboxes: usize,

    #[get = "pub"]
    #[clap(env("RABBITMQ_URL"), long("rabbitmq-url"), value_name("URL"))]
    /// Connection string for the submission queue. Carried for surface compatibility; never
    /// dialed by this crate.
    rabbitmq_url: Option<String>,

    #[get = "pub"]
    #[clap(env("RABBITMQ_QUEUE"), long("rabbitmq-queue"), value_name("NAME"))]
    /// Queue name for the submission queue. Carried for surface compatibility; never dialed
    /// by this crate.
    rabbitmq_queue: Option<String>,

    #[get = "pub"]
    #[clap(env("DATABASE_DSN"), long("database-dsn"), value_name("DSN"))]
    /// Connection string for the problem repository. Carried for surface compatibility;
    /// never dialed by this crate.
    database_dsn: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self::parse()
    }
}

#[derive(AsRefStr, Clone, Copy, Debug, Deserialize, EnumString, PartialEq, Serialize)]
#[strum(serialize_all = "snake_case")]
/// Defines the scope of the log level.
pub enum LogScope {
    /// Logging will only happen on a library level.
    Lib,

    /// All dependent libraries will log too.
    Global,
}

impl Default for LogScope {
    fn default() -> Self {
        LogScope::Lib
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = Config::default();
        assert_eq!(c.log_level(), LevelFilter::Info);
        assert_eq!(c.server_port(), 8000);
        assert!(c.max_parallel_sandboxes() >= 1);
        assert!(c.rabbitmq_url().is_none());
    }

    #[test]
    fn build_config() -> anyhow::Result<()> {
        let c = ConfigBuilder::default()
            .log_level(LevelFilter::Warn)
            .log_scope(LogScope::Global)
            .server_port(9000u16)
            .max_parallel_sandboxes(4usize)
            .images_dir("/some/images")
            .build()?;

        assert_eq!(c.log_level(), LevelFilter::Warn);
        assert_eq!(c.log_scope(), LogScope::Global);
        assert_eq!(c.server_port(), 9000);
        assert_eq!(c.max_parallel_sandboxes(), 4);
        assert_eq!(&c.images_dir().display().to_string(), "/some/images");

        Ok(())
    }
}
