//! Report Classifier (C8): a pure function from final process/cgroup state to a `Status`.
//!
//! Grounded on `sandbox/report.go`, with the memory check retained as a belt-and-braces
//! safeguard per the design notes (cgroup v2 should already OOM-kill before this check is
//! reached, so absent that, exceeding the limit still surfaces through a non-zero exit
//! code and RUNTIME_ERROR).

use getset::{CopyGetters, Getters};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

#[derive(
    AsRefStr, Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    /// Zero value on the wire (gRPC); never produced by the classifier.
    Unspecified,
    Ok,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    /// Reserved: no component currently enforces an output byte cap.
    OutputLimitExceeded,
    /// A run cancelled mid-flight by the caller.
    Terminated,
    /// A pipeline step that was never executed because an earlier step failed fatally.
    Skipped,
    /// A Report produced when post-run cgroup stats could not be read.
    Unknown,
}

/// cpu.stat / memory accounting read from the sandbox's cgroup v2 scope after it exits.
#[derive(Clone, Copy, Debug, Default, CopyGetters)]
pub struct CgroupStats {
    #[getset(get_copy = "pub")]
    pub cpu_time_usec: u64,
    #[getset(get_copy = "pub")]
    pub memory_peak_bytes: u64,
}

/// Outcome of one sandboxed execution.
#[derive(Clone, Debug, Getters, CopyGetters, Serialize, Deserialize)]
pub struct Report {
    #[getset(get_copy = "pub")]
    #[serde(rename = "Status")]
    pub status: Status,
    #[getset(get_copy = "pub")]
    #[serde(rename = "ExitCode")]
    pub exit_code: i32,
    #[getset(get_copy = "pub")]
    #[serde(rename = "Signal")]
    pub signal: i32,
    #[getset(get = "pub")]
    #[serde(rename = "Stdout")]
    pub stdout: String,
    #[getset(get = "pub")]
    #[serde(rename = "Stderr")]
    pub stderr: String,
    #[getset(get_copy = "pub")]
    #[serde(rename = "CPUTime")]
    pub cpu_time_usec: i64,
    #[getset(get_copy = "pub")]
    #[serde(rename = "Memory")]
    pub memory_bytes: i64,
    #[getset(get_copy = "pub")]
    #[serde(rename = "WallTime")]
    pub wall_time_ms: i64,
    #[getset(get_copy = "pub")]
    #[serde(rename = "StartAt")]
    pub start_at: i64,
    #[getset(get_copy = "pub")]
    #[serde(rename = "FinishAt")]
    pub finish_at: i64,
}

/// Classify a finished run into a `Status`, in priority order:
/// 1. wall-clock timeout OR cgroup CPU time over the limit -> `TimeLimitExceeded`
/// 2. cgroup memory peak over the limit -> `MemoryLimitExceeded`
/// 3. non-zero exit (including signal death) -> `RuntimeError`
/// 4. otherwise -> `Ok`
pub fn classify(
    timed_out: bool,
    stats: CgroupStats,
    time_limit_ms: u64,
    memory_limit_bytes: Option<u64>,
    exit_code: i32,
    signal: i32,
) -> Status {
    if timed_out || stats.cpu_time_usec() > time_limit_ms * 1000 {
        return Status::TimeLimitExceeded;
    }
    if let Some(limit) = memory_limit_bytes {
        if stats.memory_peak_bytes() > limit {
            return Status::MemoryLimitExceeded;
        }
    }
    if exit_code != 0 || signal != 0 {
        return Status::RuntimeError;
    }
    Status::Ok
}
