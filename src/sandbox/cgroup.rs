//! Reads cgroup v2 accounting for a finished sandbox.
//!
//! Grounded on `sandbox/cgroup.go`'s `loadCgroup`/`Stat` call, adapted to read the
//! `cpu.stat` and `memory.peak` control files directly instead of going through a cgroup
//! management library — cgroup v2 exposes `memory.peak` (not the cgroup v1
//! `memory.max_usage_in_bytes` the original spec prose names) as the peak usage figure.

use super::report::CgroupStats;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// The systemd user slice every sandbox's cgroup scope lives under.
pub fn slice_path() -> &'static str {
    "castletown.slice"
}

/// Path to a sandbox's cgroup v2 scope, relative to the cgroup v2 mountpoint.
pub fn scope_path(cgroup_root: &Path, sandbox_id: &str) -> PathBuf {
    cgroup_root
        .join(slice_path())
        .join(format!("castletown-{}.scope", sandbox_id))
}

/// Read `cpu.stat` and `memory.peak` from a sandbox's cgroup scope.
pub fn read_stats(scope: &Path) -> Result<CgroupStats> {
    let cpu_time_usec = read_cpu_usage_usec(&scope.join("cpu.stat"))
        .with_context(|| format!("read cpu.stat in {}", scope.display()))?;
    let memory_peak_bytes = read_u64_file(&scope.join("memory.peak"))
        .with_context(|| format!("read memory.peak in {}", scope.display()))?;

    Ok(CgroupStats {
        cpu_time_usec,
        memory_peak_bytes,
    })
}

fn read_cpu_usage_usec(path: &Path) -> Result<u64> {
    let contents = std::fs::read_to_string(path)?;
    for line in contents.lines() {
        if let Some(value) = line.strip_prefix("usage_usec ") {
            return value
                .trim()
                .parse()
                .with_context(|| format!("parse usage_usec from {:?}", line));
        }
    }
    anyhow::bail!("usage_usec field missing from {}", path.display())
}

fn read_u64_file(path: &Path) -> Result<u64> {
    let contents = std::fs::read_to_string(path)?;
    contents
        .trim()
        .parse()
        .with_context(|| format!("parse u64 from {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn read_stats_parses_both_files() -> Result<()> {
        let dir = tempdir()?;
        fs::write(
            dir.path().join("cpu.stat"),
            "usage_usec 123456\nuser_usec 100000\nsystem_usec 23456\n",
        )?;
        fs::write(dir.path().join("memory.peak"), "67108864\n")?;

        let stats = read_stats(dir.path())?;
        assert_eq!(stats.cpu_time_usec(), 123456);
        assert_eq!(stats.memory_peak_bytes(), 67108864);
        Ok(())
    }

    #[test]
    fn scope_path_matches_expected_shape() {
        let path = scope_path(Path::new("/sys/fs/cgroup"), "abc123");
        assert_eq!(
            path,
            PathBuf::from("/sys/fs/cgroup/castletown.slice/castletown-abc123.scope")
        );
    }

    #[test]
    fn read_stats_missing_file_errors() {
        let dir = tempdir().unwrap();
        assert!(read_stats(dir.path()).is_err());
    }
}
