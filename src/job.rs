//! Job Pipeline (C6): chains ordered steps, resolves file dependencies between them, and
//! guarantees at-most-one concurrent execution per job.
//!
//! Grounded on `jobs/job.go` and `jobs/pool.go`: a job is a cursor over an append-only
//! step list; `execute_all` drains it from the cursor to the end under a per-job lock, so
//! a caller can submit more steps on the same id later and only the new ones run.

use crate::{
    error::ServiceError,
    lock_map::LockMap,
    manager::Manager,
    sandbox::{
        config::{
            CgroupConfigBuilder, FileEntry, FileSource, Rlimit, RlimitConfigBuilder,
            SandboxConfigBuilder, UserNamespaceConfigBuilder,
        },
        report::Report,
    },
};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex},
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Default CPU time budget for a step that doesn't override it, recovered verbatim from
/// `sandbox/default.go`.
const DEFAULT_TIME_LIMIT_MS: u64 = 1000;
/// Default memory budget, in MiB, for a step that doesn't override it.
const DEFAULT_MEMORY_MB: i64 = 256;
/// Default PID budget for a step that doesn't override it.
const DEFAULT_PROC_LIMIT: i64 = 100;
/// Default fsize rlimit (hard == soft), in bytes.
const DEFAULT_FSIZE_BYTES: u64 = 1024 * 1024;
/// Default open-file-descriptor rlimit (hard == soft).
const DEFAULT_NOFILE: u64 = 64;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(String),

    #[error("image {0} not found")]
    ImageNotFound(String),

    #[error("step {step} requests file {name:?} that is neither inline nor persisted by an earlier step")]
    MissingDependency { step: usize, name: String },

    #[error("stage files for step {step}: {source}")]
    Staging {
        step: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("run step {step}: {source}")]
    Sandbox {
        step: usize,
        #[source]
        source: anyhow::Error,
    },
}

/// One file the caller supplied inline on the job, available to any step by name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineFile {
    pub name: String,
    pub content: String,
}

/// One sandboxed execution within a job. `None` limits fall back to the pipeline's
/// baseline defaults rather than the sandbox engine's own unset-means-unlimited
/// semantics, since a step always runs under *some* resource cap.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Step {
    pub image: String,
    pub cmd: Vec<String>,
    pub stdin: String,
    pub memory_mb: Option<i64>,
    pub time_limit_ms: Option<u64>,
    pub proc_limit: Option<i64>,
    pub files: Vec<String>,
    pub persist: Vec<String>,
}

struct JobData {
    files: Vec<InlineFile>,
    steps: Vec<Step>,
    cursor: usize,
}

/// Owns every live job. Jobs are looked up and mutated under a short-lived map lock;
/// `execute_all` additionally holds a per-job lock (via `LockMap`) for its whole
/// duration so two callers driving the same id never interleave steps.
pub struct JobPool {
    jobs: StdMutex<HashMap<String, Arc<StdMutex<JobData>>>>,
    locks: LockMap<String>,
    images_dir: PathBuf,
    storage_dir: PathBuf,
}

impl JobPool {
    pub fn new(images_dir: PathBuf, storage_dir: PathBuf) -> Self {
        Self {
            jobs: StdMutex::new(HashMap::new()),
            locks: LockMap::default(),
            images_dir,
            storage_dir,
        }
    }

    /// Insert a new job under `id`, or append `files`/`steps` to an existing one. The
    /// cursor of an existing job is left untouched, so only the newly appended steps
    /// run on the next `execute_all`.
    pub fn add_or_append(&self, id: &str, files: Vec<InlineFile>, steps: Vec<Step>) {
        let mut jobs = self.jobs.lock().expect("job pool mutex");
        let entry = jobs.entry(id.to_string()).or_insert_with(|| {
            Arc::new(StdMutex::new(JobData {
                files: Vec::new(),
                steps: Vec::new(),
                cursor: 0,
            }))
        });
        let mut data = entry.lock().expect("job data mutex");
        data.files.extend(files);
        data.steps.extend(steps);
    }

    /// Drop a job from the pool. A no-op if `id` is unknown.
    pub fn remove(&self, id: &str) {
        self.jobs.lock().expect("job pool mutex").remove(id);
    }

    /// Run every step from the job's cursor to the end, advancing the cursor as each
    /// step completes. Serialized per job id: a second call on the same id blocks until
    /// the first returns. On a step failure, earlier reports are returned alongside the
    /// error; the cursor stops short of the failed step.
    ///
    /// `cancel` is checked at each step boundary: a cancellation observed between steps
    /// stops the run there (the already-collected reports are returned, no error), while
    /// one observed mid-step still lets that step finish with `Status::Terminated`.
    pub async fn execute_all(
        &self,
        id: &str,
        manager: &Manager,
        cancel: &CancellationToken,
    ) -> Result<Vec<Report>, JobError> {
        let handle = {
            let jobs = self.jobs.lock().expect("job pool mutex");
            jobs.get(id)
                .cloned()
                .ok_or_else(|| JobError::NotFound(id.to_string()))?
        };
        let _guard = self.locks.lock(id.to_string()).await;

        let mut reports = Vec::new();
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let (idx, step, inline_files, earlier_steps) = {
                let data = handle.lock().expect("job data mutex");
                if data.cursor >= data.steps.len() {
                    break;
                }
                (
                    data.cursor,
                    data.steps[data.cursor].clone(),
                    data.files.clone(),
                    data.steps[..data.cursor].to_vec(),
                )
            };

            let report = self
                .run_step(id, idx, &step, &inline_files, &earlier_steps, manager, cancel)
                .await?;
            reports.push(report);

            handle.lock().expect("job data mutex").cursor += 1;
        }
        Ok(reports)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        job_id: &str,
        idx: usize,
        step: &Step,
        inline_files: &[InlineFile],
        earlier_steps: &[Step],
        manager: &Manager,
        cancel: &CancellationToken,
    ) -> Result<Report, JobError> {
        let image_dir = self.images_dir.join(normalize_image(&step.image));
        if !image_dir.is_dir() {
            return Err(JobError::ImageNotFound(step.image.clone()));
        }

        let box_dir = self.storage_dir.join(job_id).join(format!("proc-{}", idx));
        std::fs::create_dir_all(&box_dir).map_err(|e| JobError::Staging {
            step: idx,
            source: e.into(),
        })?;

        let mut files = Vec::with_capacity(step.files.len());
        for name in &step.files {
            files.push(resolve_dependency(
                idx,
                name,
                earlier_steps,
                inline_files,
                &self.storage_dir,
                job_id,
            )?);
        }

        let cgroup = CgroupConfigBuilder::default()
            .memory((step.memory_mb.unwrap_or(DEFAULT_MEMORY_MB) as u64) * 1024 * 1024)
            .pids_limit(step.proc_limit.unwrap_or(DEFAULT_PROC_LIMIT))
            .build()
            .expect("build baseline cgroup config");

        let rlimit = RlimitConfigBuilder::default()
            .core(Rlimit::new(0, 0))
            .fsize(Rlimit::new(DEFAULT_FSIZE_BYTES, DEFAULT_FSIZE_BYTES))
            .nofile(Rlimit::new(DEFAULT_NOFILE, DEFAULT_NOFILE))
            .build()
            .expect("build baseline rlimit config");

        let sandbox_config = SandboxConfigBuilder::default()
            .rootfs_image_dir(image_dir)
            .box_dir(box_dir)
            .args(step.cmd.clone())
            .stdin(step.stdin.clone())
            .time_limit_ms(step.time_limit_ms.unwrap_or(DEFAULT_TIME_LIMIT_MS))
            .cgroup(cgroup)
            .rlimit(rlimit)
            // Overwritten by `Manager::create_sandbox` from the real allocation.
            .user_namespace(
                UserNamespaceConfigBuilder::default()
                    .host_uid_start(0u32)
                    .host_gid_start(0u32)
                    .size(0u32)
                    .build()
                    .expect("build placeholder user namespace"),
            )
            .files(files)
            .build()
            .expect("build step sandbox config");

        let sandbox_id = format!("{}-{}", job_id, idx);
        manager
            .create_sandbox(sandbox_id.clone(), sandbox_config)
            .map_err(|source| JobError::Sandbox {
                step: idx,
                source: source.into(),
            })?;

        let run_result = manager.run_sandbox(&sandbox_id, cancel).await;
        if let Err(source) = manager.destroy_sandbox(&sandbox_id).await {
            log::warn!("destroy sandbox {} (step {}) failed: {}", sandbox_id, idx, source);
        }

        run_result.map_err(|source| JobError::Sandbox {
            step: idx,
            source: source.into(),
        })
    }
}

/// Resolve one `Step.files` entry to its source: the latest earlier step that persisted
/// `name`, or the job's inline file of that name. Neither is a `MissingDependency`.
fn resolve_dependency(
    idx: usize,
    name: &str,
    earlier_steps: &[Step],
    inline_files: &[InlineFile],
    storage_dir: &Path,
    job_id: &str,
) -> Result<FileEntry, JobError> {
    if let Some((k, _)) = earlier_steps
        .iter()
        .enumerate()
        .rev()
        .find(|(_, s)| s.persist.iter().any(|p| p == name))
    {
        let src = storage_dir
            .join(job_id)
            .join(format!("proc-{}", k))
            .join(name);
        return Ok(FileEntry {
            src: FileSource::Path(src),
            dst: name.into(),
        });
    }

    if let Some(inline) = inline_files.iter().find(|f| f.name == name) {
        return Ok(FileEntry {
            src: FileSource::Content(inline.content.clone()),
            dst: name.into(),
        });
    }

    Err(JobError::MissingDependency {
        step: idx,
        name: name.to_string(),
    })
}

/// `my-image:latest` -> `my-image-latest`, matching the on-disk image directory naming.
fn normalize_image(image: &str) -> String {
    image.replacen(':', "-", 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(persist: &[&str]) -> Step {
        Step {
            image: "cpp:latest".to_string(),
            cmd: vec![],
            stdin: String::new(),
            memory_mb: None,
            time_limit_ms: None,
            proc_limit: None,
            files: vec![],
            persist: persist.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn normalize_image_replaces_first_colon_only() {
        assert_eq!(normalize_image("gcc:9-bullseye"), "gcc-9-bullseye");
        assert_eq!(normalize_image("gcc"), "gcc");
    }

    #[test]
    fn resolves_to_latest_persisting_step() {
        let steps = vec![step(&["main"]), step(&[]), step(&["main"])];
        let inline = vec![InlineFile {
            name: "main".to_string(),
            content: "a".to_string(),
        }];

        let resolved =
            resolve_dependency(3, "main", &steps, &inline, Path::new("/storage"), "job-1").unwrap();
        assert_eq!(
            resolved.src,
            FileSource::Path(PathBuf::from("/storage/job-1/proc-2/main"))
        );
    }

    #[test]
    fn falls_back_to_inline_file_when_nothing_persisted() {
        let steps = vec![step(&[])];
        let inline = vec![InlineFile {
            name: "hello.txt".to_string(),
            content: "Hello, World!".to_string(),
        }];

        let resolved = resolve_dependency(1, "hello.txt", &steps, &inline, Path::new("/storage"), "job-1")
            .unwrap();
        assert_eq!(
            resolved.src,
            FileSource::Content("Hello, World!".to_string())
        );
    }

    #[test]
    fn missing_dependency_when_neither_source_exists() {
        let err = resolve_dependency(0, "ghost", &[], &[], Path::new("/storage"), "job-1").unwrap_err();
        assert!(matches!(err, JobError::MissingDependency { step: 0, name } if name == "ghost"));
    }

    #[test]
    fn add_or_append_preserves_cursor_on_existing_job() {
        let pool = JobPool::new(PathBuf::from("/images"), PathBuf::from("/storage"));
        pool.add_or_append("job-1", vec![], vec![step(&[])]);
        {
            let jobs = pool.jobs.lock().unwrap();
            jobs.get("job-1").unwrap().lock().unwrap().cursor = 1;
        }
        pool.add_or_append("job-1", vec![], vec![step(&[])]);

        let jobs = pool.jobs.lock().unwrap();
        let data = jobs.get("job-1").unwrap().lock().unwrap();
        assert_eq!(data.cursor, 1);
        assert_eq!(data.steps.len(), 2);
    }

    #[test]
    fn remove_drops_the_job() {
        let pool = JobPool::new(PathBuf::from("/images"), PathBuf::from("/storage"));
        pool.add_or_append("job-1", vec![], vec![step(&[])]);
        pool.remove("job-1");
        assert!(pool.jobs.lock().unwrap().get("job-1").is_none());
    }

    #[tokio::test]
    async fn execute_all_unknown_job_is_not_found() {
        let pool = JobPool::new(PathBuf::from("/images"), PathBuf::from("/storage"));
        let dir = tempfile::tempdir().unwrap();
        let config = crate::config::ConfigBuilder::default()
            .overlayfs_dir(dir.path().join("overlayfs"))
            .libcontainer_dir(dir.path().join("libcontainer"))
            .rootfs_dir(dir.path().join("bundles"))
            .max_parallel_sandboxes(1usize)
            .build()
            .unwrap();
        let runtime = crate::oci_runtime::OCIRuntimeBuilder::default()
            .binary(which::which("echo").unwrap())
            .build()
            .unwrap();
        let manager = Manager::new(&config, runtime);

        let err = pool
            .execute_all("missing", &manager, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::NotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn execute_all_missing_image_fails_at_that_step() {
        let dir = tempfile::tempdir().unwrap();
        let pool = JobPool::new(dir.path().join("images"), dir.path().join("storage"));
        let config = crate::config::ConfigBuilder::default()
            .overlayfs_dir(dir.path().join("overlayfs"))
            .libcontainer_dir(dir.path().join("libcontainer"))
            .rootfs_dir(dir.path().join("bundles"))
            .max_parallel_sandboxes(1usize)
            .build()
            .unwrap();
        let runtime = crate::oci_runtime::OCIRuntimeBuilder::default()
            .binary(which::which("echo").unwrap())
            .build()
            .unwrap();
        let manager = Manager::new(&config, runtime);

        pool.add_or_append("job-1", vec![], vec![step(&[])]);
        let err = pool
            .execute_all("job-1", &manager, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::ImageNotFound(image) if image == "cpp:latest"));
    }
}
