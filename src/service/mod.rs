//! Service Façade (C9): the single entry point the HTTP and gRPC transports both drive.
//!
//! Grounded on the teacher's `kubernetes/server`'s pattern of one capability set behind
//! a thin wire layer: the transports only translate their own request/response types and
//! dispatch into this `Service`, which owns the `Manager` and the `JobPool` directly (no
//! package-level globals).

pub mod grpc;
pub mod http;

use crate::{
    config::Config,
    error::ServiceError,
    job::{InlineFile, JobPool, Step},
    manager::Manager,
    oci_runtime::OCIRuntime,
    sandbox::report::Report,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Owns every stateful collaborator the facades need: the sandbox manager and the job
/// pool. Cheap to share behind an `Arc` since both of its fields already guard their own
/// interior mutability.
///
/// `shutdown` is the root of every in-flight execution's `CancellationToken`: cancelling
/// it (see `shutdown_token`) propagates down into the Manager/Sandbox layer, where a
/// cancelled run is `SIGKILL`ed and reported `Status::Terminated` rather than silently
/// dropped.
pub struct Service {
    manager: Manager,
    jobs: JobPool,
    shutdown: CancellationToken,
}

impl Service {
    pub fn new(config: &Config, runtime: OCIRuntime) -> Self {
        Self {
            manager: Manager::new(config, runtime),
            jobs: JobPool::new(config.images_dir().clone(), config.storage_dir().clone()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Generate a job id for a caller that didn't supply one.
    pub fn new_job_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// The root cancellation token for every execution this `Service` drives. Cancelling
    /// it (e.g. on process shutdown) terminates every sandbox currently running.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Append `steps` (and any new inline `files`) to job `id`, creating it if absent,
    /// and run every step from its cursor onward.
    pub async fn execute_job(
        &self,
        id: &str,
        files: Vec<InlineFile>,
        steps: Vec<Step>,
    ) -> Result<Vec<Report>, ServiceError> {
        self.jobs.add_or_append(id, files, steps);
        let cancel = self.shutdown.child_token();
        Ok(self.jobs.execute_all(id, &self.manager, &cancel).await?)
    }

    /// Release a job's retained state. A no-op if `id` is unknown.
    pub fn done_job(&self, id: &str) {
        self.jobs.remove(id);
    }
}
