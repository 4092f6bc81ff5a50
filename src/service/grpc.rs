//! gRPC facade for the Service, generated from `proto/castletown.proto` via `build.rs`.
//!
//! Implemented for `Arc<Service>` rather than `Service` directly: tonic's generated
//! server wrapper takes its inner type by value and wraps it in its own `Arc`, so handing
//! it `Arc<Service>` lets both `ExecServiceServer` and `DoneServiceServer` share one
//! `Service` without requiring `Service: Clone`.

use crate::{
    castapi::{
        done_service_server::DoneService, exec_service_server::ExecService,
        DoneRequest, DoneResponse, ExecRequest, ExecResponse, InlineFile as GrpcInlineFile,
        Process as GrpcProcess, Report as GrpcReport, Status as GrpcStatus,
    },
    error::{self, ServiceError},
    job::{InlineFile, Step},
    sandbox::report::{Report, Status},
};
use async_trait::async_trait;
use std::sync::Arc;
use tonic::{Code, Request, Response, Status as TonicStatus};

use super::Service;

impl From<GrpcInlineFile> for InlineFile {
    fn from(f: GrpcInlineFile) -> Self {
        InlineFile {
            name: f.name,
            content: f.content,
        }
    }
}

impl From<GrpcProcess> for Step {
    fn from(p: GrpcProcess) -> Self {
        Step {
            image: p.image,
            cmd: p.cmd,
            stdin: p.stdin,
            memory_mb: (p.memory_limit_mb != 0).then_some(p.memory_limit_mb),
            time_limit_ms: (p.time_limit_ms != 0).then_some(p.time_limit_ms),
            proc_limit: (p.proc_limit != 0).then_some(p.proc_limit),
            files: p.files,
            persist: p.persist,
        }
    }
}

impl From<Status> for GrpcStatus {
    fn from(s: Status) -> Self {
        match s {
            Status::Unspecified => GrpcStatus::Unspecified,
            Status::Ok => GrpcStatus::Ok,
            Status::RuntimeError => GrpcStatus::RuntimeError,
            Status::TimeLimitExceeded => GrpcStatus::TimeLimitExceeded,
            Status::MemoryLimitExceeded => GrpcStatus::MemoryLimitExceeded,
            Status::OutputLimitExceeded => GrpcStatus::OutputLimitExceeded,
            Status::Terminated => GrpcStatus::Terminated,
            Status::Skipped => GrpcStatus::Skipped,
            Status::Unknown => GrpcStatus::Unknown,
        }
    }
}

impl From<Report> for GrpcReport {
    fn from(r: Report) -> Self {
        GrpcReport {
            status: GrpcStatus::from(r.status()) as i32,
            exit_code: r.exit_code(),
            signal: r.signal(),
            stdout: r.stdout().clone(),
            stderr: r.stderr().clone(),
            cpu_time_usec: r.cpu_time_usec(),
            memory_bytes: r.memory_bytes(),
            wall_time_ms: r.wall_time_ms(),
            start_at: r.start_at(),
            finish_at: r.finish_at(),
        }
    }
}

/// Map a `ServiceError` onto the tonic status code matching its HTTP status, with the
/// full error chain as the message.
fn to_tonic_status(e: ServiceError) -> TonicStatus {
    let code = match e.http_status() {
        503 => Code::Unavailable,
        409 => Code::AlreadyExists,
        404 => Code::NotFound,
        422 => Code::InvalidArgument,
        _ => Code::Internal,
    };
    TonicStatus::new(code, error::chain(e.into()))
}

#[async_trait]
impl ExecService for Arc<Service> {
    async fn execute(
        &self,
        request: Request<ExecRequest>,
    ) -> Result<Response<ExecResponse>, TonicStatus> {
        let req = request.into_inner();
        let id = if req.id.is_empty() {
            Service::new_job_id()
        } else {
            req.id
        };
        let files = req.files.into_iter().map(Into::into).collect();
        let steps = req.steps.into_iter().map(Into::into).collect();

        let reports = self
            .execute_job(&id, files, steps)
            .await
            .map_err(to_tonic_status)?;

        Ok(Response::new(ExecResponse {
            id,
            reports: reports.into_iter().map(Into::into).collect(),
        }))
    }
}

#[async_trait]
impl DoneService for Arc<Service> {
    async fn done(
        &self,
        request: Request<DoneRequest>,
    ) -> Result<Response<DoneResponse>, TonicStatus> {
        self.done_job(&request.into_inner().id);
        Ok(Response::new(DoneResponse {}))
    }
}
