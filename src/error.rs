//! Error handling helpers and the top-level error taxonomy.

use crate::{allocator::AllocatorError, job::JobError, manager::ManagerError, sandbox::SandboxError};
use anyhow::Error;
use thiserror::Error;

/// Chain creates a string from an error stack.
pub fn chain(res: Error) -> String {
    res.chain()
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(": ")
}

/// ServiceError is the single error type exposed at the HTTP/gRPC boundary. Every module
/// error taxonomy converts into it so the facade has one place to map errors onto status
/// codes.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    /// Returns the HTTP status code this error should be reported as.
    pub fn http_status(&self) -> u16 {
        use ServiceError::*;
        match self {
            Allocator(AllocatorError::NoCapacity) => 503,
            Manager(ManagerError::JobConflict(_)) => 409,
            Manager(ManagerError::NotFound(_)) => 404,
            Job(JobError::MissingDependency { .. }) => 422,
            Job(JobError::ImageNotFound(_)) => 422,
            Sandbox(_) => 500,
            Job(_) | Manager(_) | Allocator(_) | Internal(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;

    #[test]
    fn chain() {
        let first = anyhow!("error 1");
        let second = anyhow!("error 2");

        let res = super::chain(first.context(second));

        assert_eq!(res, "error 2: error 1");
    }
}
