use crate::types::JobId;
use std::{io, result};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("no such job")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The OS refused to create the process. The job is kept in the registry
    /// in the `Failed` state so its status can still be queried.
    #[error("failed to spawn process for job {job_id}: {source}")]
    ProcessSpawnFailed {
        job_id: JobId,
        #[source]
        source: io::Error,
    },
    /// The resource boundary for a job could not be built.
    #[error("failed to isolate job {job_id}: {reason}")]
    Isolation { job_id: JobId, reason: String },
    #[error("cgroup error: {0}")]
    Cgroup(String),
}

impl JobError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

pub type Result<T> = result::Result<T, JobError>;
