use crate::errors::{JobError, Result};
use crate::job::Job;
use crate::registry::Registry;
use crate::types::{JobId, UserId};
use std::fmt;
use std::sync::Arc;

/// Things a caller can do to a job that already exists.
///
/// Starting a job needs no check: the caller simply becomes its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingJobAction {
    StopJob,
    QueryStatus,
    StreamOutput,
    RemoveJob,
}

impl fmt::Display for ExistingJobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExistingJobAction::StopJob => "stop",
            ExistingJobAction::QueryStatus => "status",
            ExistingJobAction::StreamOutput => "logs",
            ExistingJobAction::RemoveJob => "remove",
        };
        f.write_str(s)
    }
}

/// Look up `job_id` and check that `user_id` owns it.
///
/// An unknown job and someone else's job are reported as different errors;
/// whether to blur the two is left to the transport.
pub fn authorize(
    registry: &Registry,
    user_id: &UserId,
    job_id: &JobId,
    action: ExistingJobAction,
) -> Result<Arc<Job>> {
    let job = registry.get_job(job_id)?;
    check_owner(&job, user_id, action)?;
    Ok(job)
}

pub fn check_owner(job: &Job, user_id: &UserId, action: ExistingJobAction) -> Result<()> {
    if job.owner() == user_id {
        return Ok(());
    }
    tracing::warn!(
        job_id = %job.id(),
        user = %user_id,
        %action,
        "permission denied"
    );
    Err(JobError::PermissionDenied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::ResourceLimits;
    use crate::registry::OutputSettings;
    use std::time::Duration;

    fn registry_with_job(owner: &str) -> (Registry, JobId) {
        let registry = Registry::new(
            Duration::from_secs(60),
            OutputSettings {
                capacity: 16,
                queue_depth: 1,
                max_chunk: 16,
            },
        );
        let job = registry
            .create_job("true".into(), vec![], owner.into(), ResourceLimits::default())
            .expect("create job");
        (registry, job.id())
    }

    #[test]
    fn owner_is_authorized_for_every_action() {
        let (registry, job_id) = registry_with_job("alice");
        let alice = "alice".to_string();
        for action in [
            ExistingJobAction::StopJob,
            ExistingJobAction::QueryStatus,
            ExistingJobAction::StreamOutput,
            ExistingJobAction::RemoveJob,
        ] {
            let job = authorize(&registry, &alice, &job_id, action).expect("owner allowed");
            assert_eq!(job.id(), job_id);
        }
    }

    #[test]
    fn non_owner_is_denied() {
        let (registry, job_id) = registry_with_job("alice");
        let result = authorize(&registry, &"bob".to_string(), &job_id, ExistingJobAction::StopJob);
        assert!(matches!(result, Err(JobError::PermissionDenied)));
    }

    #[test]
    fn unknown_job_is_not_found_not_denied() {
        let (registry, _) = registry_with_job("alice");
        let result = authorize(
            &registry,
            &"alice".to_string(),
            &uuid::Uuid::new_v4(),
            ExistingJobAction::QueryStatus,
        );
        assert!(matches!(result, Err(JobError::NotFound)));
    }
}
