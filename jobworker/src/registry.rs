use crate::errors::{JobError, Result};
use crate::job::Job;
use crate::limits::ResourceLimits;
use crate::output::OutputMux;
use crate::types::{Args, JobId, Program, UserId};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};
use std::time::{Duration, Instant};

/// Sizing for the output multiplexer each new job gets.
#[derive(Debug, Clone, Copy)]
pub struct OutputSettings {
    pub capacity: usize,
    pub queue_depth: usize,
    pub max_chunk: usize,
}

/// The set of known jobs, keyed by id.
///
/// The registry lock only guards the map itself and is never held while a
/// job is being worked on. Terminated jobs stay for `grace` and are evicted
/// by [`evict_expired`](Self::evict_expired), which also runs on every
/// [`create_job`](Self::create_job). Owners may remove them earlier.
pub struct Registry {
    jobs: RwLock<HashMap<JobId, Arc<Job>>>,
    grace: Duration,
    output: OutputSettings,
}

impl Registry {
    pub fn new(grace: Duration, output: OutputSettings) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            grace,
            output,
        }
    }

    /// Register a new `Pending` job owned by `owner`.
    pub fn create_job(
        &self,
        cmd: Program,
        args: Args,
        owner: UserId,
        limits: ResourceLimits,
    ) -> Result<Arc<Job>> {
        if cmd.trim().is_empty() {
            return Err(JobError::invalid("command must not be empty"));
        }
        limits.validate()?;
        self.evict_expired();

        let output = OutputMux::new(
            self.output.capacity,
            self.output.queue_depth,
            self.output.max_chunk,
        );
        let mut jobs = self.write();
        let mut job_id = uuid::Uuid::new_v4();
        while jobs.contains_key(&job_id) {
            job_id = uuid::Uuid::new_v4();
        }
        let job = Arc::new(Job::new(job_id, owner, cmd, args, limits, output));
        jobs.insert(job_id, job.clone());
        Ok(job)
    }

    pub fn get_job(&self, job_id: &JobId) -> Result<Arc<Job>> {
        self.read().get(job_id).cloned().ok_or(JobError::NotFound)
    }

    /// Jobs owned by `owner`, oldest first.
    ///
    /// The iterator walks a snapshot, so the registry is not locked while it
    /// is consumed.
    pub fn list_jobs(&self, owner: &UserId) -> impl Iterator<Item = Arc<Job>> {
        let mut owned: Vec<Arc<Job>> = self
            .read()
            .values()
            .filter(|job| job.owner() == owner)
            .cloned()
            .collect();
        owned.sort_by_key(|job| job.created_at());
        owned.into_iter()
    }

    /// Delete a terminated job and its retained output.
    pub fn remove_job(&self, job_id: &JobId) -> Result<Arc<Job>> {
        let mut jobs = self.write();
        let job = jobs.get(job_id).ok_or(JobError::NotFound)?;
        if !job.state().is_terminal() {
            return Err(JobError::invalid("job is still running"));
        }
        let job = jobs.remove(job_id).ok_or(JobError::NotFound)?;
        tracing::debug!(job_id = %job_id, "removed job");
        Ok(job)
    }

    /// Drop every job that terminated more than `grace` ago.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let grace = self.grace;
        let expired = |job: &Job| {
            job.terminated()
                .map_or(false, |at| now.saturating_duration_since(at) >= grace)
        };

        if !self.read().values().any(|job| expired(job)) {
            return 0;
        }
        let mut jobs = self.write();
        let before = jobs.len();
        jobs.retain(|_, job| !expired(job));
        let evicted = before - jobs.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted expired jobs");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, Arc<Job>>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, Arc<Job>>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }
}
