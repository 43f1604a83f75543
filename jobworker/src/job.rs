use crate::events::{JobState, JobStatus};
use crate::limits::ResourceLimits;
use crate::output::OutputMux;
use crate::supervisor::WorkerHandle;
use crate::types::{Args, JobId, Program, UserId};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Instant, SystemTime};

/// One managed execution of a command.
///
/// Immutable facts about the job live directly on the struct. Everything
/// that changes over its life sits behind the job's own lock, and its output
/// behind the multiplexer's. Neither lock is shared with any other job.
pub struct Job {
    id: JobId,
    owner: UserId,
    cmd: Program,
    args: Args,
    limits: ResourceLimits,
    created_at: SystemTime,
    inner: Mutex<JobInner>,
    output: OutputMux,
}

struct JobInner {
    state: JobState,
    exit_code: Option<i32>,
    signal: Option<i32>,
    failure: Option<String>,
    terminated_at: Option<SystemTime>,
    terminated: Option<Instant>,
    worker: Option<WorkerHandle>,
    stop_requested: bool,
}

/// How a job ended, as determined by its supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Termination {
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub failure: Option<String>,
}

impl Termination {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            state: JobState::Failed,
            exit_code: None,
            signal: None,
            failure: Some(reason.into()),
        }
    }
}

impl Job {
    pub(crate) fn new(
        id: JobId,
        owner: UserId,
        cmd: Program,
        args: Args,
        limits: ResourceLimits,
        output: OutputMux,
    ) -> Self {
        Self {
            id,
            owner,
            cmd,
            args,
            limits,
            created_at: SystemTime::now(),
            inner: Mutex::new(JobInner {
                state: JobState::Pending,
                exit_code: None,
                signal: None,
                failure: None,
                terminated_at: None,
                terminated: None,
                worker: None,
                stop_requested: false,
            }),
            output,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn owner(&self) -> &UserId {
        &self.owner
    }

    pub fn cmd(&self) -> &Program {
        &self.cmd
    }

    pub fn args(&self) -> &Args {
        &self.args
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn output(&self) -> &OutputMux {
        &self.output
    }

    pub fn state(&self) -> JobState {
        self.lock().state
    }

    pub fn status(&self) -> JobStatus {
        let inner = self.lock();
        JobStatus {
            job_id: self.id,
            owner: self.owner.clone(),
            cmd: self.cmd.clone(),
            args: self.args.clone(),
            state: inner.state,
            exit_code: inner.exit_code,
            signal: inner.signal,
            failure: inner.failure.clone(),
            created_at: self.created_at,
            terminated_at: inner.terminated_at,
        }
    }

    /// When the job reached a terminal state, if it has.
    pub(crate) fn terminated(&self) -> Option<Instant> {
        self.lock().terminated
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.lock().stop_requested
    }

    /// Record that the process is up and controlled by `worker`.
    ///
    /// Returns true if a stop arrived while the job was still pending, in
    /// which case the caller must forward it to the worker.
    pub(crate) fn mark_running(&self, worker: WorkerHandle) -> bool {
        let mut inner = self.lock();
        if self.advance(&mut inner, JobState::Running) {
            inner.worker = Some(worker);
        }
        inner.stop_requested
    }

    /// Claim the right to signal the job's process.
    ///
    /// Only the first stop of a running job gets a worker back; a pending
    /// job just remembers the request, and everything else is a no-op.
    pub(crate) fn request_stop(&self) -> Option<WorkerHandle> {
        let mut inner = self.lock();
        if inner.state.is_terminal() || inner.stop_requested {
            return None;
        }
        inner.stop_requested = true;
        inner.worker.clone()
    }

    /// Move the job to its terminal state and complete its output stream.
    pub(crate) fn finish(&self, termination: Termination) {
        {
            let mut inner = self.lock();
            if !self.advance(&mut inner, termination.state) {
                return;
            }
            inner.exit_code = termination.exit_code;
            inner.signal = termination.signal;
            inner.failure = termination.failure;
            inner.terminated_at = Some(SystemTime::now());
            inner.terminated = Some(Instant::now());
            inner.worker = None;
        }
        tracing::info!(
            job_id = %self.id,
            state = %termination.state,
            exit_code = ?termination.exit_code,
            signal = ?termination.signal,
            "job finished"
        );
        self.output.close();
    }

    fn advance(&self, inner: &mut JobInner, next: JobState) -> bool {
        if !inner.state.can_advance_to(next) {
            tracing::warn!(job_id = %self.id, from = %inner.state, to = %next, "refusing state transition");
            return false;
        }
        inner.state = next;
        true
    }

    fn lock(&self) -> MutexGuard<'_, JobInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(
            uuid::Uuid::new_v4(),
            "alice".into(),
            "true".into(),
            vec![],
            ResourceLimits::default(),
            OutputMux::new(16, 1, 16),
        )
    }

    #[test]
    fn starts_pending() {
        let job = job();
        let status = job.status();
        assert_eq!(status.state, JobState::Pending);
        assert_eq!(status.owner, "alice");
        assert!(status.exit_code.is_none());
        assert!(status.terminated_at.is_none());
        assert!(job.terminated().is_none());
    }

    #[test]
    fn finish_is_applied_once_and_closes_output() {
        let job = job();
        job.finish(Termination::failed("spawn failed"));
        assert_eq!(job.state(), JobState::Failed);
        assert!(job.output().is_closed());
        assert!(job.terminated().is_some());

        job.finish(Termination {
            state: JobState::Exited,
            exit_code: Some(0),
            signal: None,
            failure: None,
        });
        let status = job.status();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.failure.as_deref(), Some("spawn failed"));
        assert_eq!(status.exit_code, None);
    }

    #[test]
    fn stop_on_pending_job_is_remembered() {
        let job = job();
        assert!(job.request_stop().is_none());
        assert!(job.stop_requested());
        let (worker, _inbox) = WorkerHandle::new();
        assert!(job.mark_running(worker));
        assert_eq!(job.state(), JobState::Running);
        // already requested, so no second signal
        assert!(job.request_stop().is_none());
    }

    #[test]
    fn first_stop_of_running_job_gets_the_worker() {
        let job = job();
        let (worker, _inbox) = WorkerHandle::new();
        assert!(!job.mark_running(worker));
        assert!(job.request_stop().is_some());
        assert!(job.request_stop().is_none());
    }
}
