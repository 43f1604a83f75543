use crate::types::{Args, JobId, OutputBlob, Program, UserId};
use std::fmt;
use std::time::SystemTime;

/// Lifecycle state of a job.
///
/// States only move forward: `Pending -> Running -> {Exited, Failed, Stopped}`,
/// with `Pending` allowed to jump straight to `Failed` or `Stopped` when the
/// process never got going.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Running,
    Exited,
    Failed,
    Stopped,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Exited | JobState::Failed | JobState::Stopped)
    }

    /// Whether moving from `self` to `next` keeps the state sequence monotonic.
    pub fn can_advance_to(self, next: JobState) -> bool {
        use JobState::*;
        match (self, next) {
            (Pending, Running) => true,
            (Pending, Failed | Stopped) => true,
            (Running, Exited | Failed | Stopped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Exited => "exited",
            JobState::Failed => "failed",
            JobState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A point-in-time view of a job, as returned by status queries.
#[derive(Clone, Debug)]
pub struct JobStatus {
    pub job_id: JobId,
    pub owner: UserId,
    pub cmd: Program,
    pub args: Args,
    pub state: JobState,
    pub exit_code: Option<i32>,
    /// Signal that terminated the process, if it did not exit on its own.
    pub signal: Option<i32>,
    pub failure: Option<String>,
    pub created_at: SystemTime,
    pub terminated_at: Option<SystemTime>,
}

/// One item of a job's output stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogEvent {
    /// Output bytes, stdout and stderr merged in arrival order.
    Data(OutputBlob),
    /// `missed` bytes were overwritten in the ring before this subscriber read
    /// them. The next `Data` starts at the oldest retained byte.
    Gap { missed: u64 },
    /// No further output will ever be delivered on this subscription.
    Terminal,
}

#[cfg(test)]
mod tests {
    use super::JobState::*;

    #[test]
    fn terminal_states() {
        assert!(!Pending.is_terminal());
        assert!(!Running.is_terminal());
        assert!(Exited.is_terminal());
        assert!(Failed.is_terminal());
        assert!(Stopped.is_terminal());
    }

    #[test]
    fn transitions_never_go_backwards() {
        assert!(Pending.can_advance_to(Running));
        assert!(Pending.can_advance_to(Failed));
        assert!(Running.can_advance_to(Stopped));
        assert!(!Running.can_advance_to(Pending));
        assert!(!Running.can_advance_to(Running));
        assert!(!Exited.can_advance_to(Stopped));
        assert!(!Stopped.can_advance_to(Exited));
        assert!(!Pending.can_advance_to(Exited));
    }
}
