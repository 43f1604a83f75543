use super::messages::WorkerMessage;
use crate::events::JobState;
use crate::isolation::Boundary;
use crate::job::{Job, Termination};
use crate::output::OutputMux;

use bytes::BytesMut;
use futures::future::join_all;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Child,
    select,
    sync::mpsc,
    task::{AbortHandle, JoinHandle},
};

/// Owns one job's child process from spawn until it has been reaped.
pub struct Worker {
    inbox: mpsc::UnboundedReceiver<WorkerMessage>,
    job: Arc<Job>,
    boundary: Boundary,
    pgid: Option<Pid>,
    reaped: bool,
}

impl Worker {
    pub fn spawn(
        inbox: mpsc::UnboundedReceiver<WorkerMessage>,
        job: Arc<Job>,
        boundary: Boundary,
        child: Child,
        read_buffer_bytes: usize,
        drain_timeout: Duration,
    ) {
        // the child made itself a group leader before exec
        let pgid = child.id().map(|pid| Pid::from_raw(pid as i32));
        let actor = Self {
            inbox,
            job,
            boundary,
            pgid,
            reaped: false,
        };
        tokio::spawn(async move { actor.run(child, read_buffer_bytes, drain_timeout).await });
    }

    async fn run(mut self, mut child: Child, read_buffer_bytes: usize, drain_timeout: Duration) {
        let output = self.job.output();
        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pipe_output(stdout, output.clone(), read_buffer_bytes)));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pipe_output(stderr, output.clone(), read_buffer_bytes)));
        }

        let exit = loop {
            select! {
                Some(msg) = self.inbox.recv() => self.handle_message(msg),
                status = child.wait() => break status,
            }
        };
        self.reaped = exit.is_ok();

        // The job ends with its leader; anything it left behind goes too,
        // which also lets the pipe readers reach EOF.
        self.kill_tree();
        self.drain_output(readers, drain_timeout).await;

        let Worker { job, boundary, .. } = self;
        let termination = match exit {
            Ok(status) => {
                let termination = classify(&status, job.stop_requested(), boundary.oom_killed());
                boundary.destroy(&status).await;
                termination
            }
            Err(e) => {
                // Without an exit status the boundary cannot be proven empty,
                // so it is left in place rather than torn down under a live process.
                tracing::error!(job_id = %job.id(), error = %e, "failed to wait for job process");
                Termination::failed(format!("wait failed: {}", e))
            }
        };
        job.finish(termination);
    }

    /// Wait for the pipe readers to hit EOF, answering stops meanwhile.
    ///
    /// A descendant outside the job's process group and cgroup can hold the
    /// pipes open indefinitely; past `timeout` the readers are abandoned.
    async fn drain_output(&mut self, readers: Vec<JoinHandle<()>>, timeout: Duration) {
        let aborts: Vec<AbortHandle> = readers.iter().map(JoinHandle::abort_handle).collect();
        let drained = join_all(readers);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(drained, deadline);
        loop {
            select! {
                _ = &mut drained => return,
                Some(msg) = self.inbox.recv() => self.handle_message(msg),
                _ = &mut deadline => {
                    tracing::warn!(
                        job_id = %self.job.id(),
                        timeout = ?timeout,
                        "job output still open after exit, closing it"
                    );
                    aborts.iter().for_each(AbortHandle::abort);
                    return;
                }
            }
        }
    }

    fn handle_message(&mut self, msg: WorkerMessage) {
        match msg {
            WorkerMessage::Stop { response } => {
                tracing::info!(job_id = %self.job.id(), "stopping job");
                self.kill_tree();
                let _ = response.send(());
            }
        }
    }

    fn kill_tree(&self) {
        // Once the leader is reaped its pid, and so the group id, may be
        // handed out again. A confined job is then swept through its cgroup
        // only. Unconfined, the group id stays reserved while any member is
        // alive, and an empty group has nothing left to kill.
        let group_safe = !self.reaped || !self.boundary.is_confined();
        if let Some(pgid) = self.pgid.filter(|_| group_safe) {
            match killpg(pgid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(errno) => {
                    tracing::warn!(job_id = %self.job.id(), error = %errno, "failed to signal process group")
                }
            }
        }
        if let Err(e) = self.boundary.kill_members() {
            tracing::warn!(job_id = %self.job.id(), error = %e, "failed to kill boundary members");
        }
    }
}

fn classify(status: &ExitStatus, stop_requested: bool, oom_killed: bool) -> Termination {
    if let Some(code) = status.code() {
        return Termination {
            state: JobState::Exited,
            exit_code: Some(code),
            signal: None,
            failure: None,
        };
    }
    let signal = status.signal();
    let (state, failure) = match signal {
        Some(_) if stop_requested => (JobState::Stopped, None),
        Some(_) if oom_killed => (JobState::Failed, Some("out of memory".to_string())),
        Some(sig) => (JobState::Failed, Some(format!("killed by signal {}", sig))),
        None => (JobState::Failed, Some(format!("unrecognised exit status {}", status))),
    };
    Termination {
        state,
        exit_code: None,
        signal,
        failure,
    }
}

async fn pipe_output<R>(mut reader: R, output: OutputMux, read_buffer_bytes: usize)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(read_buffer_bytes);
    loop {
        match reader.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                output.ingest(&buf);
                buf.clear();
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read job output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_exit_codes() {
        let status = ExitStatus::from_raw(2 << 8);
        let termination = classify(&status, false, false);
        assert_eq!(termination.state, JobState::Exited);
        assert_eq!(termination.exit_code, Some(2));
    }

    #[test]
    fn classifies_signals() {
        let killed = ExitStatus::from_raw(libc::SIGKILL);
        assert_eq!(classify(&killed, true, false).state, JobState::Stopped);

        let oom = classify(&killed, false, true);
        assert_eq!(oom.state, JobState::Failed);
        assert_eq!(oom.failure.as_deref(), Some("out of memory"));

        let segv = classify(&ExitStatus::from_raw(libc::SIGSEGV), false, false);
        assert_eq!(segv.signal, Some(libc::SIGSEGV));
        assert_eq!(segv.failure.as_deref(), Some("killed by signal 11"));
    }
}
