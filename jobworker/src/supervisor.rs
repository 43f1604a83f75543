mod actor;
mod messages;

use crate::errors::{JobError, Result};
use crate::isolation::Isolator;
use crate::job::{Job, Termination};
use actor::Worker;
use messages::WorkerMessage;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};

/// Handle to the worker actor that owns a running job's child process.
///
/// The worker holds the unreaped `Child`, so a kill routed through it can
/// never land on a recycled pid.
#[derive(Clone)]
pub struct WorkerHandle {
    sender: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerHandle {
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<WorkerMessage>) {
        let (sender, inbox) = mpsc::unbounded_channel();
        (Self { sender }, inbox)
    }

    /// Kill the job's process tree. Resolves once the signal has been
    /// delivered, or right away if the worker is already gone.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(WorkerMessage::Stop { response: tx }).is_err() {
            return;
        }
        let _ = rx.await;
    }
}

/// Spawns job processes inside their resource boundaries and watches them
/// until they exit.
pub struct Supervisor {
    isolator: Arc<dyn Isolator>,
    read_buffer_bytes: usize,
    drain_timeout: Duration,
}

impl Supervisor {
    pub fn new(isolator: Arc<dyn Isolator>, read_buffer_bytes: usize, drain_timeout: Duration) -> Self {
        Self {
            isolator,
            read_buffer_bytes,
            drain_timeout,
        }
    }

    pub fn isolator_name(&self) -> &'static str {
        self.isolator.name()
    }

    /// Start `job` and return without waiting for it to exit.
    ///
    /// On failure the job is already marked `Failed` and its output stream
    /// completed; the error carries the reason.
    pub async fn start(&self, job: Arc<Job>) -> Result<()> {
        let job_id = job.id();
        let boundary = match self.isolator.create_boundary(job_id, job.limits()) {
            Ok(boundary) => boundary,
            Err(err) => {
                tracing::warn!(job_id = %job_id, error = %err, "failed to create job boundary");
                job.finish(Termination::failed(err.to_string()));
                return Err(err);
            }
        };

        let mut command = Command::new(job.cmd());
        command
            .args(job.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = match boundary.spawn_inside(&mut command) {
            Ok(child) => child,
            Err(source) => {
                tracing::warn!(job_id = %job_id, cmd = %job.cmd(), error = %source, "failed to spawn job");
                boundary.abandon();
                job.finish(Termination::failed(source.to_string()));
                return Err(JobError::ProcessSpawnFailed { job_id, source });
            }
        };

        tracing::info!(
            job_id = %job_id,
            owner = %job.owner(),
            cmd = %job.cmd(),
            pid = ?child.id(),
            isolator = self.isolator.name(),
            "job started"
        );

        // Running must be recorded before the worker can observe an exit.
        let (worker, inbox) = WorkerHandle::new();
        let stop_pending = job.mark_running(worker.clone());
        Worker::spawn(
            inbox,
            job,
            boundary,
            child,
            self.read_buffer_bytes,
            self.drain_timeout,
        );
        if stop_pending {
            worker.stop().await;
        }
        Ok(())
    }
}
