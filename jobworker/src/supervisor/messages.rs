use tokio::sync::oneshot;

#[derive(Debug)]
pub enum WorkerMessage {
    /// Kill the job's process tree; answered once the signal is delivered.
    Stop { response: oneshot::Sender<()> },
}
