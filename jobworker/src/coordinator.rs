use crate::authz::{authorize, ExistingJobAction};
use crate::config::Config;
use crate::errors::Result;
use crate::events::JobStatus;
use crate::isolation::create_isolator;
use crate::limits::ResourceLimits;
use crate::output::Subscription;
use crate::registry::{OutputSettings, Registry};
use crate::supervisor::Supervisor;
use crate::types::{Args, JobId, Program, UserId};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Entry point for managing jobs on behalf of authenticated callers.
///
/// Every operation on an existing job is checked against the caller's
/// identity; only a job's owner may see or touch it. The coordinator is
/// cheap to clone and all clones share the same jobs.
#[derive(Clone)]
pub struct JobCoordinator {
    registry: Arc<Registry>,
    supervisor: Arc<Supervisor>,
    default_limits: ResourceLimits,
}

impl JobCoordinator {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let isolator = create_isolator(&config.isolation)?;
        tracing::info!(isolator = isolator.name(), "job coordinator ready");
        let registry = Registry::new(
            config.eviction_grace,
            OutputSettings {
                capacity: config.output_buffer_capacity,
                queue_depth: config.subscriber_queue_depth,
                max_chunk: config.max_chunk_bytes,
            },
        );
        Ok(Self {
            registry: Arc::new(registry),
            supervisor: Arc::new(Supervisor::new(
                isolator,
                config.read_buffer_bytes,
                config.output_drain_timeout,
            )),
            default_limits: config.default_limits,
        })
    }

    /// Name of the isolation backend jobs are started under.
    pub fn isolator_name(&self) -> &'static str {
        self.supervisor.isolator_name()
    }

    /// Start a new job owned by `caller`, under the configured default limits.
    pub async fn start_job(&self, caller: &UserId, cmd: Program, args: Args) -> Result<JobId> {
        self.start_job_with_limits(caller, cmd, args, self.default_limits.clone())
            .await
    }

    /// Start a new job owned by `caller`.
    ///
    /// Returns once the process is running. If it could not be started the
    /// job stays registered as `Failed` so its status can still be queried,
    /// and the error says why.
    pub async fn start_job_with_limits(
        &self,
        caller: &UserId,
        cmd: Program,
        args: Args,
        limits: ResourceLimits,
    ) -> Result<JobId> {
        let job = self.registry.create_job(cmd, args, caller.clone(), limits)?;
        let job_id = job.id();
        self.supervisor.start(job).await?;
        Ok(job_id)
    }

    /// Kill the job's whole process tree.
    ///
    /// Succeeds for a job that has already terminated. The transition to
    /// `Stopped` happens once the process has been reaped, which may be
    /// slightly after this returns.
    pub async fn stop_job(&self, caller: &UserId, job_id: JobId) -> Result<()> {
        let job = authorize(&self.registry, caller, &job_id, ExistingJobAction::StopJob)?;
        if let Some(worker) = job.request_stop() {
            worker.stop().await;
        }
        Ok(())
    }

    pub fn get_job_status(&self, caller: &UserId, job_id: JobId) -> Result<JobStatus> {
        let job = authorize(&self.registry, caller, &job_id, ExistingJobAction::QueryStatus)?;
        Ok(job.status())
    }

    /// Subscribe to the job's combined stdout and stderr.
    ///
    /// Replays everything still retained, follows live output and ends with
    /// [`LogEvent::Terminal`](crate::LogEvent::Terminal). Subscribing again
    /// starts a fresh replay.
    pub fn stream_output(&self, caller: &UserId, job_id: JobId) -> Result<Subscription> {
        let job = authorize(&self.registry, caller, &job_id, ExistingJobAction::StreamOutput)?;
        Ok(job.output().subscribe())
    }

    /// Status of every job `caller` owns, oldest first.
    pub fn list_jobs(&self, caller: &UserId) -> impl Iterator<Item = JobStatus> {
        self.registry.list_jobs(caller).map(|job| job.status())
    }

    /// Forget a terminated job and its retained output ahead of eviction.
    pub fn remove_job(&self, caller: &UserId, job_id: JobId) -> Result<()> {
        authorize(&self.registry, caller, &job_id, ExistingJobAction::RemoveJob)?;
        self.registry.remove_job(&job_id)?;
        Ok(())
    }

    /// Number of jobs currently held, across all owners and states.
    pub fn job_count(&self) -> usize {
        self.registry.len()
    }

    /// Evict jobs whose grace period has run out. Returns how many went.
    pub fn evict_expired(&self) -> usize {
        self.registry.evict_expired()
    }

    /// Run [`evict_expired`](Self::evict_expired) every `period` in the
    /// background.
    ///
    /// The task ends by itself once every clone of the coordinator is dropped.
    pub fn spawn_eviction_task(&self, period: Duration) -> JoinHandle<()> {
        let registry: Weak<Registry> = Arc::downgrade(&self.registry);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else {
                    tracing::debug!("coordinator dropped, stopping eviction task");
                    break;
                };
                registry.evict_expired();
            }
        })
    }
}
