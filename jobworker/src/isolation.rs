//! Per-job resource boundaries.
//!
//! A [`Boundary`] is created before the job's process exists and the process
//! is spawned already inside it. The child joins its cgroup from a
//! `pre_exec` hook, after `fork` but before `execve`, so none of the job's
//! own instructions ever run unconfined. A boundary can only be destroyed
//! with the reaped `ExitStatus` in hand, which keeps teardown from racing a
//! live process.

mod cgroup;
mod unconfined;

pub use cgroup::CgroupV2;
pub use unconfined::Unconfined;

use crate::config::{IsolationConfig, IsolationMode};
use crate::errors::{JobError, Result};
use crate::limits::ResourceLimits;
use crate::types::JobId;
use cgroup::CgroupBoundary;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use tokio::process::{Child, Command};

const CGROUP2_CONTROLLERS: &str = "/sys/fs/cgroup/cgroup.controllers";

/// Builds resource boundaries for jobs.
pub trait Isolator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Allocate a boundary sized per `limits`. No process is inside it yet.
    fn create_boundary(&self, job_id: JobId, limits: &ResourceLimits) -> Result<Boundary>;
}

/// The resource boundary of a single job.
pub struct Boundary {
    job_id: JobId,
    cgroup: Option<CgroupBoundary>,
}

impl Boundary {
    pub(crate) fn unconfined(job_id: JobId) -> Self {
        Self {
            job_id,
            cgroup: None,
        }
    }

    pub(crate) fn confined(job_id: JobId, cgroup: CgroupBoundary) -> Self {
        Self {
            job_id,
            cgroup: Some(cgroup),
        }
    }

    pub fn is_confined(&self) -> bool {
        self.cgroup.is_some()
    }

    pub fn cgroup_path(&self) -> Option<&Path> {
        self.cgroup.as_ref().map(CgroupBoundary::path)
    }

    /// Spawn `cmd` as a member of this boundary.
    ///
    /// The child also becomes leader of a fresh process group, so the job's
    /// whole tree can be signalled through its pid.
    pub fn spawn_inside(&self, cmd: &mut Command) -> io::Result<Child> {
        // The join happens in the forked child, not at clone time: between
        // fork and this write the child is still a copy of the supervisor and
        // sits in the supervisor's cgroup. Nothing from `cmd` runs before it.
        let procs_fd = self.cgroup.as_ref().map(|cg| cg.procs().as_raw_fd());
        // SAFETY: the hook runs between fork and exec and only makes
        // async-signal-safe calls (write, setpgid). `procs_fd` stays open
        // until `spawn` returns because `self` owns it.
        unsafe {
            cmd.pre_exec(move || {
                if let Some(fd) = procs_fd {
                    let me = b"0";
                    if libc::write(fd, me.as_ptr().cast(), me.len()) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                if libc::setpgid(0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
        cmd.spawn()
    }

    /// SIGKILL every process still inside the boundary.
    pub fn kill_members(&self) -> io::Result<()> {
        match &self.cgroup {
            Some(cg) => cg.kill_members(),
            None => Ok(()),
        }
    }

    /// Whether the kernel OOM-killed anything in this boundary.
    pub fn oom_killed(&self) -> bool {
        self.cgroup
            .as_ref()
            .map(CgroupBoundary::oom_killed)
            .unwrap_or(false)
    }

    /// Tear the boundary down. Requires the job's reaped exit status.
    pub async fn destroy(self, _reaped: &ExitStatus) {
        if let Some(cg) = self.cgroup {
            cg.destroy(self.job_id).await;
        }
    }

    /// Tear down a boundary that never had a process spawned into it.
    pub fn abandon(self) {
        if let Some(cg) = self.cgroup {
            cg.abandon(self.job_id);
        }
    }
}

pub fn cgroup_v2_available() -> bool {
    Path::new(CGROUP2_CONTROLLERS).exists()
}

/// Choose an isolator for `config`.
///
/// `Auto` prefers cgroup v2 and falls back to running unconfined, unless
/// `strict` is set, in which case the missing hierarchy is an error.
pub fn create_isolator(config: &IsolationConfig) -> Result<Arc<dyn Isolator>> {
    match config.mode {
        IsolationMode::Unconfined => Ok(Arc::new(Unconfined)),
        IsolationMode::Cgroup => Ok(Arc::new(CgroupV2::new(&config.cgroup_root)?)),
        IsolationMode::Auto => {
            if !cgroup_v2_available() {
                if config.strict {
                    return Err(JobError::Cgroup(
                        "no cgroup v2 hierarchy available in strict mode".to_string(),
                    ));
                }
                tracing::warn!("cgroup v2 not available, jobs will run without resource limits");
                return Ok(Arc::new(Unconfined));
            }
            match CgroupV2::new(&config.cgroup_root) {
                Ok(cgroup) => Ok(Arc::new(cgroup)),
                Err(err) if !config.strict => {
                    tracing::warn!(
                        root = %config.cgroup_root.display(),
                        error = %err,
                        "cgroup root unusable, jobs will run without resource limits"
                    );
                    Ok(Arc::new(Unconfined))
                }
                Err(err) => Err(err),
            }
        }
    }
}
