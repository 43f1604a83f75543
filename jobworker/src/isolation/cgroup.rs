//! cgroup v2 backend.
//!
//! The configured root must be a delegated cgroup v2 directory. Each job gets
//! a child cgroup named after its id, with the limit files written before any
//! process joins it.

use super::{Boundary, Isolator};
use crate::errors::{JobError, Result};
use crate::limits::ResourceLimits;
use crate::types::JobId;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONTROLLERS: [&str; 3] = ["cpu", "memory", "io"];
const DRAIN_ATTEMPTS: u32 = 50;
const DRAIN_INTERVAL: Duration = Duration::from_millis(10);

pub struct CgroupV2 {
    root: PathBuf,
}

impl CgroupV2 {
    /// Prepare `root` to hold job cgroups, enabling the cpu, memory and io
    /// controllers for its children.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            JobError::Cgroup(format!("failed to create {}: {}", root.display(), e))
        })?;
        let available = fs::read_to_string(root.join("cgroup.controllers")).map_err(|e| {
            JobError::Cgroup(format!(
                "{} is not a cgroup v2 directory: {}",
                root.display(),
                e
            ))
        })?;
        enable_controllers(&root, &available)?;
        tracing::info!(root = %root.display(), "using cgroup v2 isolation");
        Ok(Self { root })
    }

    fn job_path(&self, job_id: JobId) -> PathBuf {
        self.root.join(job_id.to_string())
    }
}

impl Isolator for CgroupV2 {
    fn name(&self) -> &'static str {
        "cgroup_v2"
    }

    fn create_boundary(&self, job_id: JobId, limits: &ResourceLimits) -> Result<Boundary> {
        let path = self.job_path(job_id);
        let fail = |what: &str, e: io::Error| JobError::Isolation {
            job_id,
            reason: format!("{}: {}", what, e),
        };

        fs::create_dir(&path).map_err(|e| fail("create cgroup", e))?;
        let configured = write_limits(&path, limits)
            .map_err(|e| fail("write limits", e))
            .and_then(|()| {
                // a memory kill takes the whole job down, not one process of it
                let oom_group = path.join("memory.oom.group");
                if oom_group.exists() {
                    fs::write(&oom_group, "1").map_err(|e| fail("set memory.oom.group", e))?;
                }
                OpenOptions::new()
                    .write(true)
                    .open(path.join("cgroup.procs"))
                    .map_err(|e| fail("open cgroup.procs", e))
            });

        match configured {
            Ok(procs) => {
                tracing::debug!(job_id = %job_id, cgroup = %path.display(), "created cgroup");
                Ok(Boundary::confined(job_id, CgroupBoundary { path, procs }))
            }
            Err(err) => {
                let _ = fs::remove_dir(&path);
                Err(err)
            }
        }
    }
}

/// A job's cgroup directory plus a handle on its `cgroup.procs`, opened
/// ahead of the fork so the child only has to `write`.
pub(crate) struct CgroupBoundary {
    path: PathBuf,
    procs: File,
}

impl CgroupBoundary {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn procs(&self) -> &File {
        &self.procs
    }

    pub fn kill_members(&self) -> io::Result<()> {
        let kill = self.path.join("cgroup.kill");
        if kill.exists() {
            return fs::write(kill, "1");
        }
        // kernels before 5.14 have no cgroup.kill
        let procs = fs::read_to_string(self.path.join("cgroup.procs"))?;
        for pid in procs.lines().filter_map(|line| line.trim().parse::<i32>().ok()) {
            match signal::kill(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(errno) => return Err(errno.into()),
            }
        }
        Ok(())
    }

    pub fn oom_killed(&self) -> bool {
        fs::read_to_string(self.path.join("memory.events"))
            .map(|events| event_count(&events, "oom_kill") > 0)
            .unwrap_or(false)
    }

    fn is_populated(&self) -> bool {
        fs::read_to_string(self.path.join("cgroup.events"))
            .map(|events| event_count(&events, "populated") > 0)
            .unwrap_or(false)
    }

    pub async fn destroy(self, job_id: JobId) {
        if let Err(e) = self.kill_members() {
            tracing::warn!(job_id = %job_id, error = %e, "failed to kill remaining cgroup members");
        }
        for _ in 0..DRAIN_ATTEMPTS {
            if !self.is_populated() {
                break;
            }
            tokio::time::sleep(DRAIN_INTERVAL).await;
        }
        let CgroupBoundary { path, procs } = self;
        drop(procs);
        remove_cgroup(&path, job_id);
    }

    pub fn abandon(self, job_id: JobId) {
        drop(self.procs);
        remove_cgroup(&self.path, job_id);
    }
}

fn enable_controllers(root: &Path, available: &str) -> Result<()> {
    let wanted: Vec<String> = available
        .split_whitespace()
        .filter(|c| CONTROLLERS.contains(c))
        .map(|c| format!("+{}", c))
        .collect();
    if wanted.len() < CONTROLLERS.len() {
        tracing::warn!(
            root = %root.display(),
            available,
            "some cgroup controllers are not delegated, their limits will not apply"
        );
    }
    if wanted.is_empty() {
        return Ok(());
    }
    fs::write(root.join("cgroup.subtree_control"), wanted.join(" ")).map_err(|e| {
        JobError::Cgroup(format!(
            "failed to enable controllers under {}: {}",
            root.display(),
            e
        ))
    })
}

pub(crate) fn write_limits(path: &Path, limits: &ResourceLimits) -> io::Result<()> {
    if let Some(weight) = limits.cpu_weight {
        fs::write(path.join("cpu.weight"), weight.to_string())?;
    }
    if let Some(cpu_max) = limits.cpu_max {
        fs::write(path.join("cpu.max"), cpu_max.to_string())?;
    }
    if let Some(bytes) = limits.memory_max {
        fs::write(path.join("memory.max"), bytes.to_string())?;
    }
    // io.max takes one device per write
    for io_max in &limits.io_max {
        fs::write(path.join("io.max"), io_max.to_string())?;
    }
    Ok(())
}

/// Read a counter such as `oom_kill 3` out of a flat-keyed cgroup file.
fn event_count(events: &str, key: &str) -> u64 {
    events
        .lines()
        .filter_map(|line| line.split_once(' '))
        .find(|(name, _)| *name == key)
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0)
}

fn remove_cgroup(path: &Path, job_id: JobId) {
    match fs::remove_dir(path) {
        Ok(()) => tracing::debug!(job_id = %job_id, "removed cgroup"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::error!(
            job_id = %job_id,
            cgroup = %path.display(),
            error = %e,
            "failed to remove cgroup, leaking it"
        ),
    }
}
