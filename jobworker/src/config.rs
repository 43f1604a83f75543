use crate::errors::{JobError, Result};
use crate::limits::ResourceLimits;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/jobworker";

/// How jobs are confined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationMode {
    /// Use cgroup v2 when the host exposes it, otherwise run unconfined
    /// (or fail, in strict mode).
    Auto,
    /// Always use cgroup v2.
    Cgroup,
    /// Process-group containment only. No resource limits are enforced.
    Unconfined,
}

#[derive(Debug, Clone)]
pub struct IsolationConfig {
    pub mode: IsolationMode,
    /// Parent cgroup under which one child cgroup per job is created.
    /// Must be a delegated cgroup v2 directory writable by this process.
    pub cgroup_root: PathBuf,
    /// Refuse to run jobs without resource limits when cgroups are unavailable.
    pub strict: bool,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            mode: IsolationMode::Auto,
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            strict: false,
        }
    }
}

/// Configuration for a [`JobCoordinator`](crate::JobCoordinator).
#[derive(Debug, Clone)]
pub struct Config {
    /// Bytes of output retained per job. Older output is overwritten.
    pub output_buffer_capacity: usize,
    /// Depth of each subscriber's notification queue.
    pub subscriber_queue_depth: usize,
    /// Largest `Data` chunk handed to a subscriber at once.
    pub max_chunk_bytes: usize,
    /// Size of each read from a child's stdout/stderr pipe.
    pub read_buffer_bytes: usize,
    /// How long to keep reading a job's pipes after its main process has
    /// exited. Descendants that escaped the kill can hold them open.
    pub output_drain_timeout: Duration,
    /// How long a terminated job stays queryable before eviction.
    pub eviction_grace: Duration,
    /// Limits applied when a job is started without explicit ones.
    pub default_limits: ResourceLimits,
    pub isolation: IsolationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_buffer_capacity: 1024 * 1024,
            subscriber_queue_depth: 16,
            max_chunk_bytes: 32 * 1024,
            read_buffer_bytes: 4096,
            output_drain_timeout: Duration::from_secs(5),
            eviction_grace: Duration::from_secs(10 * 60),
            default_limits: ResourceLimits::default(),
            isolation: IsolationConfig::default(),
        }
    }
}

impl Config {
    pub fn with_output_buffer_capacity(mut self, bytes: usize) -> Self {
        self.output_buffer_capacity = bytes;
        self
    }

    pub fn with_subscriber_queue_depth(mut self, depth: usize) -> Self {
        self.subscriber_queue_depth = depth;
        self
    }

    pub fn with_max_chunk_bytes(mut self, bytes: usize) -> Self {
        self.max_chunk_bytes = bytes;
        self
    }

    pub fn with_output_drain_timeout(mut self, timeout: Duration) -> Self {
        self.output_drain_timeout = timeout;
        self
    }

    pub fn with_eviction_grace(mut self, grace: Duration) -> Self {
        self.eviction_grace = grace;
        self
    }

    pub fn with_default_limits(mut self, limits: ResourceLimits) -> Self {
        self.default_limits = limits;
        self
    }

    pub fn with_isolation_mode(mut self, mode: IsolationMode) -> Self {
        self.isolation.mode = mode;
        self
    }

    pub fn with_cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.isolation.cgroup_root = root.into();
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.isolation.strict = strict;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("output_buffer_capacity", self.output_buffer_capacity),
            ("subscriber_queue_depth", self.subscriber_queue_depth),
            ("max_chunk_bytes", self.max_chunk_bytes),
            ("read_buffer_bytes", self.read_buffer_bytes),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, value)| *value == 0) {
            return Err(JobError::invalid(format!("{} must be non-zero", name)));
        }
        self.default_limits.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default() {
        let cfg = Config::default();
        assert_eq!(cfg.output_buffer_capacity, 1024 * 1024);
        assert_eq!(cfg.subscriber_queue_depth, 16);
        assert_eq!(cfg.read_buffer_bytes, 4096);
        assert_eq!(cfg.output_drain_timeout, Duration::from_secs(5));
        assert_eq!(cfg.eviction_grace, Duration::from_secs(600));
        assert_eq!(cfg.isolation.mode, IsolationMode::Auto);
        assert_eq!(cfg.isolation.cgroup_root, PathBuf::from(DEFAULT_CGROUP_ROOT));
        assert!(!cfg.isolation.strict);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn config_builders() {
        let cfg = Config::default()
            .with_output_buffer_capacity(64)
            .with_subscriber_queue_depth(2)
            .with_output_drain_timeout(Duration::from_millis(250))
            .with_isolation_mode(IsolationMode::Unconfined)
            .with_cgroup_root("/tmp/cg")
            .strict(true);
        assert_eq!(cfg.output_buffer_capacity, 64);
        assert_eq!(cfg.subscriber_queue_depth, 2);
        assert_eq!(cfg.output_drain_timeout, Duration::from_millis(250));
        assert_eq!(cfg.isolation.mode, IsolationMode::Unconfined);
        assert_eq!(cfg.isolation.cgroup_root, PathBuf::from("/tmp/cg"));
        assert!(cfg.isolation.strict);
    }

    #[test]
    fn config_rejects_zero_capacity() {
        let cfg = Config::default().with_output_buffer_capacity(0);
        match cfg.validate() {
            Err(JobError::InvalidArgument(msg)) => assert!(msg.contains("output_buffer_capacity")),
            other => panic!("unexpected validation result: {:?}", other),
        }
    }
}
