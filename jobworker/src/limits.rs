use crate::errors::{JobError, Result};
use std::fmt;

pub const CPU_WEIGHT_MIN: u32 = 1;
pub const CPU_WEIGHT_MAX: u32 = 10_000;
const CPU_PERIOD_MIN_US: u64 = 1_000;
const CPU_PERIOD_MAX_US: u64 = 1_000_000;

/// Resource limits applied to a job's boundary. `None` leaves the kernel default.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Relative CPU share, written to `cpu.weight`.
    pub cpu_weight: Option<u32>,
    /// Hard CPU bandwidth cap, written to `cpu.max`.
    pub cpu_max: Option<CpuMax>,
    /// Memory ceiling in bytes, written to `memory.max`.
    pub memory_max: Option<u64>,
    /// Per-device IO throughput caps, written to `io.max`.
    pub io_max: Vec<IoMax>,
}

/// `quota_us` of CPU time allowed per `period_us`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CpuMax {
    pub quota_us: u64,
    pub period_us: u64,
}

impl CpuMax {
    /// A cap expressed as a fraction of one CPU, over a 100ms period.
    pub fn from_cpus(cpus: f64) -> Self {
        let period_us = 100_000;
        let quota_us = (cpus * period_us as f64).round().max(0.0) as u64;
        Self {
            quota_us,
            period_us,
        }
    }
}

impl fmt::Display for CpuMax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.quota_us, self.period_us)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoMax {
    pub major: u32,
    pub minor: u32,
    pub rbps: Option<u64>,
    pub wbps: Option<u64>,
    pub riops: Option<u64>,
    pub wiops: Option<u64>,
}

impl IoMax {
    pub fn new(major: u32, minor: u32) -> Self {
        Self {
            major,
            minor,
            rbps: None,
            wbps: None,
            riops: None,
            wiops: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.rbps.is_none() && self.wbps.is_none() && self.riops.is_none() && self.wiops.is_none()
    }
}

impl fmt::Display for IoMax {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)?;
        let keys = [
            ("rbps", self.rbps),
            ("wbps", self.wbps),
            ("riops", self.riops),
            ("wiops", self.wiops),
        ];
        for (key, value) in keys {
            if let Some(value) = value {
                write!(f, " {}={}", key, value)?;
            }
        }
        Ok(())
    }
}

impl ResourceLimits {
    pub fn with_cpu_weight(mut self, weight: u32) -> Self {
        self.cpu_weight = Some(weight);
        self
    }

    pub fn with_cpu_max(mut self, cpu_max: CpuMax) -> Self {
        self.cpu_max = Some(cpu_max);
        self
    }

    pub fn with_memory_max(mut self, bytes: u64) -> Self {
        self.memory_max = Some(bytes);
        self
    }

    pub fn with_io_max(mut self, io_max: IoMax) -> Self {
        self.io_max.push(io_max);
        self
    }

    pub fn is_unlimited(&self) -> bool {
        self.cpu_weight.is_none()
            && self.cpu_max.is_none()
            && self.memory_max.is_none()
            && self.io_max.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(weight) = self.cpu_weight {
            if !(CPU_WEIGHT_MIN..=CPU_WEIGHT_MAX).contains(&weight) {
                return Err(JobError::invalid(format!(
                    "cpu weight {} outside {}..={}",
                    weight, CPU_WEIGHT_MIN, CPU_WEIGHT_MAX
                )));
            }
        }
        if let Some(cpu_max) = self.cpu_max {
            if !(CPU_PERIOD_MIN_US..=CPU_PERIOD_MAX_US).contains(&cpu_max.period_us) {
                return Err(JobError::invalid(format!(
                    "cpu period {}us outside {}..={}",
                    cpu_max.period_us, CPU_PERIOD_MIN_US, CPU_PERIOD_MAX_US
                )));
            }
            if cpu_max.quota_us < CPU_PERIOD_MIN_US {
                return Err(JobError::invalid(format!(
                    "cpu quota {}us below {}us",
                    cpu_max.quota_us, CPU_PERIOD_MIN_US
                )));
            }
        }
        if self.memory_max == Some(0) {
            return Err(JobError::invalid("memory ceiling must be non-zero"));
        }
        for io in &self.io_max {
            if io.is_empty() {
                return Err(JobError::invalid(format!(
                    "io limit for {}:{} sets no caps",
                    io.major, io.minor
                )));
            }
            let zero = [io.rbps, io.wbps, io.riops, io.wiops].contains(&Some(0));
            if zero {
                return Err(JobError::invalid(format!(
                    "io limit for {}:{} has a zero cap",
                    io.major, io.minor
                )));
            }
        }
        Ok(())
    }
}
