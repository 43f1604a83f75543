//! Run arbitrary commands as supervised jobs on behalf of authenticated
//! callers, each inside its own resource boundary, with output that any
//! number of subscribers can replay and follow.

mod authz;
pub mod config;
mod coordinator;
pub mod errors;
mod events;
pub mod isolation;
mod job;
pub mod limits;
pub mod output;
mod registry;
mod supervisor;
pub mod types;

pub use config::{Config, IsolationConfig, IsolationMode};
pub use coordinator::JobCoordinator;
pub use errors::{JobError, Result};
pub use events::{JobState, JobStatus, LogEvent};
pub use limits::{CpuMax, IoMax, ResourceLimits};
pub use output::Subscription;
pub use types::{JobId, UserId};
