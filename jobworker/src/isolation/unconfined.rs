use super::{Boundary, Isolator};
use crate::errors::Result;
use crate::limits::ResourceLimits;
use crate::types::JobId;

/// Process-group containment only. Limits are accepted but not enforced.
pub struct Unconfined;

impl Isolator for Unconfined {
    fn name(&self) -> &'static str {
        "unconfined"
    }

    fn create_boundary(&self, job_id: JobId, limits: &ResourceLimits) -> Result<Boundary> {
        if !limits.is_unlimited() {
            tracing::warn!(job_id = %job_id, "resource limits requested but not enforced");
        }
        Ok(Boundary::unconfined(job_id))
    }
}
