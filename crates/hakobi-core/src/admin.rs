//! Status projection and operator actions.
//!
//! Thin over the store: the interesting state transitions all live behind
//! the guarded predicates, so these helpers mostly compose lookups.

use std::sync::Arc;

use crate::clock::Clock;
use crate::model::{ExportInput, ExportJob, InputId, JobCounts, JobStatus};
use crate::store::{Store, StoreError};

/// Job detail plus aggregate counts, as served to clients.
#[derive(Debug, Clone)]
pub struct JobStatusView {
    pub job: ExportJob,
    pub counts: JobCounts,
    pub units: Vec<ExportInput>,
}

impl JobStatusView {
    /// External reporting status. A non-terminal job where work has begun is
    /// rendered IN_PROGRESS even though the row may still say SUBMITTED.
    pub fn reporting_status(&self) -> &'static str {
        match self.job.status {
            JobStatus::Submitted | JobStatus::Running
                if self.counts.pending < self.counts.total =>
            {
                "IN_PROGRESS"
            }
            status => status.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// COMPLETED, FAILED and CANCELLED jobs stay as they are.
    AlreadyTerminal,
    NotFound,
}

#[derive(Clone)]
pub struct Admin<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S> Admin<S>
where
    S: Store + Sync,
{
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn job_status(&self, job_key: &str) -> Result<Option<JobStatusView>, StoreError> {
        let Some(job) = self.store.find_job(job_key).await? else {
            return Ok(None);
        };
        let counts = self.store.job_counts(job.job_id).await?;
        let units = self.store.job_units(job.job_id).await?;
        Ok(Some(JobStatusView { job, counts, units }))
    }

    /// Mark the job CANCELLED. In-flight units finish on their own; new
    /// claims are refused because the parent is terminal.
    pub async fn cancel_job(&self, job_key: &str) -> Result<CancelOutcome, StoreError> {
        let Some(job) = self.store.find_job(job_key).await? else {
            return Ok(CancelOutcome::NotFound);
        };
        if job.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }
        let cancelled = self.store.cancel_job(job.job_id, self.clock.now()).await?;
        if cancelled {
            tracing::info!(job_key = %job_key, "job cancelled");
            Ok(CancelOutcome::Cancelled)
        } else {
            // Lost a race against a concurrent terminal transition.
            Ok(CancelOutcome::AlreadyTerminal)
        }
    }

    /// Move a DLQ unit back to PENDING with attempt state cleared. Returns
    /// whether a unit was actually reset.
    pub async fn redrive_unit(&self, input_id: InputId) -> Result<bool, StoreError> {
        let reset = self.store.reset_unit_for_redrive(input_id).await?;
        if reset {
            tracing::info!(input_id = %input_id, "unit re-driven");
        }
        Ok(reset)
    }
}
