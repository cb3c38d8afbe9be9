//! Job-completion reconciliation.
//!
//! Two guarded predicates form the whole transition: fail iff any unit is
//! DLQ, complete iff every unit is SUCCEEDED. Both are single conditional
//! updates, idempotent and safe to race. The fail predicate runs first so a
//! DLQ cannot be masked by a late completion.

use std::sync::Arc;

use futures::{FutureExt as _, StreamExt as _};

use crate::clock::Clock;
use crate::model::{JobId, JobStatus};
use crate::store::{Store, StoreError};
use crate::utils::Ticker;

/// Job-level error once fail-fast has fired.
pub const DLQ_FAIL_MESSAGE: &str = "One or more inputs moved to DLQ";

/// Jobs examined per periodic pass.
const SCAN_LIMIT: usize = 256;

#[derive(Clone)]
pub struct JobFinalizer<S> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S> JobFinalizer<S>
where
    S: Store + Sync,
{
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// One reconciliation attempt; also the executor's fast path after a
    /// terminal unit transition. Losing a concurrent race is a no-op here.
    pub async fn try_finalize(&self, job_id: JobId) -> Result<Option<JobStatus>, StoreError> {
        let now = self.clock.now();
        if self
            .store
            .try_fail_job_from_dlq(job_id, DLQ_FAIL_MESSAGE, now)
            .await?
        {
            return Ok(Some(JobStatus::Failed));
        }
        if self.store.try_complete_job(job_id, now).await? {
            return Ok(Some(JobStatus::Completed));
        }
        Ok(None)
    }

    /// Periodic reconciliation until `shutdown` resolves. This is what makes
    /// job-terminal transitions eventually correct when a worker dies between
    /// a unit's terminal mark and its fast-path attempt.
    pub async fn run(self, interval: std::time::Duration, shutdown: impl Future<Output = ()>) {
        let ticker = Ticker::with_jitter(interval, interval / 10).fuse();
        futures::pin_mut!(ticker);
        let shutdown = shutdown.fuse();
        futures::pin_mut!(shutdown);

        loop {
            futures::select! {
                _ = ticker.next() => self.pass().await,
                _ = shutdown => break,
            }
        }
    }

    async fn pass(&self) {
        let jobs = match self.store.active_jobs(SCAN_LIMIT).await {
            Ok(jobs) => jobs,
            Err(error) => {
                tracing::warn!(error = %error, "finalizer scan failed");
                return;
            }
        };
        for job_id in jobs {
            match self.try_finalize(job_id).await {
                Ok(Some(status)) => {
                    tracing::info!(job_id = %job_id, status = status.as_str(), "job finalized");
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(error = %error, job_id = %job_id, "finalization attempt failed");
                }
            }
        }
    }
}
