//! Store contract: every database operation the engine issues.
//!
//! Small surface, strong separation: the engine drives; the store persists.
//!
//! Why:
//! - Guarded mutations return whether a row was affected instead of raising.
//!   Zero rows is a signal (stolen, expired, already final), not an error.
//! - The claim is one conditional update; the WHERE predicate plus the SET
//!   list is the entire safety gate. No higher-level lock exists.
//! - Each operation is a short transaction; nothing holds a transaction
//!   across an upload.

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::model::{
    Artifact, ClaimedUnit, ExportInput, ExportJob, InputId, InputKey, JobCounts, JobId, JobStatus,
    WorkerId,
};
use crate::retry::ErrorClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
/// Categories of failures the store layer can produce.
pub enum StoreErrorKind {
    /// Errors originating from database interactions.
    Database,
    /// Rows that could not be decoded into domain records.
    Decode,
}

#[derive(Debug)]
pub struct StoreError {
    kind: StoreErrorKind,
    inner: Box<dyn std::error::Error + Send + 'static>,
}

impl StoreError {
    pub fn database(inner: Box<dyn std::error::Error + Send + 'static>) -> Self {
        Self {
            kind: StoreErrorKind::Database,
            inner,
        }
    }

    pub fn decode(inner: Box<dyn std::error::Error + Send + 'static>) -> Self {
        Self {
            kind: StoreErrorKind::Decode,
            inner,
        }
    }

    pub fn kind(&self) -> StoreErrorKind {
        self.kind
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref())
    }
}

/// Failure of the job-creation transaction.
#[derive(Debug, thiserror::Error)]
pub enum CreateJobError {
    #[error("job key already exists")]
    KeyConflict,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A new unit row for `create_job`. Created PENDING with attempt 0.
#[derive(Debug, Clone)]
pub struct NewUnit {
    pub input_id: InputId,
    pub key: InputKey,
}

mod tmp {
    use super::*;

    /// Transactional operations over jobs, units and the artifact registry.
    ///
    /// Implementations must keep every guarded mutation a single conditional
    /// statement so that concurrent workers race on row counts, not on locks.
    #[trait_variant::make(Store: Send)]
    pub trait LocalStore {
        /// Next value of the job-key sequence.
        async fn next_job_seq(&self) -> Result<i64, StoreError>;

        /// Insert the job row and all unit rows in one transaction.
        async fn create_job(
            &self,
            job: &ExportJob,
            units: &[NewUnit],
        ) -> Result<(), CreateJobError>;

        /// Up to `limit` unit ids whose parent job still accepts work — it is
        /// non-terminal, or FAILED with every dead-lettered unit re-driven —
        /// and which are PENDING, due RETRY_WAIT, or RUNNING with an expired
        /// lease. Oldest job first, then by unit id: FIFO fairness across
        /// jobs.
        async fn select_eligible(
            &self,
            limit: usize,
            now: DateTime<Utc>,
        ) -> Result<Vec<InputId>, StoreError>;

        /// The atomic claim: eligibility check, RUNNING transition, lease
        /// assignment and attempt increment in one guarded update. `None`
        /// means another worker won, the unit became ineligible, or the
        /// parent job went terminal.
        async fn claim(
            &self,
            input_id: InputId,
            worker: &WorkerId,
            lease_until: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> Result<Option<ClaimedUnit>, StoreError>;

        /// Extend the lease while still owned by `worker`.
        async fn renew_lease(
            &self,
            input_id: InputId,
            worker: &WorkerId,
            lease_until: DateTime<Utc>,
        ) -> Result<bool, StoreError>;

        /// RUNNING → SUCCEEDED with a freshly generated artifact.
        async fn mark_succeeded_generated(
            &self,
            input_id: InputId,
            worker: &WorkerId,
            s3_path: &str,
        ) -> Result<bool, StoreError>;

        /// RUNNING → SUCCEEDED pointing at a prior job's artifact.
        async fn mark_succeeded_reused(
            &self,
            input_id: InputId,
            worker: &WorkerId,
            s3_path: &str,
        ) -> Result<bool, StoreError>;

        /// RUNNING → RETRY_WAIT; clears the lease, records the error.
        async fn schedule_retry(
            &self,
            input_id: InputId,
            worker: &WorkerId,
            next_retry_at: DateTime<Utc>,
            error_message: &str,
        ) -> Result<bool, StoreError>;

        /// RUNNING → DLQ; clears the lease, records the error.
        async fn move_to_dlq(
            &self,
            input_id: InputId,
            worker: &WorkerId,
            error_message: &str,
        ) -> Result<bool, StoreError>;

        async fn lookup_artifact(&self, key: &InputKey) -> Result<Option<Artifact>, StoreError>;

        /// Insert or replace by natural key. Idempotent under identical input.
        async fn upsert_artifact(&self, artifact: &Artifact) -> Result<(), StoreError>;

        async fn job_status(&self, job_id: JobId) -> Result<Option<JobStatus>, StoreError>;

        /// SUBMITTED → RUNNING with `started_at`; no-op on anything else.
        async fn mark_job_running(
            &self,
            job_id: JobId,
            now: DateTime<Utc>,
        ) -> Result<(), StoreError>;

        /// Force-fail a non-terminal job. Idempotent; terminal jobs untouched.
        async fn fail_job(
            &self,
            job_id: JobId,
            error_message: &str,
            now: DateTime<Utc>,
        ) -> Result<(), StoreError>;

        /// Completion guard: all units SUCCEEDED and none DLQ, PENDING,
        /// RUNNING, or RETRY_WAIT. Also lifts a fail-fasted job to COMPLETED
        /// once a re-drive has carried every unit to success. Returns whether
        /// the transition happened.
        async fn try_complete_job(
            &self,
            job_id: JobId,
            now: DateTime<Utc>,
        ) -> Result<bool, StoreError>;

        /// Fail guard: at least one unit in DLQ. Returns whether the
        /// transition happened.
        async fn try_fail_job_from_dlq(
            &self,
            job_id: JobId,
            error_message: &str,
            now: DateTime<Utc>,
        ) -> Result<bool, StoreError>;

        /// SUBMITTED|RUNNING → CANCELLED. In-flight units finish on their own
        /// and hit the executor's job guard.
        async fn cancel_job(&self, job_id: JobId, now: DateTime<Utc>)
            -> Result<bool, StoreError>;

        /// Operator re-drive: DLQ → PENDING with attempt state cleared. The
        /// parent job row is untouched; once no DLQ unit remains, pollers
        /// resume the job's units and the completion guard settles it.
        async fn reset_unit_for_redrive(&self, input_id: InputId) -> Result<bool, StoreError>;

        /// Jobs currently worth a finalizer pass: non-terminal, plus FAILED
        /// jobs whose dead letters have all been re-driven.
        async fn active_jobs(&self, limit: usize) -> Result<Vec<JobId>, StoreError>;

        async fn job_counts(&self, job_id: JobId) -> Result<JobCounts, StoreError>;

        async fn find_job(&self, job_key: &str) -> Result<Option<ExportJob>, StoreError>;

        async fn job_units(&self, job_id: JobId) -> Result<Vec<ExportInput>, StoreError>;
    }
}

pub use tmp::Store;

#[derive(Debug)]
/// Failure of the export procedure or its row stream, pre-classified by the
/// layer that talked to the database.
pub struct SourceError {
    class: ErrorClass,
    inner: Box<dyn std::error::Error + Send + 'static>,
}

impl SourceError {
    pub fn transient(inner: Box<dyn std::error::Error + Send + 'static>) -> Self {
        Self {
            class: ErrorClass::Transient,
            inner,
        }
    }

    pub fn permanent(inner: Box<dyn std::error::Error + Send + 'static>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            inner,
        }
    }

    pub fn class(&self) -> ErrorClass {
        self.class
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for SourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.inner.as_ref())
    }
}

/// Column names plus a row stream. Rows are rendered fields in column order;
/// they are never materialized as a whole.
pub struct ExportStream {
    pub columns: Vec<String>,
    pub rows: BoxStream<'static, Result<Vec<Option<String>>, SourceError>>,
}

mod source_tmp {
    use super::*;

    /// The non-paginated export procedure, seen as an opaque streaming source.
    #[trait_variant::make(ExportSource: Send)]
    pub trait LocalExportSource {
        async fn export(&self, key: &InputKey) -> Result<ExportStream, SourceError>;
    }
}

pub use source_tmp::ExportSource;
