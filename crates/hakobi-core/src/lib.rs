//! Core contract between workers and the shared database-backed state
//! machine: work queue, lease manager, retry scheduler, reuse index and
//! job-completion reconciler.
//!
//! Every SQL statement lives behind [`store::Store`]; every HTTP concern
//! lives outside this crate. Coordination is database-only: pollers select
//! and claim, leases expire, the finalizer reconciles. Nothing here shares
//! in-process state between workers.

pub mod admin;
pub mod clock;
pub mod config;
pub mod csv;
pub mod error;
pub mod executor;
pub mod finalizer;
pub mod lease;
pub mod model;
pub mod path;
pub mod poller;
pub mod retry;
pub mod reuse;
pub mod store;
pub mod submission;
pub mod utils;

#[cfg(feature = "rt-tokio")]
pub use poller::TokioSpawner;

pub use admin::{Admin, CancelOutcome, JobStatusView};
pub use clock::{Clock, SystemClock};
pub use config::EngineConfig;
pub use error::UnitError;
pub use executor::Executor;
pub use finalizer::{DLQ_FAIL_MESSAGE, JobFinalizer};
pub use lease::LeaseManager;
pub use model::{
    Artifact, ClaimedUnit, EffectiveDate, ExportInput, ExportJob, InputId, InputKey, InputStatus,
    JobCounts, JobId, JobStatus, WorkerId,
};
pub use poller::{InlineSpawner, JobSpawner, Poller};
pub use retry::{ErrorClass, RetryDecision, RetryPolicy};
pub use reuse::{ArtifactIndex, ReuseDecision};
pub use store::{
    CreateJobError, ExportSource, ExportStream, NewUnit, SourceError, Store, StoreError,
    StoreErrorKind,
};
pub use submission::{SubmitError, SubmitItem, SubmitReceipt, SubmitRequest, Submitter};
