//! Domain records for jobs, export inputs, and the artifact registry.
//!
//! Plain records only: a unit holds its `job_id`, the job holds nothing back.
//! The bidirectional view is a database join, never an in-memory cycle.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque job identity. Clients see the textual [`ExportJob::job_key`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identity of one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InputId(pub Uuid);

impl InputId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for InputId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-process worker identity used as the lease owner marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    /// Host + pid + a short random suffix. Unique per worker process,
    /// stable for its lifetime.
    pub fn generate() -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{host}-{}-{}", std::process::id(), &suffix[..8]))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Calendar-validated effective date, carried as `yyyymmdd` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EffectiveDate(NaiveDate);

impl EffectiveDate {
    /// Parse an integer `yyyymmdd`; rejects non-calendar dates.
    pub fn from_yyyymmdd(value: u32) -> Option<Self> {
        let year = i32::try_from(value / 10_000).ok()?;
        let month = value / 100 % 100;
        let day = value % 100;
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }

    pub fn from_date(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    /// Render back to the wire form, e.g. `20260110`.
    pub fn yyyymmdd(&self) -> u32 {
        use chrono::Datelike;
        self.0.year() as u32 * 10_000 + self.0.month() * 100 + self.0.day()
    }
}

impl std::fmt::Display for EffectiveDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08}", self.yyyymmdd())
    }
}

/// Natural key of one unit: what gets exported, for which date, at which cut.
///
/// Also the natural key of the artifact registry; equality here is what makes
/// cross-job reuse possible.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InputKey {
    pub index_key: String,
    pub effective_date: EffectiveDate,
    pub asof_indicator: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Submitted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Submitted => "SUBMITTED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SUBMITTED" => Some(JobStatus::Submitted),
            "RUNNING" => Some(JobStatus::Running),
            "COMPLETED" => Some(JobStatus::Completed),
            "FAILED" => Some(JobStatus::Failed),
            "CANCELLED" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// COMPLETED, FAILED and CANCELLED are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InputStatus {
    Pending,
    Running,
    Succeeded,
    RetryWait,
    Dlq,
}

impl InputStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputStatus::Pending => "PENDING",
            InputStatus::Running => "RUNNING",
            InputStatus::Succeeded => "SUCCEEDED",
            InputStatus::RetryWait => "RETRY_WAIT",
            InputStatus::Dlq => "DLQ",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(InputStatus::Pending),
            "RUNNING" => Some(InputStatus::Running),
            "SUCCEEDED" => Some(InputStatus::Succeeded),
            "RETRY_WAIT" => Some(InputStatus::RetryWait),
            "DLQ" => Some(InputStatus::Dlq),
            _ => None,
        }
    }

    /// A unit leaves SUCCEEDED or DLQ only through explicit re-drive.
    pub fn is_terminal(&self) -> bool {
        matches!(self, InputStatus::Succeeded | InputStatus::Dlq)
    }
}

/// One submitted batch of export requests.
#[derive(Debug, Clone)]
pub struct ExportJob {
    pub job_id: JobId,
    pub job_key: String,
    pub status: JobStatus,
    pub total_inputs: i32,
    pub requested_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// One unit of work; produces exactly one CSV artifact.
#[derive(Debug, Clone)]
pub struct ExportInput {
    pub input_id: InputId,
    pub job_id: JobId,
    pub key: InputKey,
    pub status: InputStatus,
    pub attempt_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub lease_owner: Option<WorkerId>,
    pub lease_until: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub s3_path: Option<String>,
    pub is_reused: Option<bool>,
    pub error_message: Option<String>,
}

/// Reuse-registry row. Outlives the job that generated it.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub key: InputKey,
    pub s3_path: String,
    pub source_job_id: JobId,
    pub generated_at: DateTime<Utc>,
}

/// The slice of a unit a worker needs after winning a claim.
#[derive(Debug, Clone)]
pub struct ClaimedUnit {
    pub input_id: InputId,
    pub job_id: JobId,
    pub key: InputKey,
    pub attempt_count: i32,
}

/// Aggregate unit counts for a job, from a single grouped query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub total: i64,
    pub pending: i64,
    pub running: i64,
    pub retry_wait: i64,
    pub succeeded: i64,
    pub dlq: i64,
    pub files_generated: i64,
    pub files_reused: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_date_round_trips() {
        let date = EffectiveDate::from_yyyymmdd(20260110).unwrap();
        assert_eq!(date.yyyymmdd(), 20260110);
        assert_eq!(date.to_string(), "20260110");
    }

    #[test]
    fn effective_date_rejects_non_calendar_values() {
        assert!(EffectiveDate::from_yyyymmdd(20260230).is_none());
        assert!(EffectiveDate::from_yyyymmdd(20261301).is_none());
        assert!(EffectiveDate::from_yyyymmdd(0).is_none());
    }

    #[test]
    fn status_text_round_trips() {
        for status in [
            JobStatus::Submitted,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        for status in [
            InputStatus::Pending,
            InputStatus::Running,
            InputStatus::Succeeded,
            InputStatus::RetryWait,
            InputStatus::Dlq,
        ] {
            assert_eq!(InputStatus::parse(status.as_str()), Some(status));
        }
    }
}
