//! Test doubles: a hand-rolled in-memory store with the same guarded
//! predicates as the SQL implementation, a scripted export source, and a
//! manual clock. Everything is deterministic; no database, no timers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::StreamExt as _;

use hakobi_core::clock::Clock;
use hakobi_core::model::{
    Artifact, ClaimedUnit, ExportInput, ExportJob, InputId, InputKey, InputStatus, JobCounts,
    JobId, JobStatus, WorkerId,
};
use hakobi_core::store::{
    CreateJobError, ExportSource, ExportStream, NewUnit, SourceError, Store, StoreError,
};

#[derive(Debug)]
pub struct TestError(pub &'static str);

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

impl std::error::Error for TestError {}

pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self(Mutex::new(start)))
    }

    pub fn advance(&self, delta: chrono::Duration) {
        *self.0.lock().unwrap() += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }
}

#[derive(Default)]
struct MemState {
    jobs: HashMap<JobId, ExportJob>,
    units: HashMap<InputId, ExportInput>,
    artifacts: HashMap<InputKey, Artifact>,
    seq: i64,
}

/// In-memory store mirroring the conditional-update semantics of the SQL
/// implementation: every guard is evaluated against current state and the
/// mutation happens only when the guard passes.
#[derive(Clone, Default)]
pub struct MemStore {
    state: Arc<Mutex<MemState>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unit(&self, input_id: InputId) -> ExportInput {
        self.state.lock().unwrap().units[&input_id].clone()
    }

    pub fn job(&self, job_id: JobId) -> ExportJob {
        self.state.lock().unwrap().jobs[&job_id].clone()
    }

    pub fn job_by_key(&self, job_key: &str) -> ExportJob {
        self.state
            .lock()
            .unwrap()
            .jobs
            .values()
            .find(|j| j.job_key == job_key)
            .expect("job exists")
            .clone()
    }

    pub fn units_of(&self, job_id: JobId) -> Vec<ExportInput> {
        let state = self.state.lock().unwrap();
        let mut units: Vec<_> = state
            .units
            .values()
            .filter(|u| u.job_id == job_id)
            .cloned()
            .collect();
        units.sort_by_key(|u| u.input_id);
        units
    }

    pub fn artifact(&self, key: &InputKey) -> Option<Artifact> {
        self.state.lock().unwrap().artifacts.get(key).cloned()
    }

    /// The universal record invariants, checked at any quiescent point.
    pub fn assert_invariants(&self) {
        let state = self.state.lock().unwrap();
        for unit in state.units.values() {
            assert_eq!(
                unit.status == InputStatus::Running,
                unit.lease_owner.is_some() && unit.lease_until.is_some(),
                "unit {}: lease fields must match RUNNING",
                unit.input_id
            );
            assert_eq!(
                unit.status == InputStatus::RetryWait,
                unit.next_retry_at.is_some(),
                "unit {}: next_retry_at must match RETRY_WAIT",
                unit.input_id
            );
            if unit.status == InputStatus::Succeeded {
                assert!(unit.s3_path.is_some(), "succeeded unit without s3_path");
                assert!(unit.is_reused.is_some(), "succeeded unit without is_reused");
            }
            assert!(unit.attempt_count >= 0);
        }
        for job in state.jobs.values() {
            assert_eq!(
                job.status.is_terminal(),
                job.completed_at.is_some(),
                "job {}: completed_at must match terminal status",
                job.job_key
            );
            let units: Vec<_> = state.units.values().filter(|u| u.job_id == job.job_id).collect();
            assert_eq!(units.len() as i32, job.total_inputs, "total_inputs immutable");
            if job.status == JobStatus::Completed {
                assert!(
                    units.iter().all(|u| u.status == InputStatus::Succeeded),
                    "completed job with non-succeeded unit"
                );
            }
        }
    }

    /// A job accepts work while non-terminal, or when FAILED with every dead
    /// letter re-driven (the job row itself is never reopened).
    fn job_open_for_work(state: &MemState, job: &ExportJob) -> bool {
        match job.status {
            JobStatus::Submitted | JobStatus::Running => true,
            JobStatus::Failed => !state
                .units
                .values()
                .any(|u| u.job_id == job.job_id && u.status == InputStatus::Dlq),
            _ => false,
        }
    }

    fn unit_due(unit: &ExportInput, now: DateTime<Utc>) -> bool {
        match unit.status {
            InputStatus::Pending => true,
            InputStatus::RetryWait => unit.next_retry_at.is_some_and(|at| at <= now),
            InputStatus::Running => unit.lease_until.is_some_and(|until| until <= now),
            _ => false,
        }
    }
}

impl Store for MemStore {
    async fn next_job_seq(&self) -> Result<i64, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.seq += 1;
        Ok(state.seq)
    }

    async fn create_job(&self, job: &ExportJob, units: &[NewUnit]) -> Result<(), CreateJobError> {
        let mut state = self.state.lock().unwrap();
        if state.jobs.values().any(|j| j.job_key == job.job_key) {
            return Err(CreateJobError::KeyConflict);
        }
        state.jobs.insert(job.job_id, job.clone());
        for unit in units {
            state.units.insert(
                unit.input_id,
                ExportInput {
                    input_id: unit.input_id,
                    job_id: job.job_id,
                    key: unit.key.clone(),
                    status: InputStatus::Pending,
                    attempt_count: 0,
                    next_retry_at: None,
                    lease_owner: None,
                    lease_until: None,
                    started_at: None,
                    s3_path: None,
                    is_reused: None,
                    error_message: None,
                },
            );
        }
        Ok(())
    }

    async fn select_eligible(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<InputId>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut eligible: Vec<(DateTime<Utc>, InputId)> = state
            .units
            .values()
            .filter_map(|unit| {
                let job = state.jobs.get(&unit.job_id)?;
                (Self::job_open_for_work(&state, job) && Self::unit_due(unit, now))
                    .then_some((job.requested_at, unit.input_id))
            })
            .collect();
        eligible.sort();
        Ok(eligible.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn claim(
        &self,
        input_id: InputId,
        worker: &WorkerId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedUnit>, StoreError> {
        let mut state = self.state.lock().unwrap();
        let ok = {
            let Some(unit) = state.units.get(&input_id) else {
                return Ok(None);
            };
            let Some(job) = state.jobs.get(&unit.job_id) else {
                return Ok(None);
            };
            Self::job_open_for_work(&state, job) && Self::unit_due(unit, now)
        };
        if !ok {
            return Ok(None);
        }
        let unit = state.units.get_mut(&input_id).unwrap();
        unit.status = InputStatus::Running;
        unit.lease_owner = Some(worker.clone());
        unit.lease_until = Some(lease_until);
        unit.attempt_count += 1;
        unit.started_at.get_or_insert(now);
        unit.next_retry_at = None;
        Ok(Some(ClaimedUnit {
            input_id: unit.input_id,
            job_id: unit.job_id,
            key: unit.key.clone(),
            attempt_count: unit.attempt_count,
        }))
    }

    async fn renew_lease(
        &self,
        input_id: InputId,
        worker: &WorkerId,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        let Some(unit) = state.units.get_mut(&input_id) else {
            return Ok(false);
        };
        if unit.status != InputStatus::Running || unit.lease_owner.as_ref() != Some(worker) {
            return Ok(false);
        }
        unit.lease_until = Some(lease_until);
        Ok(true)
    }

    async fn mark_succeeded_generated(
        &self,
        input_id: InputId,
        worker: &WorkerId,
        s3_path: &str,
    ) -> Result<bool, StoreError> {
        self.mark_succeeded(input_id, worker, s3_path, false)
    }

    async fn mark_succeeded_reused(
        &self,
        input_id: InputId,
        worker: &WorkerId,
        s3_path: &str,
    ) -> Result<bool, StoreError> {
        self.mark_succeeded(input_id, worker, s3_path, true)
    }

    async fn schedule_retry(
        &self,
        input_id: InputId,
        worker: &WorkerId,
        next_retry_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        let Some(unit) = state.units.get_mut(&input_id) else {
            return Ok(false);
        };
        if unit.status != InputStatus::Running || unit.lease_owner.as_ref() != Some(worker) {
            return Ok(false);
        }
        unit.status = InputStatus::RetryWait;
        unit.next_retry_at = Some(next_retry_at);
        unit.error_message = Some(error_message.to_string());
        unit.lease_owner = None;
        unit.lease_until = None;
        Ok(true)
    }

    async fn move_to_dlq(
        &self,
        input_id: InputId,
        worker: &WorkerId,
        error_message: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        let Some(unit) = state.units.get_mut(&input_id) else {
            return Ok(false);
        };
        if unit.status != InputStatus::Running || unit.lease_owner.as_ref() != Some(worker) {
            return Ok(false);
        }
        unit.status = InputStatus::Dlq;
        unit.error_message = Some(error_message.to_string());
        unit.lease_owner = None;
        unit.lease_until = None;
        unit.next_retry_at = None;
        Ok(true)
    }

    async fn lookup_artifact(&self, key: &InputKey) -> Result<Option<Artifact>, StoreError> {
        Ok(self.state.lock().unwrap().artifacts.get(key).cloned())
    }

    async fn upsert_artifact(&self, artifact: &Artifact) -> Result<(), StoreError> {
        self.state
            .lock()
            .unwrap()
            .artifacts
            .insert(artifact.key.clone(), artifact.clone());
        Ok(())
    }

    async fn job_status(&self, job_id: JobId) -> Result<Option<JobStatus>, StoreError> {
        Ok(self.state.lock().unwrap().jobs.get(&job_id).map(|j| j.status))
    }

    async fn mark_job_running(&self, job_id: JobId, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.get_mut(&job_id) {
            if job.status == JobStatus::Submitted {
                job.status = JobStatus::Running;
                job.started_at.get_or_insert(now);
            }
        }
        Ok(())
    }

    async fn fail_job(
        &self,
        job_id: JobId,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(job) = state.jobs.get_mut(&job_id) {
            if !job.status.is_terminal() {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
                job.error_message = Some(error_message.to_string());
            }
        }
        Ok(())
    }

    async fn try_complete_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        let all_succeeded = state
            .units
            .values()
            .filter(|u| u.job_id == job_id)
            .all(|u| u.status == InputStatus::Succeeded);
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        // FAILED is admitted so a fully re-driven job converges to COMPLETED;
        // a remaining DLQ unit fails the all-succeeded check instead.
        let admissible = matches!(
            job.status,
            JobStatus::Submitted | JobStatus::Running | JobStatus::Failed
        );
        if !admissible || !all_succeeded {
            return Ok(false);
        }
        job.status = JobStatus::Completed;
        job.completed_at = Some(now);
        job.error_message = None;
        Ok(true)
    }

    async fn try_fail_job_from_dlq(
        &self,
        job_id: JobId,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        let any_dlq = state
            .units
            .values()
            .any(|u| u.job_id == job_id && u.status == InputStatus::Dlq);
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.status.is_terminal() || !any_dlq {
            return Ok(false);
        }
        job.status = JobStatus::Failed;
        job.completed_at = Some(now);
        job.error_message = Some(error_message.to_string());
        Ok(true)
    }

    async fn cancel_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(now);
        Ok(true)
    }

    async fn reset_unit_for_redrive(&self, input_id: InputId) -> Result<bool, StoreError> {
        // Unit row only; the parent job's record is left as it stands.
        let mut state = self.state.lock().unwrap();
        let Some(unit) = state.units.get_mut(&input_id) else {
            return Ok(false);
        };
        if unit.status != InputStatus::Dlq {
            return Ok(false);
        }
        unit.status = InputStatus::Pending;
        unit.attempt_count = 0;
        unit.next_retry_at = None;
        unit.lease_owner = None;
        unit.lease_until = None;
        unit.started_at = None;
        unit.s3_path = None;
        unit.is_reused = None;
        unit.error_message = None;
        Ok(true)
    }

    async fn active_jobs(&self, limit: usize) -> Result<Vec<JobId>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut jobs: Vec<_> = state
            .jobs
            .values()
            .filter(|j| Self::job_open_for_work(&state, j))
            .map(|j| (j.requested_at, j.job_id))
            .collect();
        jobs.sort();
        Ok(jobs.into_iter().take(limit).map(|(_, id)| id).collect())
    }

    async fn job_counts(&self, job_id: JobId) -> Result<JobCounts, StoreError> {
        let state = self.state.lock().unwrap();
        let mut counts = JobCounts::default();
        for unit in state.units.values().filter(|u| u.job_id == job_id) {
            counts.total += 1;
            match unit.status {
                InputStatus::Pending => counts.pending += 1,
                InputStatus::Running => counts.running += 1,
                InputStatus::RetryWait => counts.retry_wait += 1,
                InputStatus::Succeeded => {
                    counts.succeeded += 1;
                    match unit.is_reused {
                        Some(true) => counts.files_reused += 1,
                        _ => counts.files_generated += 1,
                    }
                }
                InputStatus::Dlq => counts.dlq += 1,
            }
        }
        Ok(counts)
    }

    async fn find_job(&self, job_key: &str) -> Result<Option<ExportJob>, StoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .jobs
            .values()
            .find(|j| j.job_key == job_key)
            .cloned())
    }

    async fn job_units(&self, job_id: JobId) -> Result<Vec<ExportInput>, StoreError> {
        Ok(self.units_of(job_id))
    }
}

impl MemStore {
    fn mark_succeeded(
        &self,
        input_id: InputId,
        worker: &WorkerId,
        s3_path: &str,
        reused: bool,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        let Some(unit) = state.units.get_mut(&input_id) else {
            return Ok(false);
        };
        if unit.status != InputStatus::Running || unit.lease_owner.as_ref() != Some(worker) {
            return Ok(false);
        }
        unit.status = InputStatus::Succeeded;
        unit.s3_path = Some(s3_path.to_string());
        unit.is_reused = Some(reused);
        unit.lease_owner = None;
        unit.lease_until = None;
        unit.next_retry_at = None;
        unit.error_message = None;
        Ok(true)
    }
}

/// Outcome of one scripted export call.
pub enum Outcome {
    Rows(Vec<Vec<Option<String>>>),
    Transient(&'static str),
    Permanent(&'static str),
}

#[derive(Default)]
struct SourceState {
    columns: Vec<String>,
    default_rows: Vec<Vec<Option<String>>>,
    scripted: HashMap<String, VecDeque<Outcome>>,
}

/// Export source whose behavior per index key is queued up by the test.
/// Keys without a script stream the default rows.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    inner: Arc<Mutex<SourceState>>,
}

impl ScriptedSource {
    pub fn with_default(columns: &[&str], rows: Vec<Vec<Option<String>>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SourceState {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                default_rows: rows,
                scripted: HashMap::new(),
            })),
        }
    }

    pub fn script(&self, index_key: &str, outcome: Outcome) {
        self.inner
            .lock()
            .unwrap()
            .scripted
            .entry(index_key.to_string())
            .or_default()
            .push_back(outcome);
    }
}

impl ExportSource for ScriptedSource {
    async fn export(&self, key: &InputKey) -> Result<ExportStream, SourceError> {
        let (columns, rows) = {
            let mut state = self.inner.lock().unwrap();
            let outcome = state
                .scripted
                .get_mut(&key.index_key)
                .and_then(|queue| queue.pop_front());
            match outcome {
                Some(Outcome::Transient(message)) => {
                    return Err(SourceError::transient(Box::new(TestError(message))));
                }
                Some(Outcome::Permanent(message)) => {
                    return Err(SourceError::permanent(Box::new(TestError(message))));
                }
                Some(Outcome::Rows(rows)) => (state.columns.clone(), rows),
                None => (state.columns.clone(), state.default_rows.clone()),
            }
        };
        Ok(ExportStream {
            columns,
            rows: futures::stream::iter(rows.into_iter().map(Ok)).boxed(),
        })
    }
}

/// Two-field default source: every key exports one header and two rows.
pub fn default_source() -> ScriptedSource {
    ScriptedSource::with_default(
        &["constituent", "weight"],
        vec![
            vec![Some("AAA".to_string()), Some("0.6".to_string())],
            vec![Some("BBB".to_string()), Some("0.4".to_string())],
        ],
    )
}
