//! PostgreSQL implementation of the store contract.
//!
//! Every guarded mutation is a single conditional UPDATE; the WHERE
//! predicate plus the SET list is the whole safety gate. Row counts carry
//! the verdict: zero affected rows means stolen, expired, or already final.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use hakobi_core::model::{
    Artifact, ClaimedUnit, EffectiveDate, ExportInput, ExportJob, InputId, InputKey, InputStatus,
    JobCounts, JobId, JobStatus, WorkerId,
};
use hakobi_core::store::{CreateJobError, NewUnit, Store, StoreError};

/// Shared-pool store handle; cheap to clone, one per worker process.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply embedded migrations. Run once at startup; a schema mismatch is
    /// a startup failure, not a per-unit error.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        MIGRATOR.run(&self.pool).await
    }
}

fn db_error(error: sqlx::Error) -> StoreError {
    StoreError::database(Box::new(error))
}

#[derive(Debug)]
struct BadRow(String);

impl std::fmt::Display for BadRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for BadRow {}

fn decode_error(message: impl Into<String>) -> StoreError {
    StoreError::decode(Box::new(BadRow(message.into())))
}

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: Uuid,
    job_key: String,
    status: String,
    total_inputs: i32,
    requested_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl JobRow {
    fn into_job(self) -> Result<ExportJob, StoreError> {
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| decode_error(format!("unknown job status {:?}", self.status)))?;
        Ok(ExportJob {
            job_id: JobId(self.job_id),
            job_key: self.job_key,
            status,
            total_inputs: self.total_inputs,
            requested_at: self.requested_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error_message: self.error_message,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InputRow {
    input_id: Uuid,
    job_id: Uuid,
    index_key: String,
    effective_date: NaiveDate,
    asof_indicator: String,
    status: String,
    attempt_count: i32,
    next_retry_at: Option<DateTime<Utc>>,
    lease_owner: Option<String>,
    lease_until: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    s3_path: Option<String>,
    is_reused: Option<bool>,
    error_message: Option<String>,
}

impl InputRow {
    fn into_input(self) -> Result<ExportInput, StoreError> {
        let status = InputStatus::parse(&self.status)
            .ok_or_else(|| decode_error(format!("unknown input status {:?}", self.status)))?;
        Ok(ExportInput {
            input_id: InputId(self.input_id),
            job_id: JobId(self.job_id),
            key: InputKey {
                index_key: self.index_key,
                effective_date: EffectiveDate::from_date(self.effective_date),
                asof_indicator: self.asof_indicator,
            },
            status,
            attempt_count: self.attempt_count,
            next_retry_at: self.next_retry_at,
            lease_owner: self.lease_owner.map(WorkerId::new),
            lease_until: self.lease_until,
            started_at: self.started_at,
            s3_path: self.s3_path,
            is_reused: self.is_reused,
            error_message: self.error_message,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ClaimRow {
    input_id: Uuid,
    job_id: Uuid,
    index_key: String,
    effective_date: NaiveDate,
    asof_indicator: String,
    attempt_count: i32,
}

impl From<ClaimRow> for ClaimedUnit {
    fn from(row: ClaimRow) -> Self {
        ClaimedUnit {
            input_id: InputId(row.input_id),
            job_id: JobId(row.job_id),
            key: InputKey {
                index_key: row.index_key,
                effective_date: EffectiveDate::from_date(row.effective_date),
                asof_indicator: row.asof_indicator,
            },
            attempt_count: row.attempt_count,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ArtifactRow {
    index_key: String,
    effective_date: NaiveDate,
    asof_indicator: String,
    s3_path: String,
    source_job_id: Uuid,
    generated_at: DateTime<Utc>,
}

impl From<ArtifactRow> for Artifact {
    fn from(row: ArtifactRow) -> Self {
        Artifact {
            key: InputKey {
                index_key: row.index_key,
                effective_date: EffectiveDate::from_date(row.effective_date),
                asof_indicator: row.asof_indicator,
            },
            s3_path: row.s3_path,
            source_job_id: JobId(row.source_job_id),
            generated_at: row.generated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct CountsRow {
    total: i64,
    pending: i64,
    running: i64,
    retry_wait: i64,
    succeeded: i64,
    dlq: i64,
    files_generated: i64,
    files_reused: i64,
}

impl Store for PgStore {
    async fn next_job_seq(&self) -> Result<i64, StoreError> {
        sqlx::query_scalar("SELECT nextval('export_job_key_seq')")
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)
    }

    async fn create_job(&self, job: &ExportJob, units: &[NewUnit]) -> Result<(), CreateJobError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO export_jobs (job_id, job_key, status, total_inputs, requested_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(job.job_id.0)
        .bind(&job.job_key)
        .bind(job.status.as_str())
        .bind(job.total_inputs)
        .bind(job.requested_at)
        .execute(&mut *tx)
        .await;

        if let Err(error) = inserted {
            if error
                .as_database_error()
                .is_some_and(|db| db.is_unique_violation())
            {
                return Err(CreateJobError::KeyConflict);
            }
            return Err(db_error(error).into());
        }

        let mut input_ids = Vec::with_capacity(units.len());
        let mut index_keys = Vec::with_capacity(units.len());
        let mut dates = Vec::with_capacity(units.len());
        let mut asofs = Vec::with_capacity(units.len());
        for unit in units {
            input_ids.push(unit.input_id.0);
            index_keys.push(unit.key.index_key.clone());
            dates.push(unit.key.effective_date.date());
            asofs.push(unit.key.asof_indicator.clone());
        }

        sqlx::query(
            r#"
            INSERT INTO export_inputs (input_id, job_id, index_key, effective_date, asof_indicator, status)
            SELECT t.input_id, $1, t.index_key, t.effective_date, t.asof_indicator, 'PENDING'
            FROM UNNEST($2::uuid[], $3::text[], $4::date[], $5::text[])
                AS t(input_id, index_key, effective_date, asof_indicator)
            "#,
        )
        .bind(job.job_id.0)
        .bind(&input_ids)
        .bind(&index_keys)
        .bind(&dates)
        .bind(&asofs)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(())
    }

    async fn select_eligible(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<InputId>, StoreError> {
        // A FAILED job is frozen while any unit sits in DLQ; once every dead
        // letter has been re-driven its units flow through the ordinary
        // claim path again. The job row itself is never reopened.
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT i.input_id
            FROM export_inputs i
            JOIN export_jobs j ON j.job_id = i.job_id
            WHERE (j.status IN ('SUBMITTED', 'RUNNING')
                OR (j.status = 'FAILED' AND NOT EXISTS (
                    SELECT 1 FROM export_inputs d
                    WHERE d.job_id = j.job_id AND d.status = 'DLQ')))
              AND (i.status = 'PENDING'
                OR (i.status = 'RETRY_WAIT' AND i.next_retry_at <= $1)
                OR (i.status = 'RUNNING' AND i.lease_until <= $1))
            ORDER BY j.requested_at ASC, i.input_id ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(ids.into_iter().map(InputId).collect())
    }

    async fn claim(
        &self,
        input_id: InputId,
        worker: &WorkerId,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<ClaimedUnit>, StoreError> {
        let row: Option<ClaimRow> = sqlx::query_as(
            r#"
            UPDATE export_inputs i SET
                status = 'RUNNING',
                lease_owner = $2,
                lease_until = $3,
                attempt_count = i.attempt_count + 1,
                started_at = COALESCE(i.started_at, $4),
                next_retry_at = NULL
            FROM export_jobs j
            WHERE i.input_id = $1
              AND j.job_id = i.job_id
              AND (j.status IN ('SUBMITTED', 'RUNNING')
                OR (j.status = 'FAILED' AND NOT EXISTS (
                    SELECT 1 FROM export_inputs d
                    WHERE d.job_id = j.job_id AND d.status = 'DLQ')))
              AND (i.status = 'PENDING'
                OR (i.status = 'RETRY_WAIT' AND i.next_retry_at <= $4)
                OR (i.status = 'RUNNING' AND i.lease_until <= $4))
            RETURNING i.input_id, i.job_id, i.index_key, i.effective_date,
                      i.asof_indicator, i.attempt_count
            "#,
        )
        .bind(input_id.0)
        .bind(worker.as_str())
        .bind(lease_until)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(ClaimedUnit::from))
    }

    async fn renew_lease(
        &self,
        input_id: InputId,
        worker: &WorkerId,
        lease_until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE export_inputs
            SET lease_until = $3
            WHERE input_id = $1 AND lease_owner = $2 AND status = 'RUNNING'
            "#,
        )
        .bind(input_id.0)
        .bind(worker.as_str())
        .bind(lease_until)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_succeeded_generated(
        &self,
        input_id: InputId,
        worker: &WorkerId,
        s3_path: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE export_inputs SET
                status = 'SUCCEEDED',
                s3_path = $3,
                is_reused = FALSE,
                lease_owner = NULL,
                lease_until = NULL,
                next_retry_at = NULL,
                error_message = NULL
            WHERE input_id = $1 AND lease_owner = $2 AND status = 'RUNNING'
            "#,
        )
        .bind(input_id.0)
        .bind(worker.as_str())
        .bind(s3_path)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_succeeded_reused(
        &self,
        input_id: InputId,
        worker: &WorkerId,
        s3_path: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE export_inputs SET
                status = 'SUCCEEDED',
                s3_path = $3,
                is_reused = TRUE,
                lease_owner = NULL,
                lease_until = NULL,
                next_retry_at = NULL,
                error_message = NULL
            WHERE input_id = $1 AND lease_owner = $2 AND status = 'RUNNING'
            "#,
        )
        .bind(input_id.0)
        .bind(worker.as_str())
        .bind(s3_path)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn schedule_retry(
        &self,
        input_id: InputId,
        worker: &WorkerId,
        next_retry_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE export_inputs SET
                status = 'RETRY_WAIT',
                next_retry_at = $3,
                error_message = $4,
                lease_owner = NULL,
                lease_until = NULL
            WHERE input_id = $1 AND lease_owner = $2 AND status = 'RUNNING'
            "#,
        )
        .bind(input_id.0)
        .bind(worker.as_str())
        .bind(next_retry_at)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn move_to_dlq(
        &self,
        input_id: InputId,
        worker: &WorkerId,
        error_message: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE export_inputs SET
                status = 'DLQ',
                error_message = $3,
                lease_owner = NULL,
                lease_until = NULL,
                next_retry_at = NULL
            WHERE input_id = $1 AND lease_owner = $2 AND status = 'RUNNING'
            "#,
        )
        .bind(input_id.0)
        .bind(worker.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn lookup_artifact(&self, key: &InputKey) -> Result<Option<Artifact>, StoreError> {
        let row: Option<ArtifactRow> = sqlx::query_as(
            r#"
            SELECT index_key, effective_date, asof_indicator, s3_path, source_job_id, generated_at
            FROM export_artifacts
            WHERE index_key = $1 AND effective_date = $2 AND asof_indicator = $3
            "#,
        )
        .bind(&key.index_key)
        .bind(key.effective_date.date())
        .bind(&key.asof_indicator)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(row.map(Artifact::from))
    }

    async fn upsert_artifact(&self, artifact: &Artifact) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO export_artifacts
                (index_key, effective_date, asof_indicator, s3_path, source_job_id, generated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (index_key, effective_date, asof_indicator) DO UPDATE SET
                s3_path = EXCLUDED.s3_path,
                source_job_id = EXCLUDED.source_job_id,
                generated_at = EXCLUDED.generated_at
            "#,
        )
        .bind(&artifact.key.index_key)
        .bind(artifact.key.effective_date.date())
        .bind(&artifact.key.asof_indicator)
        .bind(&artifact.s3_path)
        .bind(artifact.source_job_id.0)
        .bind(artifact.generated_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn job_status(&self, job_id: JobId) -> Result<Option<JobStatus>, StoreError> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM export_jobs WHERE job_id = $1")
                .bind(job_id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_error)?;

        status
            .map(|s| {
                JobStatus::parse(&s).ok_or_else(|| decode_error(format!("unknown job status {s:?}")))
            })
            .transpose()
    }

    async fn mark_job_running(&self, job_id: JobId, now: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'RUNNING', started_at = COALESCE(started_at, $2)
            WHERE job_id = $1 AND status = 'SUBMITTED'
            "#,
        )
        .bind(job_id.0)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn fail_job(
        &self,
        job_id: JobId,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'FAILED', completed_at = $3, error_message = $2
            WHERE job_id = $1 AND status IN ('SUBMITTED', 'RUNNING')
            "#,
        )
        .bind(job_id.0)
        .bind(error_message)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(())
    }

    async fn try_complete_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        // FAILED is included so a fail-fasted job whose dead letters were all
        // re-driven (and have since succeeded) converges to COMPLETED. A
        // FAILED job that still holds a DLQ unit cannot pass the guard.
        let result = sqlx::query(
            r#"
            UPDATE export_jobs j
            SET status = 'COMPLETED', completed_at = $2, error_message = NULL
            WHERE j.job_id = $1
              AND j.status IN ('SUBMITTED', 'RUNNING', 'FAILED')
              AND NOT EXISTS (
                SELECT 1 FROM export_inputs i
                WHERE i.job_id = j.job_id AND i.status <> 'SUCCEEDED'
              )
            "#,
        )
        .bind(job_id.0)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn try_fail_job_from_dlq(
        &self,
        job_id: JobId,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE export_jobs j
            SET status = 'FAILED', completed_at = $3, error_message = $2
            WHERE j.job_id = $1
              AND j.status IN ('SUBMITTED', 'RUNNING')
              AND EXISTS (
                SELECT 1 FROM export_inputs i
                WHERE i.job_id = j.job_id AND i.status = 'DLQ'
              )
            "#,
        )
        .bind(job_id.0)
        .bind(error_message)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn cancel_job(&self, job_id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE export_jobs
            SET status = 'CANCELLED', completed_at = $2
            WHERE job_id = $1 AND status IN ('SUBMITTED', 'RUNNING')
            "#,
        )
        .bind(job_id.0)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn reset_unit_for_redrive(&self, input_id: InputId) -> Result<bool, StoreError> {
        // Unit row only. The parent job's status, completed_at and
        // error_message stay as recorded; pollers resume the job's units once
        // no DLQ remains and the finalizer lifts it to COMPLETED.
        let result = sqlx::query(
            r#"
            UPDATE export_inputs SET
                status = 'PENDING',
                attempt_count = 0,
                next_retry_at = NULL,
                lease_owner = NULL,
                lease_until = NULL,
                started_at = NULL,
                s3_path = NULL,
                is_reused = NULL,
                error_message = NULL
            WHERE input_id = $1 AND status = 'DLQ'
            "#,
        )
        .bind(input_id.0)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn active_jobs(&self, limit: usize) -> Result<Vec<JobId>, StoreError> {
        // FAILED jobs with no remaining DLQ unit are mid-re-drive; the
        // finalizer keeps watching them until the completion guard fires.
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT j.job_id FROM export_jobs j
            WHERE j.status IN ('SUBMITTED', 'RUNNING')
               OR (j.status = 'FAILED' AND NOT EXISTS (
                   SELECT 1 FROM export_inputs i
                   WHERE i.job_id = j.job_id AND i.status = 'DLQ'))
            ORDER BY j.requested_at ASC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(ids.into_iter().map(JobId).collect())
    }

    async fn job_counts(&self, job_id: JobId) -> Result<JobCounts, StoreError> {
        let row: CountsRow = sqlx::query_as(
            r#"
            SELECT
                count(*) AS total,
                count(*) FILTER (WHERE status = 'PENDING') AS pending,
                count(*) FILTER (WHERE status = 'RUNNING') AS running,
                count(*) FILTER (WHERE status = 'RETRY_WAIT') AS retry_wait,
                count(*) FILTER (WHERE status = 'SUCCEEDED') AS succeeded,
                count(*) FILTER (WHERE status = 'DLQ') AS dlq,
                count(*) FILTER (WHERE status = 'SUCCEEDED' AND is_reused = FALSE) AS files_generated,
                count(*) FILTER (WHERE status = 'SUCCEEDED' AND is_reused = TRUE) AS files_reused
            FROM export_inputs
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.0)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(JobCounts {
            total: row.total,
            pending: row.pending,
            running: row.running,
            retry_wait: row.retry_wait,
            succeeded: row.succeeded,
            dlq: row.dlq,
            files_generated: row.files_generated,
            files_reused: row.files_reused,
        })
    }

    async fn find_job(&self, job_key: &str) -> Result<Option<ExportJob>, StoreError> {
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            SELECT job_id, job_key, status, total_inputs, requested_at,
                   started_at, completed_at, error_message
            FROM export_jobs
            WHERE job_key = $1
            "#,
        )
        .bind(job_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(JobRow::into_job).transpose()
    }

    async fn job_units(&self, job_id: JobId) -> Result<Vec<ExportInput>, StoreError> {
        let rows: Vec<InputRow> = sqlx::query_as(
            r#"
            SELECT input_id, job_id, index_key, effective_date, asof_indicator,
                   status, attempt_count, next_retry_at, lease_owner, lease_until,
                   started_at, s3_path, is_reused, error_message
            FROM export_inputs
            WHERE job_id = $1
            ORDER BY input_id ASC
            "#,
        )
        .bind(job_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.into_iter().map(InputRow::into_input).collect()
    }
}
