//! Per-unit execution: reuse or generate, stream, upload, finalize.
//!
//! A unit is successful only after the upload is durably acknowledged. If
//! the process dies between upload and the terminal mark, the lease expires,
//! another worker re-runs the unit and overwrites the same deterministic
//! path; the second write is idempotent at the storage layer.

use std::sync::Arc;

use chrono::FixedOffset;
use futures::StreamExt as _;
use object_store::{ObjectStore, WriteMultipart};

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::csv;
use crate::error::UnitError;
use crate::finalizer::{DLQ_FAIL_MESSAGE, JobFinalizer};
use crate::lease::LeaseManager;
use crate::model::{Artifact, ClaimedUnit, JobId, JobStatus, WorkerId};
use crate::path::artifact_path;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::reuse::{ArtifactIndex, ReuseDecision};
use crate::store::{ExportSource, ExportStream, Store};

/// DLQ reason for a unit claimed after its job already went terminal.
const JOB_TERMINAL_MESSAGE: &str = "parent job terminal";

/// Bytes buffered before handing a chunk to the multipart writer.
const UPLOAD_CHUNK_BYTES: usize = 64 * 1024;

/// Cap on persisted error messages.
const ERROR_MESSAGE_MAX_CHARS: usize = 2_000;

pub struct Executor<S, Src> {
    store: S,
    source: Src,
    storage: Arc<dyn ObjectStore>,
    lease: LeaseManager<S>,
    index: ArtifactIndex<S>,
    finalizer: JobFinalizer<S>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    base_path: String,
}

impl<S, Src> Executor<S, Src>
where
    S: Store + Clone + Sync,
    Src: ExportSource + Sync,
{
    pub fn new(
        store: S,
        source: Src,
        storage: Arc<dyn ObjectStore>,
        lease: LeaseManager<S>,
        finalizer: JobFinalizer<S>,
        config: &EngineConfig,
        timezone: FixedOffset,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let index = ArtifactIndex::new(store.clone(), &config.reuse, timezone);
        let policy = RetryPolicy::new(&config.retry);
        Self {
            store,
            source,
            storage,
            lease,
            index,
            finalizer,
            policy,
            clock,
            base_path: config.storage.base_path.clone(),
        }
    }

    /// Execute one claimed unit to a terminal state. Never raises: every
    /// failure is persisted on the unit row or logged, and the worker lives.
    pub async fn execute(&self, unit: ClaimedUnit) {
        let worker = self.lease.worker().clone();
        tracing::debug!(
            input_id = %unit.input_id,
            job_id = %unit.job_id,
            index_key = %unit.key.index_key,
            attempt = unit.attempt_count,
            worker = %worker,
            "executing unit"
        );

        if let Err(error) = self
            .store
            .mark_job_running(unit.job_id, self.clock.now())
            .await
        {
            tracing::warn!(error = %error, job_id = %unit.job_id, "failed to mark job running");
        }

        match self.store.job_status(unit.job_id).await {
            // A FAILED parent may be mid-re-drive, so it does not
            // short-circuit; the claim predicate already vetted it.
            Ok(Some(JobStatus::Cancelled | JobStatus::Completed)) => {
                // The job is decided for good; the unit's output would be
                // unobservable. Dead-letter it so nothing dangles in RUNNING.
                match self
                    .store
                    .move_to_dlq(unit.input_id, &worker, JOB_TERMINAL_MESSAGE)
                    .await
                {
                    Ok(true) => {
                        tracing::info!(input_id = %unit.input_id, job_id = %unit.job_id, "unit dead-lettered: parent job terminal");
                    }
                    Ok(false) => {}
                    Err(error) => {
                        tracing::error!(error = %error, input_id = %unit.input_id, "failed to dead-letter unit of terminal job");
                    }
                }
                return;
            }
            Ok(_) => {}
            Err(error) => {
                self.handle_failure(&unit, &worker, UnitError::Store(error))
                    .await;
                return;
            }
        }

        let decision = match self.index.decide(&unit.key, self.clock.now()).await {
            Ok(decision) => decision,
            Err(error) => {
                self.handle_failure(&unit, &worker, UnitError::Store(error))
                    .await;
                return;
            }
        };

        match decision {
            ReuseDecision::Reuse(path) => self.reuse(&unit, &worker, path).await,
            ReuseDecision::Generate => self.generate(&unit, &worker).await,
        }
    }

    async fn reuse(&self, unit: &ClaimedUnit, worker: &WorkerId, path: String) {
        match self
            .store
            .mark_succeeded_reused(unit.input_id, worker, &path)
            .await
        {
            Ok(true) => {
                tracing::info!(input_id = %unit.input_id, path = %path, "unit succeeded (reused artifact)");
                self.fast_path(unit.job_id).await;
            }
            Ok(false) => {
                tracing::debug!(input_id = %unit.input_id, "reuse mark lost the lease; exiting");
            }
            Err(error) => {
                self.handle_failure(unit, worker, UnitError::Store(error))
                    .await;
            }
        }
    }

    async fn generate(&self, unit: &ClaimedUnit, worker: &WorkerId) {
        let path = artifact_path(&self.base_path, unit.job_id, &unit.key);

        let work = self.export_and_upload(unit, &path);
        let outcome = self.lease.run_with_renewal(unit.input_id, work).await;

        match outcome {
            Ok(()) => {}
            Err(UnitError::LeaseLost) => {
                tracing::debug!(input_id = %unit.input_id, "lease lost mid-generation; exiting without mutation");
                return;
            }
            Err(error) => {
                self.handle_failure(unit, worker, error).await;
                return;
            }
        }

        // Upload acknowledged; record the artifact before the terminal mark
        // so a crash here leaves a registry entry the re-run will overwrite.
        let artifact = Artifact {
            key: unit.key.clone(),
            s3_path: path.clone(),
            source_job_id: unit.job_id,
            generated_at: self.clock.now(),
        };
        if let Err(error) = self.store.upsert_artifact(&artifact).await {
            self.handle_failure(unit, worker, UnitError::Store(error))
                .await;
            return;
        }

        match self
            .store
            .mark_succeeded_generated(unit.input_id, worker, &path)
            .await
        {
            Ok(true) => {
                tracing::info!(input_id = %unit.input_id, path = %path, "unit succeeded (generated)");
                self.fast_path(unit.job_id).await;
            }
            Ok(false) => {
                tracing::debug!(input_id = %unit.input_id, "terminal mark lost the lease; exiting");
            }
            Err(error) => {
                self.handle_failure(unit, worker, UnitError::Store(error))
                    .await;
            }
        }
    }

    /// Stream procedure rows through the CSV encoder into a multipart upload.
    /// Rows are never materialized as a whole.
    async fn export_and_upload(&self, unit: &ClaimedUnit, path: &str) -> Result<(), UnitError> {
        let stream = self.source.export(&unit.key).await?;

        let location = object_store::path::Path::from(path);
        let upload = self.storage.put_multipart(&location).await?;
        let mut writer = WriteMultipart::new(upload);

        match Self::write_rows(&mut writer, stream).await {
            Ok(rows) => {
                writer.finish().await?;
                tracing::debug!(input_id = %unit.input_id, rows, path = %path, "artifact uploaded");
                Ok(())
            }
            Err(error) => {
                writer.abort().await.ok();
                Err(error)
            }
        }
    }

    async fn write_rows(
        writer: &mut WriteMultipart,
        stream: ExportStream,
    ) -> Result<u64, UnitError> {
        let mut buf = Vec::with_capacity(UPLOAD_CHUNK_BYTES);
        csv::encode_header(&stream.columns, &mut buf);

        let mut rows = stream.rows;
        let mut row_count = 0u64;
        while let Some(row) = rows.next().await {
            let row = row?;
            csv::encode_row(&row, &mut buf);
            row_count += 1;
            if buf.len() >= UPLOAD_CHUNK_BYTES {
                writer.write(&buf);
                buf.clear();
            }
        }
        if !buf.is_empty() {
            writer.write(&buf);
        }
        Ok(row_count)
    }

    async fn handle_failure(&self, unit: &ClaimedUnit, worker: &WorkerId, error: UnitError) {
        if matches!(error, UnitError::LeaseLost) {
            tracing::debug!(input_id = %unit.input_id, "work taken over; exiting");
            return;
        }

        let class = self.policy.classify(&error);
        let message: String = error.to_string().chars().take(ERROR_MESSAGE_MAX_CHARS).collect();
        let now = self.clock.now();
        let attempt = u32::try_from(unit.attempt_count).unwrap_or(u32::MAX);

        match self.policy.decide(class, attempt, now) {
            RetryDecision::Retry { next_attempt_at } => {
                match self
                    .store
                    .schedule_retry(unit.input_id, worker, next_attempt_at, &message)
                    .await
                {
                    Ok(true) => {
                        tracing::warn!(
                            input_id = %unit.input_id,
                            attempt,
                            next_attempt_at = %next_attempt_at,
                            error = %message,
                            "unit failed; retry scheduled"
                        );
                    }
                    Ok(false) => {
                        tracing::debug!(input_id = %unit.input_id, "retry scheduling lost the lease");
                    }
                    Err(store_error) => {
                        tracing::error!(error = %store_error, input_id = %unit.input_id, "failed to schedule retry");
                    }
                }
            }
            RetryDecision::Dlq => {
                match self
                    .store
                    .move_to_dlq(unit.input_id, worker, &message)
                    .await
                {
                    Ok(true) => {
                        tracing::error!(
                            input_id = %unit.input_id,
                            job_id = %unit.job_id,
                            attempt,
                            error = %message,
                            "unit moved to DLQ"
                        );
                        // Fail-fast: one dead unit fails the whole job.
                        if let Err(store_error) = self
                            .store
                            .fail_job(unit.job_id, DLQ_FAIL_MESSAGE, now)
                            .await
                        {
                            tracing::warn!(error = %store_error, job_id = %unit.job_id, "fail-fast job update failed");
                        }
                        self.fast_path(unit.job_id).await;
                    }
                    Ok(false) => {
                        tracing::debug!(input_id = %unit.input_id, "DLQ move lost the lease");
                    }
                    Err(store_error) => {
                        tracing::error!(error = %store_error, input_id = %unit.input_id, "failed to move unit to DLQ");
                    }
                }
            }
        }
    }

    /// Opportunistic completion attempt after a terminal unit transition.
    /// The periodic finalizer guarantees the outcome if this is missed.
    async fn fast_path(&self, job_id: JobId) {
        if let Err(error) = self.finalizer.try_finalize(job_id).await {
            tracing::debug!(error = %error, job_id = %job_id, "fast-path finalization failed");
        }
    }
}
