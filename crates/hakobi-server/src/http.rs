//! HTTP surface: submit, status, cancel, re-drive.
//!
//! Thin over the core: handlers translate wire shapes and map errors onto
//! status codes; every state transition happens behind the store guards.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError, get, post, web};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use hakobi_core::admin::{Admin, CancelOutcome, JobStatusView};
use hakobi_core::model::{ExportInput, InputId, JobCounts};
use hakobi_core::store::StoreError;
use hakobi_core::submission::{SubmitError, SubmitItem, SubmitRequest, Submitter};
use hakobi_sqlx::PgStore;

pub struct AppState {
    pub submitter: Submitter<PgStore>,
    pub admin: Admin<PgStore>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(submit_job)
        .service(job_status)
        .service(cancel_job)
        .service(redrive_input);
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),
    #[error("job key already exists")]
    Conflict,
    #[error("{0}")]
    TooManyUnits(String),
    #[error("not found")]
    NotFound,
    #[error("job is already terminal")]
    AlreadyTerminal,
    #[error("internal error")]
    Internal,
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict | ApiError::AlreadyTerminal => StatusCode::CONFLICT,
            ApiError::TooManyUnits(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code())
            .json(serde_json::json!({ "error": self.to_string() }))
    }
}

impl From<SubmitError> for ApiError {
    fn from(error: SubmitError) -> Self {
        match error {
            SubmitError::KeyConflict => ApiError::Conflict,
            SubmitError::TooManyUnits { .. } => ApiError::TooManyUnits(error.to_string()),
            SubmitError::Store(store_error) => {
                tracing::error!(error = %store_error, "submission failed in the store");
                ApiError::Internal
            }
            other => ApiError::Validation(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        tracing::error!(error = %error, "store operation failed");
        ApiError::Internal
    }
}

#[derive(Debug, Deserialize)]
struct SubmitBody {
    items: Vec<SubmitItemBody>,
    output: Option<OutputBody>,
}

#[derive(Debug, Deserialize)]
struct SubmitItemBody {
    #[serde(rename = "indexKey")]
    index_key: String,
    #[serde(rename = "effectiveDate")]
    effective_date: u32,
    #[serde(rename = "asofindicator")]
    asof_indicator: String,
}

#[derive(Debug, Deserialize)]
struct OutputBody {
    format: String,
}

#[post("/jobs")]
async fn submit_job(
    state: web::Data<AppState>,
    body: web::Json<SubmitBody>,
) -> Result<HttpResponse, ApiError> {
    let body = body.into_inner();
    if let Some(output) = &body.output {
        if !output.format.eq_ignore_ascii_case("csv") {
            return Err(ApiError::Validation(format!(
                "unsupported output format {:?}",
                output.format
            )));
        }
    }

    let request = SubmitRequest {
        items: body
            .items
            .into_iter()
            .map(|item| SubmitItem {
                index_key: item.index_key,
                effective_date: item.effective_date,
                asof_indicator: item.asof_indicator,
            })
            .collect(),
    };
    let receipt = state.submitter.submit(request).await?;

    Ok(HttpResponse::Accepted().json(serde_json::json!({
        "jobId": receipt.job_key,
        "status": receipt.status,
    })))
}

#[derive(Debug, Serialize)]
struct CountsBody {
    total: i64,
    pending: i64,
    running: i64,
    #[serde(rename = "retryWait")]
    retry_wait: i64,
    succeeded: i64,
    dlq: i64,
    #[serde(rename = "filesGenerated")]
    files_generated: i64,
    #[serde(rename = "filesReused")]
    files_reused: i64,
}

impl From<JobCounts> for CountsBody {
    fn from(counts: JobCounts) -> Self {
        Self {
            total: counts.total,
            pending: counts.pending,
            running: counts.running,
            retry_wait: counts.retry_wait,
            succeeded: counts.succeeded,
            dlq: counts.dlq,
            files_generated: counts.files_generated,
            files_reused: counts.files_reused,
        }
    }
}

#[derive(Debug, Serialize)]
struct InputBody {
    #[serde(rename = "inputId")]
    input_id: String,
    #[serde(rename = "indexKey")]
    index_key: String,
    #[serde(rename = "effectiveDate")]
    effective_date: u32,
    #[serde(rename = "asofindicator")]
    asof_indicator: String,
    status: &'static str,
    #[serde(rename = "attemptCount")]
    attempt_count: i32,
    #[serde(rename = "isReused")]
    is_reused: Option<bool>,
    #[serde(rename = "s3Path")]
    s3_path: Option<String>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

impl From<ExportInput> for InputBody {
    fn from(input: ExportInput) -> Self {
        Self {
            input_id: input.input_id.to_string(),
            index_key: input.key.index_key,
            effective_date: input.key.effective_date.yyyymmdd(),
            asof_indicator: input.key.asof_indicator,
            status: input.status.as_str(),
            attempt_count: input.attempt_count,
            is_reused: input.is_reused,
            s3_path: input.s3_path,
            error_message: input.error_message,
        }
    }
}

#[derive(Debug, Serialize)]
struct JobStatusBody {
    #[serde(rename = "jobId")]
    job_id: String,
    status: &'static str,
    #[serde(rename = "totalInputs")]
    total_inputs: i32,
    #[serde(rename = "requestedAt")]
    requested_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "startedAt")]
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "completedAt")]
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
    counts: CountsBody,
    inputs: Vec<InputBody>,
}

impl From<JobStatusView> for JobStatusBody {
    fn from(view: JobStatusView) -> Self {
        let status = view.reporting_status();
        Self {
            job_id: view.job.job_key,
            status,
            total_inputs: view.job.total_inputs,
            requested_at: view.job.requested_at,
            started_at: view.job.started_at,
            completed_at: view.job.completed_at,
            error_message: view.job.error_message,
            counts: view.counts.into(),
            inputs: view.units.into_iter().map(InputBody::from).collect(),
        }
    }
}

#[get("/jobs/{job_key}")]
async fn job_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let view = state
        .admin
        .job_status(&path)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok(HttpResponse::Ok().json(JobStatusBody::from(view)))
}

#[post("/jobs/{job_key}/cancel")]
async fn cancel_job(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    match state.admin.cancel_job(&path).await? {
        CancelOutcome::Cancelled => Ok(HttpResponse::Ok().json(serde_json::json!({
            "jobId": path.into_inner(),
            "status": "CANCELLED",
        }))),
        CancelOutcome::AlreadyTerminal => Err(ApiError::AlreadyTerminal),
        CancelOutcome::NotFound => Err(ApiError::NotFound),
    }
}

#[post("/inputs/{input_id}/redrive")]
async fn redrive_input(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ApiError> {
    let input_id = path
        .parse::<Uuid>()
        .map_err(|_| ApiError::Validation("input id must be a uuid".to_string()))?;
    let reset = state.admin.redrive_unit(InputId(input_id)).await?;
    if !reset {
        // Missing, or not in DLQ: only dead-lettered units can be re-driven.
        return Err(ApiError::NotFound);
    }
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "inputId": path.into_inner(),
        "status": "PENDING",
    })))
}
