//! Job creation: validate, dedup, insert atomically.
//!
//! Validation failures reject the whole submission synchronously; nothing is
//! written. The job row and every unit row land in one transaction.

use std::collections::HashSet;
use std::sync::Arc;

use crate::clock::Clock;
use crate::model::{EffectiveDate, ExportJob, InputId, InputKey, JobId, JobStatus};
use crate::store::{CreateJobError, NewUnit, Store, StoreError};

/// One requested export, as received from the client.
#[derive(Debug, Clone)]
pub struct SubmitItem {
    pub index_key: String,
    /// `yyyymmdd`
    pub effective_date: u32,
    pub asof_indicator: String,
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub items: Vec<SubmitItem>,
}

#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub job_key: String,
    pub status: JobStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("submission contains no items")]
    Empty,
    #[error("item {position}: index key is blank")]
    BlankKey { position: usize },
    #[error("item {position}: asof indicator is blank")]
    BlankAsof { position: usize },
    #[error("item {position}: {value} is not a calendar date (expected yyyymmdd)")]
    InvalidDate { position: usize, value: u32 },
    #[error("{count} units exceed the per-job cap of {max}")]
    TooManyUnits { count: usize, max: usize },
    #[error("job key already exists")]
    KeyConflict,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validate and deduplicate; duplicates of the same natural key keep the
/// first occurrence. The cap applies to the deduplicated count.
fn validate_items(items: &[SubmitItem], max_units: usize) -> Result<Vec<NewUnit>, SubmitError> {
    if items.is_empty() {
        return Err(SubmitError::Empty);
    }

    let mut seen = HashSet::new();
    let mut units = Vec::with_capacity(items.len());
    for (position, item) in items.iter().enumerate() {
        let index_key = item.index_key.trim();
        if index_key.is_empty() {
            return Err(SubmitError::BlankKey { position });
        }
        let asof_indicator = item.asof_indicator.trim();
        if asof_indicator.is_empty() {
            return Err(SubmitError::BlankAsof { position });
        }
        let effective_date = EffectiveDate::from_yyyymmdd(item.effective_date).ok_or(
            SubmitError::InvalidDate {
                position,
                value: item.effective_date,
            },
        )?;

        let key = InputKey {
            index_key: index_key.to_string(),
            effective_date,
            asof_indicator: asof_indicator.to_string(),
        };
        if !seen.insert(key.clone()) {
            continue;
        }
        units.push(NewUnit {
            input_id: InputId::generate(),
            key,
        });
    }

    if units.len() > max_units {
        return Err(SubmitError::TooManyUnits {
            count: units.len(),
            max: max_units,
        });
    }
    Ok(units)
}

pub struct Submitter<S> {
    store: S,
    clock: Arc<dyn Clock>,
    max_units_per_job: usize,
}

impl<S> Submitter<S>
where
    S: Store + Sync,
{
    pub fn new(store: S, max_units_per_job: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            max_units_per_job,
        }
    }

    /// Create the job and all of its units. Returns the client-visible key.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitReceipt, SubmitError> {
        let units = validate_items(&request.items, self.max_units_per_job)?;

        let seq = self.store.next_job_seq().await?;
        let now = self.clock.now();
        let job_key = format!("J{}_{}", now.format("%Y%m%d"), seq);
        let job = ExportJob {
            job_id: JobId::generate(),
            job_key: job_key.clone(),
            status: JobStatus::Submitted,
            total_inputs: units.len() as i32,
            requested_at: now,
            started_at: None,
            completed_at: None,
            error_message: None,
        };

        match self.store.create_job(&job, &units).await {
            Ok(()) => {
                tracing::info!(
                    job_key = %job_key,
                    job_id = %job.job_id,
                    units = units.len(),
                    "job submitted"
                );
                Ok(SubmitReceipt {
                    job_key,
                    status: JobStatus::Submitted,
                })
            }
            Err(CreateJobError::KeyConflict) => Err(SubmitError::KeyConflict),
            Err(CreateJobError::Store(error)) => Err(SubmitError::Store(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(key: &str, date: u32, asof: &str) -> SubmitItem {
        SubmitItem {
            index_key: key.to_string(),
            effective_date: date,
            asof_indicator: asof.to_string(),
        }
    }

    #[test]
    fn empty_submission_is_rejected() {
        assert!(matches!(validate_items(&[], 10), Err(SubmitError::Empty)));
    }

    #[test]
    fn blank_key_is_rejected() {
        let items = [item("  ", 20260110, "CLS")];
        assert!(matches!(
            validate_items(&items, 10),
            Err(SubmitError::BlankKey { position: 0 })
        ));
    }

    #[test]
    fn non_calendar_date_is_rejected() {
        let items = [item("ABC", 20260230, "CLS")];
        assert!(matches!(
            validate_items(&items, 10),
            Err(SubmitError::InvalidDate { value: 20260230, .. })
        ));
    }

    #[test]
    fn duplicates_collapse_to_one_unit() {
        let items = [
            item("ABC", 20260110, "CLS"),
            item(" ABC ", 20260110, "CLS"),
            item("ABC", 20260111, "CLS"),
        ];
        let units = validate_items(&items, 10).unwrap();
        assert_eq!(units.len(), 2);
    }

    #[test]
    fn cap_is_inclusive() {
        let at_cap: Vec<_> = (0..10).map(|i| item(&format!("K{i}"), 20260110, "CLS")).collect();
        assert_eq!(validate_items(&at_cap, 10).unwrap().len(), 10);

        let over: Vec<_> = (0..11).map(|i| item(&format!("K{i}"), 20260110, "CLS")).collect();
        assert!(matches!(
            validate_items(&over, 10),
            Err(SubmitError::TooManyUnits { count: 11, max: 10 })
        ));
    }
}
