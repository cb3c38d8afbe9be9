//! Artifact reuse decision.
//!
//! Recent data is volatile and must be refreshed; older data is stable
//! enough to point at an artifact a prior job generated. The window is
//! evaluated against "today" in one configured zone so that every worker
//! agrees on which side of the boundary a date falls.

use chrono::{DateTime, Days, FixedOffset, Utc};

use crate::config::ReuseConfig;
use crate::model::InputKey;
use crate::store::{Store, StoreError};

/// What the executor should do for one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReuseDecision {
    Generate,
    /// Reuse the registered artifact at this path. No export call, no upload.
    Reuse(String),
}

/// Reuse registry lookup plus the window policy.
#[derive(Debug, Clone)]
pub struct ArtifactIndex<S> {
    store: S,
    enabled: bool,
    window_days: u32,
    timezone: FixedOffset,
}

impl<S> ArtifactIndex<S>
where
    S: Store + Sync,
{
    pub fn new(store: S, config: &ReuseConfig, timezone: FixedOffset) -> Self {
        Self {
            store,
            enabled: config.enabled,
            window_days: config.days,
            timezone,
        }
    }

    /// Decide before any storage or export work is done.
    ///
    /// Dates at exactly `today - days` regenerate; only strictly older dates
    /// reuse.
    pub async fn decide(
        &self,
        key: &InputKey,
        now: DateTime<Utc>,
    ) -> Result<ReuseDecision, StoreError> {
        if !self.enabled {
            return Ok(ReuseDecision::Generate);
        }
        let Some(artifact) = self.store.lookup_artifact(key).await? else {
            return Ok(ReuseDecision::Generate);
        };
        let today = now.with_timezone(&self.timezone).date_naive();
        let threshold = today
            .checked_sub_days(Days::new(u64::from(self.window_days)))
            .unwrap_or(chrono::NaiveDate::MIN);
        if key.effective_date.date() >= threshold {
            return Ok(ReuseDecision::Generate);
        }
        Ok(ReuseDecision::Reuse(artifact.s3_path))
    }
}
