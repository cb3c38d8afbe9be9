//! Deterministic object-storage paths.
//!
//! `<base>/YYYY/MM/DD/<job_id>/<KEY>_<YYYYMMDD>_<ASOF>.csv`, date segments
//! taken from the effective date. No randomness: repeated generation for the
//! same unit overwrites the same object, which is what makes at-least-once
//! execution safe at the storage layer.

use chrono::Datelike;

use crate::model::{InputKey, JobId};

/// Build the artifact path for a unit generated by `job_id`.
pub fn artifact_path(base_path: &str, job_id: JobId, key: &InputKey) -> String {
    let date = key.effective_date.date();
    let base = base_path.trim_matches('/');
    let file = format!(
        "{}_{}_{}.csv",
        key.index_key, key.effective_date, key.asof_indicator
    );
    if base.is_empty() {
        format!(
            "{:04}/{:02}/{:02}/{}/{}",
            date.year(),
            date.month(),
            date.day(),
            job_id,
            file
        )
    } else {
        format!(
            "{}/{:04}/{:02}/{:02}/{}/{}",
            base,
            date.year(),
            date.month(),
            date.day(),
            job_id,
            file
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EffectiveDate;
    use uuid::Uuid;

    fn key(index_key: &str, date: u32, asof: &str) -> InputKey {
        InputKey {
            index_key: index_key.to_string(),
            effective_date: EffectiveDate::from_yyyymmdd(date).unwrap(),
            asof_indicator: asof.to_string(),
        }
    }

    #[test]
    fn path_uses_effective_date_segments() {
        let job = JobId(Uuid::nil());
        let path = artifact_path("exports", job, &key("DEF", 20260110, "CLS"));
        assert_eq!(
            path,
            format!("exports/2026/01/10/{}/DEF_20260110_CLS.csv", Uuid::nil())
        );
    }

    #[test]
    fn path_is_stable_for_same_inputs() {
        let job = JobId(Uuid::nil());
        let a = artifact_path("exports/", job, &key("ABC", 20200101, "CLS"));
        let b = artifact_path("exports", job, &key("ABC", 20200101, "CLS"));
        assert_eq!(a, b);
    }

    #[test]
    fn empty_base_is_allowed() {
        let job = JobId(Uuid::nil());
        let path = artifact_path("", job, &key("ABC", 20200101, "CLS"));
        assert!(path.starts_with("2020/01/01/"));
    }
}
